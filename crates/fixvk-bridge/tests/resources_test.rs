//! Integration test: resource translation
//!
//! Buffers, textures and targets created through the bridge: format
//! translation, memory exhaustion without leaks, and release deferred until
//! the GPU has finished with the object.
//!
//! Run with: cargo test -p fixvk-bridge --test resources_test -- --nocapture

use std::num::NonZeroIsize;

use ash::vk;
use fixvk_bridge::{
    Bridge, BridgeError, ClearFlags, D3dColor, ErrorClass, LegacyFormat, PrimitiveType, Usage,
};
use fixvk_core::FixvkConfig;
use fixvk_driver::HeadlessDriver;
use fixvk_protocol::types::ImageState;
use fixvk_protocol::{GpuHandle, RecordedCommand, ResourceType, WindowTarget};

fn window() -> WindowTarget {
    WindowTarget::win32(NonZeroIsize::new(0x6000).unwrap())
}

fn make_bridge() -> Bridge<HeadlessDriver> {
    let mut bridge = Bridge::new(HeadlessDriver::new(), FixvkConfig::default());
    bridge.initialize(&window(), 640, 480).expect("initialize");
    bridge
}

fn new_handles(before: &[GpuHandle], after: Vec<GpuHandle>) -> Vec<GpuHandle> {
    after.into_iter().filter(|h| !before.contains(h)).collect()
}

#[test]
fn test_vertex_buffer_contents_reach_memory() {
    let mut bridge = make_bridge();
    let before = bridge.driver().live_handles(ResourceType::Buffer);
    let vb = bridge.create_vertex_buffer(16, Usage::DYNAMIC).unwrap();
    let buffer = new_handles(&before, bridge.driver().live_handles(ResourceType::Buffer))[0];

    bridge.update_buffer(vb, 4, &[1, 2, 3, 4]).unwrap();
    let contents = bridge.driver().buffer_contents(buffer).unwrap();
    assert_eq!(&contents[..8], &[0, 0, 0, 0, 1, 2, 3, 4]);

    match bridge.update_buffer(vb, 14, &[0; 4]) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    let desc = bridge.driver().buffer_desc(buffer).unwrap();
    assert!(desc.usage.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
}

#[test]
fn test_texture_formats_translate() {
    let mut bridge = make_bridge();
    for (legacy, expected) in [
        (LegacyFormat::A8R8G8B8, vk::Format::B8G8R8A8_UNORM),
        (LegacyFormat::R5G6B5, vk::Format::R5G6B5_UNORM_PACK16),
        (LegacyFormat::Dxt1, vk::Format::BC1_RGBA_UNORM_BLOCK),
        (LegacyFormat::Dxt5, vk::Format::BC3_UNORM_BLOCK),
    ] {
        let before = bridge.driver().live_handles(ResourceType::Image);
        bridge.create_texture(64, 64, legacy).unwrap();
        let image = new_handles(&before, bridge.driver().live_handles(ResourceType::Image))[0];
        let desc = bridge.driver().image_desc(image).unwrap();
        assert_eq!(desc.format, expected, "{:?}", legacy);
    }
}

#[test]
fn test_unsupported_formats_are_reported() {
    let mut bridge = make_bridge();
    let live = bridge.driver().live_objects();
    match bridge.create_texture(16, 16, LegacyFormat::X1R5G5B5) {
        Err(e @ BridgeError::UnsupportedFormat(LegacyFormat::X1R5G5B5)) => {
            assert_eq!(e.class(), ErrorClass::ResourceCreationFailure);
        }
        other => panic!("expected UnsupportedFormat, got {:?}", other),
    }
    match bridge.create_index_buffer(64, Usage::empty(), LegacyFormat::A8R8G8B8) {
        Err(BridgeError::UnsupportedFormat(_)) => {}
        other => panic!("expected UnsupportedFormat, got {:?}", other),
    }
    match bridge.create_render_target(16, 16, LegacyFormat::Dxt1) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    match bridge.create_depth_stencil(16, 16, LegacyFormat::A8R8G8B8) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    assert_eq!(bridge.driver().live_objects(), live);
}

#[test]
fn test_out_of_memory_leaves_no_orphans() {
    let mut bridge = make_bridge();
    let live = bridge.driver().live_objects();
    let allocated = bridge.driver().allocated_bytes();
    bridge
        .driver_mut()
        .set_memory_budget(Some(allocated + 1024));

    match bridge.create_vertex_buffer(1 << 20, Usage::empty()) {
        Err(BridgeError::OutOfDeviceMemory) => {}
        other => panic!("expected OutOfDeviceMemory, got {:?}", other),
    }
    match bridge.create_texture(512, 512, LegacyFormat::A8R8G8B8) {
        Err(BridgeError::OutOfDeviceMemory) => {}
        other => panic!("expected OutOfDeviceMemory, got {:?}", other),
    }
    assert_eq!(bridge.driver().live_objects(), live);
    assert_eq!(bridge.driver().allocated_bytes(), allocated);
    assert!(!bridge.is_lost());

    bridge.driver_mut().set_memory_budget(None);
    bridge.create_vertex_buffer(1 << 20, Usage::empty()).unwrap();
}

#[test]
fn test_texture_update_uploads_through_staging() {
    let mut bridge = make_bridge();
    let texture = bridge.create_texture(4, 4, LegacyFormat::A8R8G8B8).unwrap();
    let buffers = bridge.driver().live_count(ResourceType::Buffer);
    let submits = bridge.driver().submissions().len();

    bridge.update_image(texture, &[0x80; 64]).unwrap();
    assert_eq!(bridge.driver().submissions().len(), submits + 1);
    let upload = bridge.driver().submissions().last().unwrap();
    assert_eq!(
        upload.count(|c| matches!(c, RecordedCommand::CopyBufferToImage { .. })),
        1
    );
    match upload.commands.last() {
        Some(RecordedCommand::ImageBarrier { to, .. }) => assert_eq!(*to, ImageState::ShaderRead),
        other => panic!("expected a barrier back to shader reads, got {:?}", other),
    }
    // The staging buffer is gone once the upload completed.
    assert_eq!(bridge.driver().live_count(ResourceType::Buffer), buffers);

    match bridge.update_image(texture, &[0; 63]) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    let dxt = bridge.create_texture(8, 8, LegacyFormat::Dxt1).unwrap();
    // Four 4x4 blocks of eight bytes.
    bridge.update_image(dxt, &[0; 32]).unwrap();
}

#[test]
fn test_release_mid_scene_waits_for_the_frame() {
    let mut bridge = make_bridge();
    let before = bridge.driver().live_handles(ResourceType::Buffer);
    let vb = bridge.create_vertex_buffer(60, Usage::empty()).unwrap();
    let buffer = new_handles(&before, bridge.driver().live_handles(ResourceType::Buffer))[0];

    bridge.set_vertex_buffer(Some(vb), 0).unwrap();
    bridge.begin_scene().unwrap();
    bridge
        .draw_primitive(PrimitiveType::TriangleList, 0, 1)
        .unwrap();
    bridge.release_buffer(vb).unwrap();
    assert!(bridge.state_vector().stream.is_none());
    assert!(bridge.driver().is_live(buffer));
    bridge.end_scene().unwrap();
    bridge.present().unwrap();
    assert!(bridge.driver().is_live(buffer));
    assert_eq!(bridge.retired_count(), 2);

    // The next scene waits on that frame's fence and collects.
    bridge.begin_scene().unwrap();
    assert!(!bridge.driver().is_live(buffer));
    assert_eq!(bridge.retired_count(), 0);
    bridge.end_scene().unwrap();
    bridge.present().unwrap();
}

#[test]
fn test_release_of_idle_resource_is_immediate() {
    let mut bridge = make_bridge();
    let before = bridge.driver().live_handles(ResourceType::Buffer);
    let vb = bridge.create_vertex_buffer(60, Usage::empty()).unwrap();
    let buffer = new_handles(&before, bridge.driver().live_handles(ResourceType::Buffer))[0];
    bridge.release_buffer(vb).unwrap();
    assert!(!bridge.driver().is_live(buffer));
    assert_eq!(bridge.retired_count(), 0);
}

#[test]
fn test_released_render_target_takes_its_framebuffer() {
    let mut bridge = make_bridge();
    let rt = bridge
        .create_render_target(128, 128, LegacyFormat::X8R8G8B8)
        .unwrap();
    bridge.set_render_targets(Some(rt), None).unwrap();
    bridge.begin_scene().unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();
    // Three swap framebuffers plus the offscreen one.
    assert_eq!(bridge.driver().live_count(ResourceType::Framebuffer), 4);

    bridge.release_image(rt).unwrap();
    assert!(bridge.state_vector().render_target.is_none());
    bridge.begin_scene().unwrap();
    assert_eq!(bridge.driver().live_count(ResourceType::Framebuffer), 3);
    bridge.end_scene().unwrap();
    bridge.present().unwrap();
    let scene = bridge.driver().submissions().last().unwrap();
    assert_eq!(
        scene.count(|c| matches!(c, RecordedCommand::BlitImage { .. })),
        0
    );
}

#[test]
fn test_explicit_depth_stencil_on_back_buffer() {
    let mut bridge = make_bridge();
    let depth = bridge
        .create_depth_stencil(640, 480, LegacyFormat::D24S8)
        .unwrap();
    bridge.set_render_targets(None, Some(depth)).unwrap();
    bridge.begin_scene().unwrap();
    bridge
        .clear(
            &[],
            ClearFlags::ZBUFFER | ClearFlags::STENCIL,
            D3dColor::default(),
            1.0,
            0x7f,
        )
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();

    let scene = bridge.driver().submissions().last().unwrap();
    let render_pass = match &scene.commands[0] {
        RecordedCommand::BeginRenderPass { render_pass, .. } => *render_pass,
        other => panic!("expected BeginRenderPass, got {:?}", other),
    };
    let desc = bridge.driver().render_pass_desc(render_pass).unwrap();
    assert_eq!(desc.depth_format, Some(vk::Format::D24_UNORM_S8_UINT));
    assert_eq!(desc.color_final, ImageState::Present);
    match scene
        .commands
        .iter()
        .find(|c| matches!(c, RecordedCommand::ClearAttachments { .. }))
    {
        Some(RecordedCommand::ClearAttachments { attachments, .. }) => {
            assert_eq!(attachments.len(), 1);
            assert_eq!(
                attachments[0].aspect,
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
            );
        }
        other => panic!("expected ClearAttachments, got {:?}", other),
    }

    // A depth buffer smaller than the target is refused.
    let small = bridge
        .create_depth_stencil(64, 64, LegacyFormat::D16)
        .unwrap();
    let rt = bridge
        .create_render_target(128, 128, LegacyFormat::A8R8G8B8)
        .unwrap();
    match bridge.set_render_targets(Some(rt), Some(small)) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
}

#[test]
fn test_mid_scene_texture_update_runs_before_the_frame() {
    let mut bridge = make_bridge();
    let texture = bridge.create_texture(4, 4, LegacyFormat::A8R8G8B8).unwrap();
    bridge.set_texture(0, Some(texture)).unwrap();
    let submits = bridge.driver().submissions().len();

    bridge.begin_scene().unwrap();
    bridge.update_image(texture, &[0x10; 64]).unwrap();
    let vertices = [0u8; 60];
    bridge
        .draw_primitive_up(PrimitiveType::TriangleList, 1, &vertices, 20)
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();

    let submissions = bridge.driver().submissions();
    assert_eq!(submissions.len(), submits + 2);
    assert_eq!(
        submissions[submits].count(|c| matches!(c, RecordedCommand::CopyBufferToImage { .. })),
        1
    );
    assert_eq!(
        submissions[submits + 1].count(|c| matches!(c, RecordedCommand::Draw { .. })),
        1
    );
}
