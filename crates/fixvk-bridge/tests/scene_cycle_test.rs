//! Integration test: scene cycle
//!
//! Drives BeginScene / draws / EndScene / Present through the bridge against
//! the headless driver and checks what reaches the GPU: one render pass and
//! one submit per scene, swap image rotation, clears and offscreen targets.
//!
//! Run with: cargo test -p fixvk-bridge --test scene_cycle_test -- --nocapture

use std::num::NonZeroIsize;

use ash::vk;

use fixvk_bridge::{
    Bridge, ClearFlags, D3dColor, D3dRect, Fvf, IndexData, LegacyFormat, PrimitiveType, Usage,
};
use fixvk_core::FixvkConfig;
use fixvk_driver::HeadlessDriver;
use fixvk_protocol::commands::ClearAttachment;
use fixvk_protocol::types::{ClearValue, Extent2D, ImageState, Rect2D};
use fixvk_protocol::{RecordedCommand, ResourceType, WindowTarget};

fn window() -> WindowTarget {
    WindowTarget::win32(NonZeroIsize::new(0x1000).unwrap())
}

fn make_bridge(width: u32, height: u32) -> Bridge<HeadlessDriver> {
    let mut bridge = Bridge::new(HeadlessDriver::new(), FixvkConfig::default());
    bridge
        .initialize(&window(), width, height)
        .expect("initialize");
    bridge
}

/// Three XYZ|TEX1 vertices.
fn triangle() -> Vec<u8> {
    let vertices: [f32; 15] = [
        0.0, 0.5, 0.0, 0.5, 0.0, //
        0.5, -0.5, 0.0, 1.0, 1.0, //
        -0.5, -0.5, 0.0, 0.0, 1.0,
    ];
    bytemuck::cast_slice(&vertices).to_vec()
}

fn frame(bridge: &mut Bridge<HeadlessDriver>) {
    bridge.begin_scene().expect("begin_scene");
    bridge
        .draw_primitive_up(PrimitiveType::TriangleList, 1, &triangle(), 20)
        .expect("draw");
    bridge.end_scene().expect("end_scene");
    bridge.present().expect("present");
}

#[test]
fn test_scene_records_one_pass_and_one_submit() {
    let mut bridge = make_bridge(640, 480);
    let vb = bridge.create_vertex_buffer(60, Usage::WRITEONLY).unwrap();
    bridge.update_buffer(vb, 0, &triangle()).unwrap();
    let ib = bridge
        .create_index_buffer(6, Usage::WRITEONLY, LegacyFormat::Index16)
        .unwrap();
    bridge
        .update_buffer(ib, 0, bytemuck::cast_slice(&[0u16, 1, 2]))
        .unwrap();
    let before = bridge.driver().submissions().len();

    bridge.begin_scene().unwrap();
    bridge.set_vertex_buffer(Some(vb), 0).unwrap();
    bridge.set_index_buffer(Some(ib), 0).unwrap();
    bridge
        .draw_primitive(PrimitiveType::TriangleList, 0, 1)
        .unwrap();
    bridge
        .draw_indexed_primitive(PrimitiveType::TriangleList, 0, 3, 0, 1)
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();

    let submissions = bridge.driver().submissions();
    assert_eq!(submissions.len(), before + 1);
    let scene = submissions.last().unwrap();
    let passes = scene.count(|c| matches!(c, RecordedCommand::BeginRenderPass { .. }));
    let ends = scene.count(|c| matches!(c, RecordedCommand::EndRenderPass));
    assert_eq!((passes, ends), (1, 1));
    assert_eq!(scene.count(|c| matches!(c, RecordedCommand::Draw { .. })), 1);
    assert_eq!(
        scene.count(|c| matches!(c, RecordedCommand::DrawIndexed { .. })),
        1
    );
    // Both draws share a pipeline and a vertex buffer, so each is bound once.
    assert_eq!(
        scene.count(|c| matches!(c, RecordedCommand::BindPipeline { .. })),
        1
    );
    assert_eq!(
        scene.count(|c| matches!(c, RecordedCommand::BindVertexBuffer { .. })),
        1
    );
    assert_eq!(bridge.stats().draws_recorded, 2);
    assert_eq!(bridge.stats().frames_presented, 1);
}

#[test]
fn test_indexed_up_triangle_end_to_end() {
    let mut bridge = make_bridge(1920, 1080);
    let (_, desc, images) = bridge.driver().current_swapchain().unwrap();
    assert_eq!(desc.extent, Extent2D::new(1920, 1080));
    assert_eq!(images.len(), 3);

    let vb = bridge.create_vertex_buffer(60, Usage::empty()).unwrap();
    bridge.update_buffer(vb, 0, &triangle()).unwrap();
    bridge.set_vertex_buffer(Some(vb), 20).unwrap();

    bridge.begin_scene().unwrap();
    bridge
        .draw_indexed_primitive_up(
            PrimitiveType::TriangleList,
            0,
            3,
            1,
            IndexData::U16(&[0, 1, 2]),
            &triangle(),
            20,
        )
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();

    assert_eq!(bridge.driver().submissions().len(), 1);
    let presents = bridge.driver().presents();
    assert_eq!(presents.len(), 1);
    assert!(presents[0].result.is_ok());
    let first = presents[0].desc.image_index;

    let scene = &bridge.driver().submissions()[0];
    match scene
        .commands
        .iter()
        .find(|c| matches!(c, RecordedCommand::DrawIndexed { .. }))
    {
        Some(RecordedCommand::DrawIndexed {
            index_count,
            vertex_offset,
            ..
        }) => {
            assert_eq!(*index_count, 3);
            assert_eq!(*vertex_offset, 0);
        }
        other => panic!("expected DrawIndexed, got {:?}", other),
    }
    // The UP draw unbinds stream 0.
    assert!(bridge.state_vector().stream.is_none());

    bridge.set_vertex_buffer(Some(vb), 20).unwrap();
    bridge.begin_scene().unwrap();
    bridge
        .draw_primitive(PrimitiveType::TriangleList, 0, 1)
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();

    let second = bridge.driver().presents()[1].desc.image_index;
    assert_eq!(second, (first + 1) % 3);
}

#[test]
fn test_present_rotates_through_swap_images() {
    let mut bridge = make_bridge(800, 600);
    for _ in 0..6 {
        frame(&mut bridge);
    }
    let indices: Vec<u32> = bridge
        .driver()
        .presents()
        .iter()
        .map(|p| p.desc.image_index)
        .collect();
    assert_eq!(indices, vec![0, 1, 2, 0, 1, 2]);
    assert_eq!(bridge.stats().frames_submitted, 6);
    assert_eq!(bridge.stats().frames_presented, 6);
}

#[test]
fn test_clear_outside_scene_sets_load_values() {
    let mut bridge = make_bridge(640, 480);
    bridge
        .clear(
            &[],
            ClearFlags::TARGET | ClearFlags::ZBUFFER,
            D3dColor::argb(255, 255, 0, 0),
            0.5,
            0,
        )
        .unwrap();
    bridge.begin_scene().unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();

    let scene = bridge.driver().submissions().last().unwrap();
    match &scene.commands[0] {
        RecordedCommand::BeginRenderPass { clear_values, .. } => {
            assert_eq!(clear_values[0], ClearValue::Color([1.0, 0.0, 0.0, 1.0]));
            match clear_values.get(1) {
                Some(ClearValue::DepthStencil { depth, .. }) => assert_eq!(*depth, 0.5),
                other => panic!("expected a depth clear value, got {:?}", other),
            }
        }
        other => panic!("expected BeginRenderPass, got {:?}", other),
    }
}

#[test]
fn test_clear_inside_scene_records_clear_attachments() {
    let mut bridge = make_bridge(640, 480);
    bridge.begin_scene().unwrap();
    bridge
        .clear(
            &[],
            ClearFlags::TARGET | ClearFlags::ZBUFFER,
            D3dColor::argb(255, 0, 0, 255),
            1.0,
            0,
        )
        .unwrap();
    bridge
        .clear(
            &[D3dRect {
                x1: 600,
                y1: 400,
                x2: 800,
                y2: 800,
            }],
            ClearFlags::TARGET,
            D3dColor::default(),
            1.0,
            0,
        )
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();

    let scene = bridge.driver().submissions().last().unwrap();
    let clears: Vec<(&Vec<ClearAttachment>, &Vec<Rect2D>)> = scene
        .commands
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::ClearAttachments { attachments, rects } => Some((attachments, rects)),
            _ => None,
        })
        .collect();
    assert_eq!(clears.len(), 2);

    let (attachments, rects) = clears[0];
    assert_eq!(attachments.len(), 2);
    assert_eq!(rects, &vec![Rect2D::new(0, 0, 640, 480)]);

    // Rects are clipped to the target.
    let (attachments, rects) = clears[1];
    assert_eq!(attachments.len(), 1);
    assert_eq!(rects, &vec![Rect2D::new(600, 400, 40, 80)]);
}

#[test]
fn test_clear_rejects_depth_outside_unit_range() {
    let mut bridge = make_bridge(640, 480);
    let err = bridge
        .clear(&[], ClearFlags::ZBUFFER, D3dColor::default(), 1.5, 0)
        .unwrap_err();
    assert!(matches!(err, fixvk_bridge::BridgeError::InvalidArgument(_)));
}

#[test]
fn test_offscreen_target_blits_to_back_buffer() {
    let mut bridge = make_bridge(640, 480);
    let rt = bridge
        .create_render_target(256, 256, LegacyFormat::A8R8G8B8)
        .unwrap();
    bridge.set_render_targets(Some(rt), None).unwrap();
    bridge.set_vertex_format(Fvf::XYZ | Fvf::TEX1).unwrap();
    frame(&mut bridge);

    let scene = bridge.driver().submissions().last().unwrap();
    assert_eq!(
        scene.count(|c| matches!(c, RecordedCommand::BlitImage { .. })),
        1
    );
    let render_pass = match &scene.commands[0] {
        RecordedCommand::BeginRenderPass {
            render_pass,
            render_area,
            ..
        } => {
            assert_eq!(*render_area, Rect2D::new(0, 0, 256, 256));
            *render_pass
        }
        other => panic!("expected BeginRenderPass, got {:?}", other),
    };
    let desc = bridge.driver().render_pass_desc(render_pass).unwrap();
    assert_eq!(desc.color_final, ImageState::TransferSrc);
    assert_eq!(desc.depth_format, None);

    // Back to the back buffer.
    bridge.set_render_targets(None, None).unwrap();
    frame(&mut bridge);
    let scene = bridge.driver().submissions().last().unwrap();
    assert_eq!(
        scene.count(|c| matches!(c, RecordedCommand::BlitImage { .. })),
        0
    );
}

#[test]
fn test_opaque_render_target_attaches_an_unswizzled_view() {
    let mut bridge = make_bridge(640, 480);
    let before = bridge.driver().live_handles(ResourceType::ImageView);
    let rt = bridge
        .create_render_target(256, 256, LegacyFormat::X8R8G8B8)
        .unwrap();
    let views: Vec<_> = bridge
        .driver()
        .live_handles(ResourceType::ImageView)
        .into_iter()
        .filter(|v| !before.contains(v))
        .collect();
    assert_eq!(views.len(), 2);
    let swizzles: Vec<_> = views
        .iter()
        .map(|v| bridge.driver().image_view_desc(*v).unwrap().swizzle)
        .collect();
    assert!(swizzles.iter().any(|s| s.is_identity()));
    assert!(swizzles.iter().any(|s| s.a == vk::ComponentSwizzle::ONE));

    bridge.set_render_targets(Some(rt), None).unwrap();
    frame(&mut bridge);
    let scene = bridge.driver().submissions().last().unwrap();
    assert_eq!(
        scene.count(|c| matches!(c, RecordedCommand::BlitImage { .. })),
        1
    );
    assert_eq!(bridge.stats().draws_recorded, 1);

    // Sampling the target goes through the opaque view.
    bridge.set_render_targets(None, None).unwrap();
    bridge.set_texture(0, Some(rt)).unwrap();
    frame(&mut bridge);
    assert_eq!(bridge.stats().frames_presented, 2);

    bridge.shutdown();
    for view in views {
        assert!(!bridge.driver().is_live(view));
    }
}

#[test]
fn test_opaque_texture_keeps_a_single_view() {
    let mut bridge = make_bridge(640, 480);
    let before = bridge.driver().live_count(ResourceType::ImageView);
    bridge
        .create_texture(16, 16, LegacyFormat::X8R8G8B8)
        .unwrap();
    assert_eq!(
        bridge.driver().live_count(ResourceType::ImageView),
        before + 1
    );
}

#[test]
fn test_immediate_ring_overflow_skips_the_draw() {
    let mut config = FixvkConfig::default();
    config.frame.immediate_buffer_size = 64 * 1024;
    let mut bridge = Bridge::new(HeadlessDriver::new(), config);
    bridge.initialize(&window(), 640, 480).expect("initialize");

    // 3600 vertices of 20 bytes do not fit in 64 KiB.
    let big = vec![0u8; 3600 * 20];
    bridge.begin_scene().unwrap();
    match bridge.draw_primitive_up(PrimitiveType::TriangleList, 1200, &big, 20) {
        Err(fixvk_bridge::BridgeError::ResourceCreationFailed(_)) => {}
        other => panic!("expected ResourceCreationFailed, got {:?}", other),
    }
    match bridge.draw_indexed_primitive_up(
        PrimitiveType::TriangleList,
        0,
        3600,
        1,
        IndexData::U16(&[0, 1, 2]),
        &big,
        20,
    ) {
        Err(fixvk_bridge::BridgeError::ResourceCreationFailed(_)) => {}
        other => panic!("expected ResourceCreationFailed, got {:?}", other),
    }
    assert_eq!(bridge.stats().draws_skipped, 2);

    // The frame carries on with draws that fit.
    bridge
        .draw_primitive_up(PrimitiveType::TriangleList, 1, &triangle(), 20)
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();
    assert_eq!(bridge.stats().draws_recorded, 1);
    assert_eq!(bridge.stats().draws_skipped, 2);
}

#[test]
fn test_textured_draw_binds_descriptor_set() {
    let mut bridge = make_bridge(640, 480);
    let texture = bridge
        .create_texture(4, 4, LegacyFormat::A8R8G8B8)
        .unwrap();
    bridge.update_image(texture, &[0xff; 64]).unwrap();
    bridge.set_texture(0, Some(texture)).unwrap();
    frame(&mut bridge);

    let scene = bridge.driver().submissions().last().unwrap();
    assert_eq!(
        scene.count(|c| matches!(c, RecordedCommand::BindDescriptorSet { .. })),
        1
    );

    // Without texture coordinates the set is not needed.
    bridge.set_vertex_format(Fvf::XYZ | Fvf::DIFFUSE).unwrap();
    bridge.begin_scene().unwrap();
    let colored: [f32; 12] = [0.0; 12];
    bridge
        .draw_primitive_up(
            PrimitiveType::TriangleList,
            1,
            bytemuck::cast_slice(&colored),
            16,
        )
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();
    let scene = bridge.driver().submissions().last().unwrap();
    assert_eq!(
        scene.count(|c| matches!(c, RecordedCommand::BindDescriptorSet { .. })),
        0
    );
}
