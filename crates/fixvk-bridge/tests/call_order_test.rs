//! Integration test: call-order contract
//!
//! Misordered legacy calls are reported without disturbing the frame that
//! is being recorded.
//!
//! Run with: cargo test -p fixvk-bridge --test call_order_test -- --nocapture

use std::num::NonZeroIsize;

use fixvk_bridge::{
    Bridge, BridgeError, ErrorClass, FramePhase, Fvf, IndexData, LegacyFormat, LegacyViewport,
    PrimitiveType, Usage,
};
use fixvk_core::FixvkConfig;
use fixvk_driver::HeadlessDriver;
use fixvk_protocol::{RecordedCommand, WindowTarget};

fn window() -> WindowTarget {
    WindowTarget::win32(NonZeroIsize::new(0x5000).unwrap())
}

fn make_bridge() -> Bridge<HeadlessDriver> {
    let mut bridge = Bridge::new(HeadlessDriver::new(), FixvkConfig::default());
    bridge.initialize(&window(), 640, 480).expect("initialize");
    bridge
}

fn triangle() -> Vec<u8> {
    vec![0u8; 60]
}

fn expect_call_order<T: std::fmt::Debug>(result: Result<T, BridgeError>) {
    match result {
        Err(e) if e.class() == ErrorClass::InvalidCallOrder => {}
        other => panic!("expected a call-order error, got {:?}", other),
    }
}

#[test]
fn test_nested_begin_scene_leaves_the_scene_intact() {
    let mut bridge = make_bridge();
    bridge.begin_scene().unwrap();
    bridge
        .draw_primitive_up(PrimitiveType::TriangleList, 1, &triangle(), 20)
        .unwrap();

    match bridge.begin_scene() {
        Err(BridgeError::AlreadyInScene) => {}
        other => panic!("expected AlreadyInScene, got {:?}", other),
    }
    assert_eq!(bridge.phase(), FramePhase::Recording);

    bridge
        .draw_primitive_up(PrimitiveType::TriangleList, 1, &triangle(), 20)
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();

    let submissions = bridge.driver().submissions();
    assert_eq!(submissions.len(), 1);
    let scene = &submissions[0];
    assert_eq!(
        scene.count(|c| matches!(c, RecordedCommand::BeginRenderPass { .. })),
        1
    );
    assert_eq!(scene.count(|c| matches!(c, RecordedCommand::Draw { .. })), 2);
}

#[test]
fn test_end_scene_outside_a_scene() {
    let mut bridge = make_bridge();
    match bridge.end_scene() {
        Err(BridgeError::NotInScene) => {}
        other => panic!("expected NotInScene, got {:?}", other),
    }

    bridge.begin_scene().unwrap();
    bridge.end_scene().unwrap();
    match bridge.end_scene() {
        Err(BridgeError::NotInScene) => {}
        other => panic!("expected NotInScene, got {:?}", other),
    }
    bridge.present().unwrap();
    assert_eq!(bridge.driver().submissions().len(), 1);
}

#[test]
fn test_present_needs_a_submitted_frame() {
    let mut bridge = make_bridge();
    expect_call_order(bridge.present());

    bridge.begin_scene().unwrap();
    expect_call_order(bridge.present());
    assert_eq!(bridge.phase(), FramePhase::Recording);

    bridge.end_scene().unwrap();
    bridge.present().unwrap();
    expect_call_order(bridge.present());
    assert_eq!(bridge.driver().presents().len(), 1);
}

#[test]
fn test_begin_scene_before_present() {
    let mut bridge = make_bridge();
    bridge.begin_scene().unwrap();
    bridge.end_scene().unwrap();
    match bridge.begin_scene() {
        Err(BridgeError::InvalidCallOrder(msg)) => assert!(msg.contains("Present")),
        other => panic!("expected InvalidCallOrder, got {:?}", other),
    }
    assert_eq!(bridge.phase(), FramePhase::Submitted);
    bridge.present().unwrap();
    bridge.begin_scene().unwrap();
}

#[test]
fn test_draws_outside_a_scene() {
    let mut bridge = make_bridge();
    let vb = bridge.create_vertex_buffer(60, Usage::empty()).unwrap();
    let ib = bridge
        .create_index_buffer(6, Usage::empty(), LegacyFormat::Index16)
        .unwrap();
    bridge.set_vertex_buffer(Some(vb), 0).unwrap();
    bridge.set_index_buffer(Some(ib), 0).unwrap();

    expect_call_order(bridge.draw_primitive(PrimitiveType::TriangleList, 0, 1));
    expect_call_order(bridge.draw_indexed_primitive(PrimitiveType::TriangleList, 0, 3, 0, 1));
    expect_call_order(bridge.draw_primitive_up(
        PrimitiveType::TriangleList,
        1,
        &triangle(),
        20,
    ));
    expect_call_order(bridge.draw_indexed_primitive_up(
        PrimitiveType::TriangleList,
        0,
        3,
        1,
        IndexData::U16(&[0, 1, 2]),
        &triangle(),
        20,
    ));
    assert!(bridge.driver().submissions().is_empty());
    assert_eq!(bridge.stats().draws_recorded, 0);
}

#[test]
fn test_draw_without_a_vertex_buffer() {
    let mut bridge = make_bridge();
    bridge.begin_scene().unwrap();
    match bridge.draw_primitive(PrimitiveType::TriangleList, 0, 1) {
        Err(BridgeError::InvalidCallOrder(_)) => {}
        other => panic!("expected InvalidCallOrder, got {:?}", other),
    }
    match bridge.draw_indexed_primitive(PrimitiveType::TriangleList, 0, 3, 0, 1) {
        Err(BridgeError::InvalidCallOrder(_)) => {}
        other => panic!("expected InvalidCallOrder, got {:?}", other),
    }
    bridge.end_scene().unwrap();
    bridge.present().unwrap();
}

#[test]
fn test_zero_primitive_draws_are_ignored() {
    let mut bridge = make_bridge();
    bridge.begin_scene().unwrap();
    bridge
        .draw_primitive_up(PrimitiveType::TriangleList, 0, &[], 20)
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();
    assert_eq!(bridge.stats().draws_recorded, 0);
}

#[test]
fn test_draw_ranges_are_checked() {
    let mut bridge = make_bridge();
    let vb = bridge.create_vertex_buffer(60, Usage::empty()).unwrap();
    let ib = bridge
        .create_index_buffer(6, Usage::empty(), LegacyFormat::Index16)
        .unwrap();
    bridge.set_vertex_buffer(Some(vb), 0).unwrap();
    bridge.set_index_buffer(Some(ib), 0).unwrap();
    bridge.begin_scene().unwrap();

    match bridge.draw_primitive(PrimitiveType::TriangleList, 1, 1) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    match bridge.draw_indexed_primitive(PrimitiveType::TriangleList, 0, 3, 1, 1) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    match bridge.draw_primitive_up(PrimitiveType::TriangleList, 2, &triangle(), 20) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    match bridge.draw_indexed_primitive_up(
        PrimitiveType::TriangleList,
        0,
        3,
        1,
        IndexData::U16(&[0, 1]),
        &triangle(),
        20,
    ) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    // The scene is still usable. The UP draws unbound stream 0.
    bridge.set_vertex_buffer(Some(vb), 0).unwrap();
    bridge
        .draw_primitive(PrimitiveType::TriangleList, 0, 1)
        .unwrap();
    bridge.end_scene().unwrap();
    bridge.present().unwrap();
    assert_eq!(bridge.stats().draws_recorded, 1);
}

#[test]
fn test_setters_validate_arguments() {
    let mut bridge = make_bridge();
    let vb = bridge.create_vertex_buffer(60, Usage::empty()).unwrap();
    let ib = bridge
        .create_index_buffer(6, Usage::empty(), LegacyFormat::Index32)
        .unwrap();
    let depth = bridge
        .create_depth_stencil(640, 480, LegacyFormat::D16)
        .unwrap();
    let texture = bridge.create_texture(8, 8, LegacyFormat::R5G6B5).unwrap();

    match bridge.set_vertex_buffer(Some(ib), 0) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    match bridge.set_index_buffer(Some(vb), 0) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    match bridge.set_texture(1, Some(texture)) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    match bridge.set_texture(0, Some(depth)) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    match bridge.set_render_targets(Some(texture), None) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    match bridge.set_vertex_format(Fvf::DIFFUSE) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    let flat = LegacyViewport {
        x: 0,
        y: 0,
        width: 0,
        height: 480,
        min_z: 0.0,
        max_z: 1.0,
    };
    match bridge.set_viewport(flat) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
    let inverted = LegacyViewport {
        width: 640,
        min_z: 0.8,
        max_z: 0.2,
        ..flat
    };
    match bridge.set_viewport(inverted) {
        Err(BridgeError::InvalidArgument(_)) => {}
        other => panic!("expected InvalidArgument, got {:?}", other),
    }

    // Nothing was applied.
    let state = bridge.state_vector();
    assert!(state.stream.is_none());
    assert!(state.indices.is_none());
    assert!(state.texture.is_none());
    assert!(state.viewport.is_none());
    assert_eq!(state.fvf, Fvf::default());
}

#[test]
fn test_stale_ids_are_rejected() {
    let mut bridge = make_bridge();
    let vb = bridge.create_vertex_buffer(60, Usage::empty()).unwrap();
    bridge.release_buffer(vb).unwrap();
    match bridge.set_vertex_buffer(Some(vb), 0) {
        Err(BridgeError::InvalidResource { kind, .. }) => assert_eq!(kind, "buffer"),
        other => panic!("expected InvalidResource, got {:?}", other),
    }
    match bridge.release_buffer(vb) {
        Err(BridgeError::InvalidResource { .. }) => {}
        other => panic!("expected InvalidResource, got {:?}", other),
    }

    let texture = bridge.create_texture(4, 4, LegacyFormat::A8R8G8B8).unwrap();
    bridge.release_image(texture).unwrap();
    match bridge.set_texture(0, Some(texture)) {
        Err(BridgeError::InvalidResource { kind, .. }) => assert_eq!(kind, "image"),
        other => panic!("expected InvalidResource, got {:?}", other),
    }

    // A new resource never reuses a released id.
    let again = bridge.create_vertex_buffer(60, Usage::empty()).unwrap();
    assert_ne!(again, vb);
}
