//! Integration test: frame synchronization and surface recovery
//!
//! Fence waits at BeginScene, device loss on a GPU that stops completing
//! work, and rebuilding the swap surface after out-of-date or suboptimal
//! acquire/present results.
//!
//! Run with: cargo test -p fixvk-bridge --test frame_sync_test -- --nocapture

use std::num::NonZeroIsize;

use fixvk_bridge::{Bridge, BridgeError, ErrorClass, FramePhase, PrimitiveType, Usage};
use fixvk_core::FixvkConfig;
use fixvk_driver::{DriverCall, HeadlessDriver};
use fixvk_protocol::types::Extent2D;
use fixvk_protocol::{DriverError, ResourceType, WindowTarget};

fn window() -> WindowTarget {
    WindowTarget::win32(NonZeroIsize::new(0x4000).unwrap())
}

fn make_bridge_with(config: FixvkConfig) -> Bridge<HeadlessDriver> {
    let mut bridge = Bridge::new(HeadlessDriver::new(), config);
    bridge.initialize(&window(), 640, 480).expect("initialize");
    bridge
}

fn make_bridge() -> Bridge<HeadlessDriver> {
    make_bridge_with(FixvkConfig::default())
}

fn empty_frame(bridge: &mut Bridge<HeadlessDriver>) {
    bridge.begin_scene().expect("begin_scene");
    bridge.end_scene().expect("end_scene");
    bridge.present().expect("present");
}

fn swapchain_creates(bridge: &Bridge<HeadlessDriver>) -> usize {
    bridge.driver().count_calls(|c| {
        matches!(
            c,
            DriverCall::Create {
                resource_type: ResourceType::Swapchain,
                ..
            }
        )
    })
}

#[test]
fn test_begin_scene_waits_for_the_frame_fence() {
    let mut bridge = make_bridge();
    empty_frame(&mut bridge);
    assert_eq!(bridge.tracker().submitted(), 1);
    assert_eq!(bridge.driver().completed_serial(), 0);

    bridge.driver_mut().clear_calls();
    bridge.begin_scene().unwrap();
    let waits: Vec<u64> = bridge
        .driver()
        .calls()
        .iter()
        .filter_map(|c| match c {
            DriverCall::WaitForFence { timeout_ns, .. } => Some(*timeout_ns),
            _ => None,
        })
        .collect();
    assert_eq!(waits, vec![1_000_000_000]);
    assert_eq!(bridge.driver().completed_serial(), 1);
    assert_eq!(bridge.tracker().completed(), 1);

    // The fence is reset only after the image was acquired.
    let calls = bridge.driver().calls();
    let acquire = calls
        .iter()
        .position(|c| matches!(c, DriverCall::AcquireNextImage { .. }))
        .unwrap();
    let reset = calls
        .iter()
        .position(|c| matches!(c, DriverCall::ResetFence { .. }))
        .unwrap();
    assert!(acquire < reset);
}

#[test]
fn test_frames_in_flight_rotate_contexts() {
    let mut config = FixvkConfig::default();
    config.frame.frames_in_flight = 2;
    let mut bridge = make_bridge_with(config);
    // Two frame fences plus the upload fence.
    assert_eq!(bridge.driver().live_count(ResourceType::Fence), 3);

    empty_frame(&mut bridge);
    empty_frame(&mut bridge);
    // Neither context has waited on real work yet.
    assert_eq!(bridge.driver().completed_serial(), 0);
    empty_frame(&mut bridge);
    assert_eq!(bridge.driver().completed_serial(), 1);

    let fences: Vec<_> = bridge
        .driver()
        .submissions()
        .iter()
        .map(|s| s.desc.fence)
        .collect();
    assert_eq!(fences.len(), 3);
    assert_ne!(fences[0], fences[1]);
    assert_eq!(fences[0], fences[2]);
}

#[test]
fn test_fence_timeout_reports_device_lost() {
    let mut config = FixvkConfig::default();
    config.frame.fence_timeout_ms = 0;
    let mut bridge = make_bridge_with(config);

    // The first frame's fence starts signaled.
    empty_frame(&mut bridge);

    match bridge.begin_scene() {
        Err(e @ BridgeError::DeviceLost) => assert!(e.is_fatal()),
        other => panic!("expected DeviceLost, got {:?}", other),
    }
    assert!(bridge.is_lost());
    assert_eq!(bridge.phase(), FramePhase::Idle);

    // Every later call reports the loss.
    match bridge.begin_scene() {
        Err(BridgeError::DeviceLost) => {}
        other => panic!("expected DeviceLost, got {:?}", other),
    }
    match bridge.draw_primitive(PrimitiveType::TriangleList, 0, 1) {
        Err(BridgeError::DeviceLost) => {}
        other => panic!("expected DeviceLost, got {:?}", other),
    }
    match bridge.create_vertex_buffer(64, Usage::empty()) {
        Err(BridgeError::DeviceLost) => {}
        other => panic!("expected DeviceLost, got {:?}", other),
    }
    match bridge.present() {
        Err(BridgeError::DeviceLost) => {}
        other => panic!("expected DeviceLost, got {:?}", other),
    }

    // Shutdown clears the condition and a fresh session works.
    bridge.shutdown();
    assert!(!bridge.is_lost());
    assert_eq!(bridge.driver().live_objects(), 0);
    bridge.initialize(&window(), 640, 480).unwrap();
    empty_frame(&mut bridge);
}

#[test]
fn test_stalled_gpu_is_device_lost() {
    let mut bridge = make_bridge();
    empty_frame(&mut bridge);
    bridge.driver_mut().stall_gpu(true);

    match bridge.begin_scene() {
        Err(e) => assert_eq!(e.class(), ErrorClass::DeviceLost),
        Ok(()) => panic!("expected DeviceLost from a stalled GPU"),
    }
    assert!(bridge.is_lost());
    assert_eq!(bridge.stats().frames_submitted, 1);

    bridge.shutdown();
    assert_eq!(bridge.driver().live_objects(), 0);
}

#[test]
fn test_out_of_date_present_rebuilds_once() {
    let mut bridge = make_bridge();
    let old = bridge.swapchain_handle().unwrap();
    bridge.driver_mut().fail_next_presents(1);

    bridge.begin_scene().unwrap();
    bridge.end_scene().unwrap();
    match bridge.present() {
        Err(BridgeError::SurfaceOutOfDate) => {}
        other => panic!("expected SurfaceOutOfDate, got {:?}", other),
    }
    assert_eq!(bridge.phase(), FramePhase::Idle);
    assert_eq!(bridge.stats().surface_rebuilds, 0);

    empty_frame(&mut bridge);
    empty_frame(&mut bridge);
    assert_eq!(bridge.stats().surface_rebuilds, 1);
    assert_eq!(bridge.swap_generation(), 1);
    assert_eq!(swapchain_creates(&bridge), 2);
    assert_eq!(bridge.driver().live_count(ResourceType::Swapchain), 1);
    assert!(!bridge.driver().is_live(old));

    let (_, desc, _) = bridge.driver().current_swapchain().unwrap();
    assert_eq!(desc.old_swapchain, old);
}

#[test]
fn test_suboptimal_present_rebuilds_at_next_scene() {
    let mut bridge = make_bridge();
    bridge.driver_mut().suboptimal_next_presents(1);
    empty_frame(&mut bridge);
    assert_eq!(bridge.stats().frames_presented, 1);
    assert_eq!(bridge.stats().surface_rebuilds, 0);

    empty_frame(&mut bridge);
    assert_eq!(bridge.stats().surface_rebuilds, 1);
    assert_eq!(swapchain_creates(&bridge), 2);
}

#[test]
fn test_out_of_date_acquire_recovers() {
    let mut bridge = make_bridge();
    bridge.driver_mut().fail_next_acquires(1);
    match bridge.begin_scene() {
        Err(BridgeError::SurfaceOutOfDate) => {}
        other => panic!("expected SurfaceOutOfDate, got {:?}", other),
    }
    assert_eq!(bridge.phase(), FramePhase::Idle);
    assert!(!bridge.is_lost());

    empty_frame(&mut bridge);
    assert_eq!(bridge.stats().surface_rebuilds, 1);
    assert_eq!(bridge.stats().frames_presented, 1);
}

#[test]
fn test_minimized_window_defers_rebuild() {
    let mut bridge = make_bridge();
    let old = bridge.swapchain_handle();
    bridge.driver_mut().surface_capabilities_mut().current_extent = Some(Extent2D::new(0, 0));

    match bridge.resize(800, 600) {
        Err(BridgeError::SurfaceOutOfDate) => {}
        other => panic!("expected SurfaceOutOfDate, got {:?}", other),
    }
    // The old surface stays in place.
    assert_eq!(bridge.swapchain_handle(), old);
    match bridge.begin_scene() {
        Err(BridgeError::SurfaceOutOfDate) => {}
        other => panic!("expected SurfaceOutOfDate, got {:?}", other),
    }

    bridge.driver_mut().surface_capabilities_mut().current_extent = None;
    empty_frame(&mut bridge);
    assert_eq!(bridge.swap_extent(), Some(Extent2D::new(800, 600)));
    assert_eq!(bridge.stats().surface_rebuilds, 1);
}

#[test]
fn test_resize_inside_a_frame_is_rejected() {
    let mut bridge = make_bridge();
    bridge.begin_scene().unwrap();
    match bridge.resize(800, 600) {
        Err(BridgeError::InvalidCallOrder(_)) => {}
        other => panic!("expected InvalidCallOrder, got {:?}", other),
    }
    bridge.end_scene().unwrap();
    match bridge.resize(800, 600) {
        Err(BridgeError::InvalidCallOrder(_)) => {}
        other => panic!("expected InvalidCallOrder, got {:?}", other),
    }
    bridge.present().unwrap();
    bridge.resize(800, 600).unwrap();
}

#[test]
fn test_resize_to_current_size_is_a_no_op() {
    let mut bridge = make_bridge();
    let handle = bridge.swapchain_handle();
    let creates = bridge
        .driver()
        .count_calls(|c| matches!(c, DriverCall::Create { .. }));

    bridge.resize(640, 480).unwrap();
    assert_eq!(bridge.swapchain_handle(), handle);
    assert_eq!(bridge.swap_generation(), 0);
    assert_eq!(
        bridge
            .driver()
            .count_calls(|c| matches!(c, DriverCall::Create { .. })),
        creates
    );
}

#[test]
fn test_resize_replaces_the_whole_surface() {
    let mut bridge = make_bridge();
    empty_frame(&mut bridge);
    let old_chain = bridge.swapchain_handle().unwrap();
    let old_views = bridge.driver().live_handles(ResourceType::ImageView);
    let old_framebuffers = bridge.driver().live_handles(ResourceType::Framebuffer);
    let live = bridge.driver().live_objects();

    bridge.resize(1280, 720).unwrap();
    assert_eq!(bridge.swap_extent(), Some(Extent2D::new(1280, 720)));
    assert!(!bridge.driver().is_live(old_chain));
    for handle in old_views.iter().chain(&old_framebuffers) {
        assert!(!bridge.driver().is_live(*handle), "{:?} survived", handle);
    }
    assert_eq!(bridge.driver().live_count(ResourceType::Swapchain), 1);
    assert_eq!(bridge.driver().live_objects(), live);

    empty_frame(&mut bridge);
    assert_eq!(bridge.stats().surface_rebuilds, 1);
}

#[test]
fn test_failed_rebuild_stays_pending() {
    let mut bridge = make_bridge();
    let old = bridge.swapchain_handle();
    bridge
        .driver_mut()
        .fail_next_create(ResourceType::Framebuffer, DriverError::OutOfDeviceMemory);

    match bridge.resize(800, 600) {
        Err(e) => assert!(!e.is_fatal(), "unexpected fatal error {:?}", e),
        Ok(()) => panic!("expected the rebuild to fail"),
    }
    assert!(!bridge.is_lost());
    assert_eq!(bridge.swapchain_handle(), old);
    assert_eq!(bridge.driver().live_count(ResourceType::Swapchain), 1);
    assert_eq!(bridge.stats().surface_rebuilds, 0);

    // The next scene retries without another Resize.
    empty_frame(&mut bridge);
    assert_eq!(bridge.stats().surface_rebuilds, 1);
    assert_eq!(bridge.swap_extent(), Some(Extent2D::new(800, 600)));
    assert_ne!(bridge.swapchain_handle(), old);
    assert_eq!(bridge.driver().live_count(ResourceType::Swapchain), 1);
}
