use std::num::NonZeroIsize;

use raw_window_handle::{
    RawDisplayHandle, RawWindowHandle, Win32WindowHandle, WindowsDisplayHandle,
};

use crate::commands::RecordedCommand;
use crate::descriptors::*;
use crate::error::DriverResult;
use crate::handle::GpuHandle;
use crate::types::MemoryLocation;

/// Native window the swap surface presents into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTarget {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

impl WindowTarget {
    /// Target for a Win32 `HWND`, the handle legacy hosts hand over.
    pub fn win32(hwnd: NonZeroIsize) -> Self {
        Self {
            display: RawDisplayHandle::Windows(WindowsDisplayHandle::new()),
            window: RawWindowHandle::Win32(Win32WindowHandle::new(hwnd)),
        }
    }
}

/// The modern explicit API as seen by the bridge.
///
/// A driver owns at most one instance and one logical device at a time.
/// Calls that need a device operate on the one created by
/// [`Driver::create_device`]. Every `create_*` returns a handle that must
/// eventually be passed to [`Driver::destroy`], except handles whose
/// [`ResourceType::is_borrowed`](crate::ResourceType::is_borrowed) is true.
pub trait Driver {
    // ── Instance / device ───────────────────────────────────
    fn create_instance(&mut self, desc: &InstanceDesc) -> DriverResult<InstanceInfo>;
    fn create_surface(
        &mut self,
        instance: GpuHandle,
        window: &WindowTarget,
    ) -> DriverResult<GpuHandle>;
    fn enumerate_adapters(
        &mut self,
        instance: GpuHandle,
        surface: Option<GpuHandle>,
    ) -> DriverResult<Vec<AdapterInfo>>;
    fn create_device(&mut self, desc: &DeviceDesc) -> DriverResult<DeviceInfo>;

    // ── Surface / swapchain ─────────────────────────────────
    fn surface_capabilities(
        &mut self,
        adapter: GpuHandle,
        surface: GpuHandle,
    ) -> DriverResult<SurfaceCapabilities>;
    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> DriverResult<SwapchainInfo>;
    fn acquire_next_image(
        &mut self,
        swapchain: GpuHandle,
        timeout_ns: u64,
        signal: GpuHandle,
    ) -> DriverResult<AcquiredImage>;
    fn queue_present(
        &mut self,
        queue: GpuHandle,
        present: &PresentDesc,
    ) -> DriverResult<PresentStatus>;

    // ── Resources ───────────────────────────────────────────
    fn create_buffer(&mut self, desc: &BufferDesc) -> DriverResult<GpuHandle>;
    fn create_image(&mut self, desc: &ImageDesc) -> DriverResult<GpuHandle>;
    fn create_image_view(&mut self, desc: &ImageViewDesc) -> DriverResult<GpuHandle>;
    fn memory_requirements(&mut self, resource: GpuHandle) -> DriverResult<MemoryRequirements>;
    fn allocate_memory(
        &mut self,
        requirements: &MemoryRequirements,
        location: MemoryLocation,
    ) -> DriverResult<GpuHandle>;
    fn bind_memory(&mut self, resource: GpuHandle, memory: GpuHandle) -> DriverResult<()>;
    /// Write into host-visible memory.
    fn write_memory(&mut self, memory: GpuHandle, offset: u64, data: &[u8]) -> DriverResult<()>;
    fn create_sampler(&mut self, desc: &SamplerDesc) -> DriverResult<GpuHandle>;

    // ── Pipelines ───────────────────────────────────────────
    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DriverResult<GpuHandle>;
    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> DriverResult<GpuHandle>;
    fn create_shader_module(&mut self, code: &[u32]) -> DriverResult<GpuHandle>;
    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> DriverResult<GpuHandle>;
    fn create_pipeline_layout(&mut self, desc: &PipelineLayoutDesc) -> DriverResult<GpuHandle>;
    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
    ) -> DriverResult<GpuHandle>;
    fn create_descriptor_pool(&mut self, desc: &DescriptorPoolDesc) -> DriverResult<GpuHandle>;
    fn allocate_descriptor_set(
        &mut self,
        pool: GpuHandle,
        layout: GpuHandle,
    ) -> DriverResult<GpuHandle>;
    /// Point binding 0 at `view` and binding 1 at `sampler`.
    fn write_texture_descriptor(
        &mut self,
        set: GpuHandle,
        view: GpuHandle,
        sampler: GpuHandle,
    ) -> DriverResult<()>;

    // ── Commands / sync ─────────────────────────────────────
    fn create_command_pool(&mut self, queue_family: u32) -> DriverResult<GpuHandle>;
    fn allocate_command_buffer(&mut self, pool: GpuHandle) -> DriverResult<GpuHandle>;
    fn create_fence(&mut self, signaled: bool) -> DriverResult<GpuHandle>;
    fn create_semaphore(&mut self) -> DriverResult<GpuHandle>;
    /// Returns [`DriverError::Timeout`](crate::DriverError::Timeout) if the fence
    /// is still unsignaled after `timeout_ns`.
    fn wait_for_fence(&mut self, fence: GpuHandle, timeout_ns: u64) -> DriverResult<()>;
    fn reset_fence(&mut self, fence: GpuHandle) -> DriverResult<()>;
    /// Resets the command buffer and starts a one-time-submit recording.
    fn begin_command_buffer(&mut self, command_buffer: GpuHandle) -> DriverResult<()>;
    fn record(&mut self, command_buffer: GpuHandle, command: &RecordedCommand) -> DriverResult<()>;
    fn end_command_buffer(&mut self, command_buffer: GpuHandle) -> DriverResult<()>;
    fn queue_submit(&mut self, queue: GpuHandle, submit: &SubmitDesc) -> DriverResult<()>;
    fn device_wait_idle(&mut self) -> DriverResult<()>;

    /// Destroy any object created through this driver. Unknown handles are ignored.
    fn destroy(&mut self, handle: GpuHandle);
}
