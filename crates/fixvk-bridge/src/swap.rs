//! Swap surface: presentable images, their framebuffers and the per-frame
//! contexts that render into them.

use std::collections::HashMap;

use ash::vk;
use tracing::{debug, info};

use fixvk_core::FixvkConfig;
use fixvk_protocol::descriptors::{
    FramebufferDesc, ImageDesc, ImageViewDesc, RenderPassDesc, SurfaceFormat, SwapchainDesc,
    Swizzle,
};
use fixvk_protocol::types::{Extent2D, ImageState, MemoryLocation};
use fixvk_protocol::{Driver, GpuHandle};

use crate::error::{BridgeError, Result};
use crate::format::{
    choose_extent, choose_image_count, choose_present_mode, choose_surface_format,
    AUTO_DEPTH_FORMAT,
};
use crate::rollback::with_rollback;
use crate::session::DeviceSession;
use crate::translator::{bind_new_memory, create_host_buffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthAttachment {
    pub image: GpuHandle,
    pub memory: GpuHandle,
    pub view: GpuHandle,
    pub format: vk::Format,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwapChain {
    pub handle: GpuHandle,
    pub format: SurfaceFormat,
    pub extent: Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub images: Vec<GpuHandle>,
    pub views: Vec<GpuHandle>,
    pub depth: Option<DepthAttachment>,
    /// One per image, created once the render pass exists
    pub framebuffers: Vec<GpuHandle>,
}

impl SwapChain {
    /// Create the swapchain, its views and the automatic depth image.
    ///
    /// `old` is handed to the driver as the swapchain being replaced.
    pub fn build<D: Driver>(
        driver: &mut D,
        session: &DeviceSession,
        config: &FixvkConfig,
        requested: Extent2D,
        old: GpuHandle,
    ) -> Result<Self> {
        let adapter = session
            .adapter
            .as_ref()
            .map(|a| a.adapter)
            .ok_or(BridgeError::InvalidCallOrder("swap surface without a device"))?;
        let caps = driver.surface_capabilities(adapter, session.surface)?;
        let format = choose_surface_format(&caps.formats).ok_or_else(|| {
            BridgeError::InitializationFailure("surface reports no formats".into())
        })?;
        let present_mode = choose_present_mode(&caps.present_modes, config.renderer.enable_vsync);
        let extent = choose_extent(&caps, requested, config.renderer.fullscreen);
        if extent.is_empty() {
            // Minimized window; try again once it has a size.
            return Err(BridgeError::SurfaceOutOfDate);
        }
        let image_count = choose_image_count(&caps);
        let auto_depth = config.renderer.auto_depth_stencil;

        let chain = with_rollback(driver, |driver, partial| {
            let info = driver.create_swapchain(&SwapchainDesc {
                surface: session.surface,
                format,
                extent,
                image_count,
                present_mode,
                old_swapchain: old,
            })?;
            partial.track(info.swapchain);

            let mut views = Vec::with_capacity(info.images.len());
            for image in &info.images {
                views.push(partial.track(driver.create_image_view(&ImageViewDesc {
                    image: *image,
                    format: format.format,
                    aspect: vk::ImageAspectFlags::COLOR,
                    swizzle: Swizzle::IDENTITY,
                })?));
            }

            let depth = if auto_depth {
                let image = partial.track(driver.create_image(&ImageDesc {
                    extent,
                    format: AUTO_DEPTH_FORMAT,
                    usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                })?);
                let memory =
                    partial.track(bind_new_memory(driver, image, MemoryLocation::DeviceLocal)?);
                let view = partial.track(driver.create_image_view(&ImageViewDesc {
                    image,
                    format: AUTO_DEPTH_FORMAT,
                    aspect: vk::ImageAspectFlags::DEPTH,
                    swizzle: Swizzle::IDENTITY,
                })?);
                Some(DepthAttachment {
                    image,
                    memory,
                    view,
                    format: AUTO_DEPTH_FORMAT,
                })
            } else {
                None
            };

            Ok(SwapChain {
                handle: info.swapchain,
                format,
                extent,
                present_mode,
                images: info.images,
                views,
                depth,
                framebuffers: Vec::new(),
            })
        })?;
        info!(
            width = extent.width,
            height = extent.height,
            images = chain.images.len(),
            format = ?format.format,
            ?present_mode,
            depth = auto_depth,
            "swap chain created"
        );
        Ok(chain)
    }

    /// Render pass signature for drawing straight into the swap images.
    pub fn render_pass_desc(&self) -> RenderPassDesc {
        RenderPassDesc {
            color_format: self.format.format,
            color_final: ImageState::Present,
            depth_format: self.depth.map(|d| d.format),
        }
    }

    pub fn create_framebuffers<D: Driver>(
        &mut self,
        driver: &mut D,
        render_pass: GpuHandle,
    ) -> Result<()> {
        let (views, depth, extent) = (&self.views, self.depth, self.extent);
        let framebuffers = with_rollback(driver, |driver, partial| {
            let mut framebuffers = Vec::with_capacity(views.len());
            for view in views {
                let mut attachments = vec![*view];
                attachments.extend(depth.map(|d| d.view));
                framebuffers.push(partial.track(driver.create_framebuffer(&FramebufferDesc {
                    render_pass,
                    attachments,
                    extent,
                })?));
            }
            Ok(framebuffers)
        })?;
        self.framebuffers = framebuffers;
        Ok(())
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn destroy<D: Driver>(self, driver: &mut D) {
        for framebuffer in self.framebuffers {
            driver.destroy(framebuffer);
        }
        if let Some(depth) = self.depth {
            driver.destroy(depth.view);
            driver.destroy(depth.image);
            driver.destroy(depth.memory);
        }
        for view in self.views {
            driver.destroy(view);
        }
        driver.destroy(self.handle);
    }
}

/// Render passes keyed by attachment formats and final color layout.
#[derive(Debug, Default)]
pub struct RenderPassCache {
    passes: HashMap<RenderPassDesc, GpuHandle>,
}

impl RenderPassCache {
    pub fn get_or_create<D: Driver>(
        &mut self,
        driver: &mut D,
        desc: RenderPassDesc,
    ) -> Result<GpuHandle> {
        if let Some(pass) = self.passes.get(&desc) {
            return Ok(*pass);
        }
        let pass = driver.create_render_pass(&desc)?;
        debug!(?desc, ?pass, "created render pass");
        self.passes.insert(desc, pass);
        Ok(pass)
    }

    pub fn get(&self, desc: &RenderPassDesc) -> Option<GpuHandle> {
        self.passes.get(desc).copied()
    }

    /// Remove passes matching `stale` and hand back their handles.
    pub fn take_matching(&mut self, stale: impl Fn(&RenderPassDesc) -> bool) -> Vec<GpuHandle> {
        let mut taken = Vec::new();
        self.passes.retain(|desc, pass| {
            if stale(desc) {
                taken.push(*pass);
                false
            } else {
                true
            }
        });
        taken
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn destroy<D: Driver>(&mut self, driver: &mut D) {
        for (_, pass) in self.passes.drain() {
            driver.destroy(pass);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FramebufferKey {
    render_pass: GpuHandle,
    attachments: Vec<GpuHandle>,
    extent: Extent2D,
}

/// Framebuffers for offscreen targets and explicit depth buffers.
#[derive(Debug, Default)]
pub struct FramebufferCache {
    framebuffers: HashMap<FramebufferKey, GpuHandle>,
}

impl FramebufferCache {
    pub fn get_or_create<D: Driver>(
        &mut self,
        driver: &mut D,
        render_pass: GpuHandle,
        attachments: &[GpuHandle],
        extent: Extent2D,
    ) -> Result<GpuHandle> {
        let key = FramebufferKey {
            render_pass,
            attachments: attachments.to_vec(),
            extent,
        };
        if let Some(framebuffer) = self.framebuffers.get(&key) {
            return Ok(*framebuffer);
        }
        let framebuffer = driver.create_framebuffer(&FramebufferDesc {
            render_pass,
            attachments: key.attachments.clone(),
            extent,
        })?;
        self.framebuffers.insert(key, framebuffer);
        Ok(framebuffer)
    }

    /// Remove framebuffers that use any of `handles` as render pass or attachment.
    pub fn take_referencing(&mut self, handles: &[GpuHandle]) -> Vec<GpuHandle> {
        let mut taken = Vec::new();
        self.framebuffers.retain(|key, framebuffer| {
            let stale = handles.contains(&key.render_pass)
                || key.attachments.iter().any(|a| handles.contains(a));
            if stale {
                taken.push(*framebuffer);
            }
            !stale
        });
        taken
    }

    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    pub fn destroy<D: Driver>(&mut self, driver: &mut D) {
        for (_, framebuffer) in self.framebuffers.drain() {
            driver.destroy(framebuffer);
        }
    }
}

/// Host-visible scratch space for user-pointer draws, reset every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmediateRing {
    pub buffer: GpuHandle,
    pub memory: GpuHandle,
    pub size: u64,
    cursor: u64,
}

impl ImmediateRing {
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn used(&self) -> u64 {
        self.cursor
    }

    /// Copy `data` in at the next `align`-aligned offset and return that offset.
    pub fn push<D: Driver>(&mut self, driver: &mut D, data: &[u8], align: u64) -> Result<u64> {
        let offset = self.cursor.next_multiple_of(align.max(1));
        let end = offset + data.len() as u64;
        if end > self.size {
            return Err(BridgeError::ResourceCreationFailed(format!(
                "immediate ring of {} bytes cannot take {} more",
                self.size,
                data.len()
            )));
        }
        driver.write_memory(self.memory, offset, data)?;
        self.cursor = end;
        Ok(offset)
    }
}

/// Everything one in-flight frame owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameContext {
    pub command_buffer: GpuHandle,
    /// Created signaled so the first wait passes
    pub fence: GpuHandle,
    pub image_available: GpuHandle,
    pub render_finished: GpuHandle,
    pub ring: ImmediateRing,
    /// Serial of the last submission made from this context
    pub last_serial: u64,
}

/// Create `count` frame contexts: command buffers, then sync objects, then rings.
pub fn create_frames<D: Driver>(
    driver: &mut D,
    command_pool: GpuHandle,
    count: usize,
    ring_size: u64,
) -> Result<Vec<FrameContext>> {
    with_rollback(driver, |driver, partial| {
        let mut command_buffers = Vec::with_capacity(count);
        for _ in 0..count {
            command_buffers.push(partial.track(driver.allocate_command_buffer(command_pool)?));
        }
        let mut fences = Vec::with_capacity(count);
        for _ in 0..count {
            fences.push(partial.track(driver.create_fence(true)?));
        }
        let mut semaphores = Vec::with_capacity(count);
        for _ in 0..count {
            let image_available = partial.track(driver.create_semaphore()?);
            let render_finished = partial.track(driver.create_semaphore()?);
            semaphores.push((image_available, render_finished));
        }
        let mut frames = Vec::with_capacity(count);
        for ((command_buffer, fence), (image_available, render_finished)) in
            command_buffers.into_iter().zip(fences).zip(semaphores)
        {
            let (buffer, memory) = create_host_buffer(
                driver,
                ring_size,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER,
            )?;
            partial.track(buffer);
            partial.track(memory);
            frames.push(FrameContext {
                command_buffer,
                fence,
                image_available,
                render_finished,
                ring: ImmediateRing {
                    buffer,
                    memory,
                    size: ring_size,
                    cursor: 0,
                },
                last_serial: 0,
            });
        }
        debug!(count, ring_size, "created frame contexts");
        Ok(frames)
    })
}

pub fn destroy_frames<D: Driver>(driver: &mut D, frames: Vec<FrameContext>) {
    for frame in frames.into_iter().rev() {
        driver.destroy(frame.ring.buffer);
        driver.destroy(frame.ring.memory);
        driver.destroy(frame.render_finished);
        driver.destroy(frame.image_available);
        driver.destroy(frame.fence);
        driver.destroy(frame.command_buffer);
    }
}

/// The swap chain plus everything rebuilt with it.
#[derive(Debug, Default)]
pub struct SwapSurface {
    pub chain: Option<SwapChain>,
    pub frames: Vec<FrameContext>,
    pub render_passes: RenderPassCache,
    pub framebuffers: FramebufferCache,
    /// Bumped on every successful rebuild
    pub generation: u64,
}

impl SwapSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain(&self) -> Result<&SwapChain> {
        self.chain
            .as_ref()
            .ok_or(BridgeError::InvalidCallOrder("no swap surface"))
    }

    pub fn destroy<D: Driver>(&mut self, driver: &mut D) {
        destroy_frames(driver, std::mem::take(&mut self.frames));
        self.framebuffers.destroy(driver);
        if let Some(chain) = self.chain.take() {
            chain.destroy(driver);
        }
        self.render_passes.destroy(driver);
    }
}
