//! Legacy buffers and surfaces backed by device objects.
//!
//! The host only ever sees [`BufferId`] / [`ImageId`]; the driver handles
//! behind them stay here. Releasing an id retires its handles until the
//! submission that may still reference them has completed.

use ash::vk;
use tracing::{debug, trace, warn};

use fixvk_core::{Arena, ArenaId, FixvkConfig};
use fixvk_protocol::commands::RecordedCommand;
use fixvk_protocol::descriptors::{
    BufferDesc, DescriptorBinding, DescriptorPoolDesc, ImageDesc, ImageViewDesc, SamplerDesc,
    SubmitDesc, Swizzle,
};
use fixvk_protocol::types::{Extent2D, ImageState, MemoryLocation};
use fixvk_protocol::{Driver, DriverResult, GpuHandle};

use crate::error::{BridgeError, Result};
use crate::format::{index_type, translate_format, FormatInfo};
use crate::frame::{SubmitTracker, UNSUBMITTED};
use crate::legacy::{LegacyFormat, Usage};
use crate::rollback::with_rollback;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) ArenaId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub(crate) ArenaId);

impl BufferId {
    pub fn to_bits(self) -> u64 {
        self.0.to_bits()
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(ArenaId::from_bits(bits))
    }
}

impl ImageId {
    pub fn to_bits(self) -> u64 {
        self.0.to_bits()
    }

    pub fn from_bits(bits: u64) -> Self {
        Self(ArenaId::from_bits(bits))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Vertex,
    Index,
    Staging,
    /// Per-frame ring for user-pointer draws
    Immediate,
}

impl BufferRole {
    fn usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferRole::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferRole::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferRole::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferRole::Immediate => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferResource {
    pub role: BufferRole,
    pub handle: GpuHandle,
    pub memory: GpuHandle,
    pub size: u64,
    pub usage: Usage,
    pub index_type: Option<vk::IndexType>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageResource {
    pub handle: GpuHandle,
    pub memory: GpuHandle,
    /// Sampled view, carrying the format's swizzle
    pub view: GpuHandle,
    /// Identity-swizzled view for framebuffers when `view` is swizzled
    pub attachment_view: Option<GpuHandle>,
    pub extent: Extent2D,
    pub format: FormatInfo,
    pub usage: Usage,
    /// Allocated on first bind
    pub descriptor_set: Option<GpuHandle>,
}

impl ImageResource {
    pub fn is_render_target(&self) -> bool {
        self.usage.contains(Usage::RENDERTARGET)
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.usage.contains(Usage::DEPTHSTENCIL)
    }

    /// The view to put in a framebuffer.
    pub fn attachment(&self) -> GpuHandle {
        self.attachment_view.unwrap_or(self.view)
    }

    fn views(&self) -> Vec<GpuHandle> {
        let mut views = vec![self.view];
        views.extend(self.attachment_view);
        views
    }

    fn handles(&self) -> Vec<GpuHandle> {
        let mut handles = Vec::with_capacity(5);
        handles.extend(self.descriptor_set);
        handles.extend(self.views());
        handles.extend([self.handle, self.memory]);
        handles
    }
}

/// Command buffer and fence for synchronous transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UploadContext {
    queue: GpuHandle,
    command_buffer: GpuHandle,
    fence: GpuHandle,
}

#[derive(Debug)]
struct Retired {
    serial: u64,
    handles: Vec<GpuHandle>,
}

/// Allocate memory for `resource` and bind it; the memory is freed if binding fails.
pub(crate) fn bind_new_memory<D: Driver>(
    driver: &mut D,
    resource: GpuHandle,
    location: MemoryLocation,
) -> DriverResult<GpuHandle> {
    let requirements = driver.memory_requirements(resource)?;
    let memory = driver.allocate_memory(&requirements, location)?;
    if let Err(e) = driver.bind_memory(resource, memory) {
        driver.destroy(memory);
        return Err(e);
    }
    Ok(memory)
}

/// A host-visible buffer with its memory bound, or nothing at all.
pub(crate) fn create_host_buffer<D: Driver>(
    driver: &mut D,
    size: u64,
    usage: vk::BufferUsageFlags,
) -> Result<(GpuHandle, GpuHandle)> {
    with_rollback(driver, |driver, partial| {
        let buffer = partial.track(driver.create_buffer(&BufferDesc { size, usage })?);
        let memory = partial.track(bind_new_memory(driver, buffer, MemoryLocation::HostVisible)?);
        Ok((buffer, memory))
    })
}

/// Anisotropy the shared sampler should use, if any.
pub fn sampler_anisotropy(config: &FixvkConfig, device_limit: Option<f32>) -> Option<f32> {
    if !config.renderer.enable_anisotropy {
        return None;
    }
    let limit = device_limit?;
    let level = config.renderer.anisotropy_level.clamp(1, 16) as f32;
    Some(level.min(limit).max(1.0))
}

pub struct ResourceTranslator {
    buffers: Arena<BufferResource>,
    images: Arena<ImageResource>,
    retired: Vec<Retired>,
    sampler: GpuHandle,
    set_layout: GpuHandle,
    descriptor_pool: GpuHandle,
    upload: Option<UploadContext>,
    fence_timeout_ns: u64,
}

impl ResourceTranslator {
    pub fn new() -> Self {
        Self {
            buffers: Arena::new(),
            images: Arena::new(),
            retired: Vec::new(),
            sampler: GpuHandle::null(),
            set_layout: GpuHandle::null(),
            descriptor_pool: GpuHandle::null(),
            upload: None,
            fence_timeout_ns: 0,
        }
    }

    // ── Session objects ─────────────────────────────────────

    /// Create the shared sampler, texture set layout and descriptor pool.
    ///
    /// `anisotropy_limit` is the device limit when the feature was enabled.
    pub fn init_shared<D: Driver>(
        &mut self,
        driver: &mut D,
        config: &FixvkConfig,
        anisotropy_limit: Option<f32>,
    ) -> Result<()> {
        let sampler_desc = SamplerDesc {
            max_anisotropy: sampler_anisotropy(config, anisotropy_limit),
            mip_lod_bias: config.performance.effective_lod_bias(),
        };
        let max_textures = config.frame.max_textures;
        let (sampler, set_layout, pool) = with_rollback(driver, |driver, partial| {
            let sampler = partial.track(
                driver
                    .create_sampler(&sampler_desc)
                    .map_err(|e| BridgeError::init("sampler", e))?,
            );
            let set_layout = partial.track(
                driver
                    .create_descriptor_set_layout(&[
                        DescriptorBinding {
                            binding: 0,
                            descriptor_type: vk::DescriptorType::SAMPLED_IMAGE,
                            stages: vk::ShaderStageFlags::FRAGMENT,
                        },
                        DescriptorBinding {
                            binding: 1,
                            descriptor_type: vk::DescriptorType::SAMPLER,
                            stages: vk::ShaderStageFlags::FRAGMENT,
                        },
                    ])
                    .map_err(|e| BridgeError::init("descriptor set layout", e))?,
            );
            let pool = partial.track(
                driver
                    .create_descriptor_pool(&DescriptorPoolDesc {
                        max_sets: max_textures,
                        sampled_images: max_textures,
                        samplers: max_textures,
                    })
                    .map_err(|e| BridgeError::init("descriptor pool", e))?,
            );
            Ok((sampler, set_layout, pool))
        })?;
        debug!(
            anisotropy = ?sampler_desc.max_anisotropy,
            lod_bias = sampler_desc.mip_lod_bias,
            max_textures,
            "created shared sampler and texture descriptors"
        );
        self.sampler = sampler;
        self.set_layout = set_layout;
        self.descriptor_pool = pool;
        self.fence_timeout_ns = config.frame.fence_timeout_ms.saturating_mul(1_000_000);
        Ok(())
    }

    /// Allocate the transfer command buffer and its fence.
    pub fn init_upload<D: Driver>(
        &mut self,
        driver: &mut D,
        command_pool: GpuHandle,
        queue: GpuHandle,
    ) -> Result<()> {
        let upload = with_rollback(driver, |driver, partial| {
            let command_buffer = partial.track(
                driver
                    .allocate_command_buffer(command_pool)
                    .map_err(|e| BridgeError::init("upload command buffer", e))?,
            );
            let fence = partial.track(
                driver
                    .create_fence(false)
                    .map_err(|e| BridgeError::init("upload fence", e))?,
            );
            Ok(UploadContext {
                queue,
                command_buffer,
                fence,
            })
        })?;
        self.upload = Some(upload);
        Ok(())
    }

    pub fn set_layout(&self) -> GpuHandle {
        self.set_layout
    }

    pub fn sampler(&self) -> GpuHandle {
        self.sampler
    }

    /// Record `commands` into the upload buffer, submit and wait for them.
    fn run_upload<D: Driver>(
        &mut self,
        driver: &mut D,
        tracker: &mut SubmitTracker,
        commands: &[RecordedCommand],
    ) -> Result<()> {
        let upload = self
            .upload
            .ok_or(BridgeError::InvalidCallOrder("upload before Initialize"))?;
        driver.begin_command_buffer(upload.command_buffer)?;
        for command in commands {
            driver.record(upload.command_buffer, command)?;
        }
        driver.end_command_buffer(upload.command_buffer)?;
        driver.queue_submit(
            upload.queue,
            &SubmitDesc {
                command_buffer: upload.command_buffer,
                wait: None,
                signal: None,
                fence: Some(upload.fence),
            },
        )?;
        let serial = tracker.record_submit();
        driver.wait_for_fence(upload.fence, self.fence_timeout_ns)?;
        tracker.complete_through(serial);
        driver.reset_fence(upload.fence)?;
        Ok(())
    }

    // ── Buffers ─────────────────────────────────────────────

    pub fn create_buffer<D: Driver>(
        &mut self,
        driver: &mut D,
        role: BufferRole,
        size: u64,
        usage: Usage,
    ) -> Result<BufferId> {
        self.create_buffer_inner(driver, role, size, usage, None)
    }

    pub fn create_index_buffer<D: Driver>(
        &mut self,
        driver: &mut D,
        size: u64,
        usage: Usage,
        format: LegacyFormat,
    ) -> Result<BufferId> {
        let index_type = index_type(format)?;
        self.create_buffer_inner(driver, BufferRole::Index, size, usage, Some(index_type))
    }

    fn create_buffer_inner<D: Driver>(
        &mut self,
        driver: &mut D,
        role: BufferRole,
        size: u64,
        usage: Usage,
        index_type: Option<vk::IndexType>,
    ) -> Result<BufferId> {
        if size == 0 {
            return Err(BridgeError::InvalidArgument("buffer size must be non-zero".into()));
        }
        let (handle, memory) = create_host_buffer(driver, size, role.usage())?;
        let id = BufferId(self.buffers.insert(BufferResource {
            role,
            handle,
            memory,
            size,
            usage,
            index_type,
        }));
        debug!(?role, size, buffer = ?handle, "created buffer");
        Ok(id)
    }

    pub fn buffer(&self, id: BufferId) -> Result<&BufferResource> {
        self.buffers.get(id.0).ok_or(BridgeError::InvalidResource {
            kind: "buffer",
            id: id.to_bits(),
        })
    }

    /// Write `data` at `offset` through the buffer's mapped memory.
    pub fn update_buffer<D: Driver>(
        &mut self,
        driver: &mut D,
        id: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let buffer = self.buffer(id)?;
        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > buffer.size) {
            return Err(BridgeError::InvalidArgument(format!(
                "write of {} bytes at {} overruns a {} byte buffer",
                data.len(),
                offset,
                buffer.size
            )));
        }
        driver.write_memory(buffer.memory, offset, data)?;
        Ok(())
    }

    pub fn release_buffer(&mut self, id: BufferId, serial: u64) -> Result<()> {
        let buffer = self.buffers.remove(id.0).ok_or(BridgeError::InvalidResource {
            kind: "buffer",
            id: id.to_bits(),
        })?;
        trace!(buffer = ?buffer.handle, serial, "retiring buffer");
        self.retire(vec![buffer.handle, buffer.memory], serial);
        Ok(())
    }

    // ── Images ──────────────────────────────────────────────

    pub fn create_image<D: Driver>(
        &mut self,
        driver: &mut D,
        tracker: &mut SubmitTracker,
        width: u32,
        height: u32,
        format: LegacyFormat,
        usage: Usage,
    ) -> Result<ImageId> {
        if width == 0 || height == 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "image size must be non-zero, got {width}x{height}"
            )));
        }
        let info = translate_format(format)?;
        let render_target = usage.contains(Usage::RENDERTARGET);
        let depth_stencil = usage.contains(Usage::DEPTHSTENCIL);
        if render_target && depth_stencil {
            return Err(BridgeError::InvalidArgument(
                "RENDERTARGET and DEPTHSTENCIL are exclusive".into(),
            ));
        }
        if depth_stencil != info.is_depth() {
            return Err(BridgeError::InvalidArgument(format!(
                "{format:?} does not match usage {usage:?}"
            )));
        }
        if render_target && format.is_compressed() {
            return Err(BridgeError::InvalidArgument(format!(
                "{format:?} cannot be rendered to"
            )));
        }
        let vk_usage = if render_target {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
        } else if depth_stencil {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        } else {
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST
        };
        let extent = Extent2D::new(width, height);

        let (handle, memory, view, attachment_view) = with_rollback(driver, |driver, partial| {
            let image = partial.track(driver.create_image(&ImageDesc {
                extent,
                format: info.format,
                usage: vk_usage,
            })?);
            let memory =
                partial.track(bind_new_memory(driver, image, MemoryLocation::DeviceLocal)?);
            let view = partial.track(driver.create_image_view(&ImageViewDesc {
                image,
                format: info.format,
                aspect: info.aspect,
                swizzle: info.swizzle,
            })?);
            let attachment_view = if render_target && !info.swizzle.is_identity() {
                Some(partial.track(driver.create_image_view(&ImageViewDesc {
                    image,
                    format: info.format,
                    aspect: info.aspect,
                    swizzle: Swizzle::IDENTITY,
                })?))
            } else {
                None
            };
            Ok((image, memory, view, attachment_view))
        })?;

        if !depth_stencil {
            // Freshly created color images must be valid to sample.
            let transition = RecordedCommand::ImageBarrier {
                image: handle,
                aspect: vk::ImageAspectFlags::COLOR,
                from: ImageState::Undefined,
                to: ImageState::ShaderRead,
            };
            if let Err(e) = self.run_upload(driver, tracker, &[transition]) {
                if let Some(attachment_view) = attachment_view {
                    driver.destroy(attachment_view);
                }
                driver.destroy(view);
                driver.destroy(handle);
                driver.destroy(memory);
                return Err(e);
            }
        }

        let id = ImageId(self.images.insert(ImageResource {
            handle,
            memory,
            view,
            attachment_view,
            extent,
            format: info,
            usage,
            descriptor_set: None,
        }));
        debug!(?format, width, height, image = ?handle, "created image");
        Ok(id)
    }

    pub fn image(&self, id: ImageId) -> Result<&ImageResource> {
        self.images.get(id.0).ok_or(BridgeError::InvalidResource {
            kind: "image",
            id: id.to_bits(),
        })
    }

    /// Replace the whole top level of a texture.
    pub fn update_image<D: Driver>(
        &mut self,
        driver: &mut D,
        tracker: &mut SubmitTracker,
        id: ImageId,
        data: &[u8],
    ) -> Result<()> {
        let image = self.image(id)?;
        if image.is_render_target() || image.is_depth_stencil() {
            return Err(BridgeError::InvalidArgument(
                "only textures can be updated from host memory".into(),
            ));
        }
        let expected = image.format.image_size(image.extent);
        if data.len() as u64 != expected {
            return Err(BridgeError::InvalidArgument(format!(
                "{:?} {}x{} needs {} bytes, got {}",
                image.format.legacy,
                image.extent.width,
                image.extent.height,
                expected,
                data.len()
            )));
        }
        let (target, extent) = (image.handle, image.extent);

        let (staging, staging_memory) =
            create_host_buffer(driver, expected, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let color = vk::ImageAspectFlags::COLOR;
        let result = driver
            .write_memory(staging_memory, 0, data)
            .map_err(BridgeError::from)
            .and_then(|()| {
                self.run_upload(
                    driver,
                    tracker,
                    &[
                        RecordedCommand::ImageBarrier {
                            image: target,
                            aspect: color,
                            from: ImageState::ShaderRead,
                            to: ImageState::TransferDst,
                        },
                        RecordedCommand::CopyBufferToImage {
                            buffer: staging,
                            buffer_offset: 0,
                            image: target,
                            extent,
                            aspect: color,
                        },
                        RecordedCommand::ImageBarrier {
                            image: target,
                            aspect: color,
                            from: ImageState::TransferDst,
                            to: ImageState::ShaderRead,
                        },
                    ],
                )
            });
        match result {
            Ok(()) => {
                driver.destroy(staging);
                driver.destroy(staging_memory);
            }
            // The copy may still be in flight.
            Err(_) => self.retire(vec![staging, staging_memory], tracker.submitted()),
        }
        result
    }

    /// Descriptor set sampling `id`, allocated the first time it is bound.
    pub fn descriptor_set<D: Driver>(&mut self, driver: &mut D, id: ImageId) -> Result<GpuHandle> {
        let (existing, view) = {
            let image = self.image(id)?;
            (image.descriptor_set, image.view)
        };
        if let Some(set) = existing {
            return Ok(set);
        }
        let set = driver.allocate_descriptor_set(self.descriptor_pool, self.set_layout)?;
        if let Err(e) = driver.write_texture_descriptor(set, view, self.sampler) {
            driver.destroy(set);
            return Err(e.into());
        }
        if let Some(image) = self.images.get_mut(id.0) {
            image.descriptor_set = Some(set);
        }
        Ok(set)
    }

    /// Invalidate `id` now; its views are returned so dependants can be retired too.
    pub fn release_image(&mut self, id: ImageId, serial: u64) -> Result<Vec<GpuHandle>> {
        let image = self.images.remove(id.0).ok_or(BridgeError::InvalidResource {
            kind: "image",
            id: id.to_bits(),
        })?;
        trace!(image = ?image.handle, serial, "retiring image");
        self.retire(image.handles(), serial);
        Ok(image.views())
    }

    // ── Deferred destruction ────────────────────────────────

    /// Destroy `handles` once submission `serial` has completed.
    pub fn retire(&mut self, handles: Vec<GpuHandle>, serial: u64) {
        if !handles.is_empty() {
            self.retired.push(Retired { serial, handles });
        }
    }

    /// Pin objects released mid-frame to the serial that frame was submitted with.
    pub fn settle_unsubmitted(&mut self, serial: u64) {
        for retired in &mut self.retired {
            if retired.serial == UNSUBMITTED {
                retired.serial = serial;
            }
        }
    }

    /// Destroy everything retired at or before `completed_serial`.
    pub fn collect<D: Driver>(&mut self, driver: &mut D, completed_serial: u64) -> usize {
        let mut destroyed = 0;
        self.retired.retain(|retired| {
            if retired.serial > completed_serial {
                return true;
            }
            for handle in &retired.handles {
                driver.destroy(*handle);
            }
            destroyed += retired.handles.len();
            false
        });
        if destroyed > 0 {
            trace!(destroyed, completed_serial, "collected retired objects");
        }
        destroyed
    }

    pub fn retired_count(&self) -> usize {
        self.retired.iter().map(|r| r.handles.len()).sum()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    /// Destroy every resource and session object. All ids become stale.
    pub fn destroy<D: Driver>(&mut self, driver: &mut D) {
        let buffers = self.buffers.drain();
        let images = self.images.drain();
        if !buffers.is_empty() || !images.is_empty() {
            warn!(
                buffers = buffers.len(),
                images = images.len(),
                "destroying resources the host never released"
            );
        }
        for (_, buffer) in buffers {
            driver.destroy(buffer.handle);
            driver.destroy(buffer.memory);
        }
        for (_, image) in images {
            for handle in image.handles() {
                driver.destroy(handle);
            }
        }
        self.collect(driver, u64::MAX);
        if let Some(upload) = self.upload.take() {
            driver.destroy(upload.fence);
            driver.destroy(upload.command_buffer);
        }
        for handle in [
            std::mem::take(&mut self.descriptor_pool),
            std::mem::take(&mut self.set_layout),
            std::mem::take(&mut self.sampler),
        ] {
            if let Some(handle) = handle.non_null() {
                driver.destroy(handle);
            }
        }
    }
}

impl Default for ResourceTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anisotropy_gated_by_device() {
        let mut config = FixvkConfig::default();
        assert_eq!(sampler_anisotropy(&config, Some(16.0)), Some(16.0));
        assert_eq!(sampler_anisotropy(&config, Some(8.0)), Some(8.0));
        assert_eq!(sampler_anisotropy(&config, None), None);
        config.renderer.anisotropy_level = 4;
        assert_eq!(sampler_anisotropy(&config, Some(16.0)), Some(4.0));
        config.renderer.enable_anisotropy = false;
        assert_eq!(sampler_anisotropy(&config, Some(16.0)), None);
    }

    #[test]
    fn test_ids_round_trip_through_bits() {
        let id = ImageId(ArenaId::from_raw(3, 2));
        assert_eq!(ImageId::from_bits(id.to_bits()), id);
    }

    #[test]
    fn test_mid_frame_releases_wait_for_their_frame() {
        let mut driver = fixvk_driver::HeadlessDriver::new();
        let mut translator = ResourceTranslator::new();
        let handle = GpuHandle {
            id: 9,
            resource_type: fixvk_protocol::ResourceType::Buffer,
        };
        translator.retire(vec![handle], UNSUBMITTED);
        assert_eq!(translator.collect(&mut driver, 100), 0);
        translator.settle_unsubmitted(5);
        assert_eq!(translator.collect(&mut driver, 4), 0);
        assert_eq!(translator.collect(&mut driver, 5), 1);
        assert_eq!(translator.retired_count(), 0);
    }

    #[test]
    fn test_stale_ids_are_rejected() {
        let translator = ResourceTranslator::new();
        let id = BufferId(ArenaId::from_raw(0, 1));
        assert_eq!(
            translator.buffer(id).err(),
            Some(BridgeError::InvalidResource {
                kind: "buffer",
                id: id.to_bits()
            })
        );
    }
}
