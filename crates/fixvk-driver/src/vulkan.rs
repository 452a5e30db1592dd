use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};

use ash::{khr, vk};
use tracing::{debug, info, warn};

use fixvk_protocol::commands::RecordedCommand;
use fixvk_protocol::descriptors::*;
use fixvk_protocol::types::{
    AdapterKind, ClearValue, Extent2D, ImageState, MemoryLocation, Rect2D, Viewport,
};
use fixvk_protocol::{
    Driver, DriverError, DriverResult, GpuHandle, HandleAllocator, ResourceType, WindowTarget,
};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const ENTRY_POINT: &CStr = c"main";

/// Driver that executes everything on real GPU hardware via `ash`.
pub struct VulkanDriver {
    /// The ash Entry (loaded once)
    entry: ash::Entry,
    handles: HandleAllocator,
    instance: Option<InstanceState>,
    device: Option<DeviceState>,
    objects: HashMap<GpuHandle, VkObject>,
}

struct InstanceState {
    handle: GpuHandle,
    instance: ash::Instance,
    surface_fn: khr::surface::Instance,
    validation: bool,
}

struct DeviceState {
    handle: GpuHandle,
    device: ash::Device,
    swapchain_fn: khr::swapchain::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

enum VkObject {
    Surface(vk::SurfaceKHR),
    PhysicalDevice(vk::PhysicalDevice),
    Queue(vk::Queue),
    Swapchain {
        swapchain: vk::SwapchainKHR,
        images: Vec<GpuHandle>,
    },
    SwapchainImage(vk::Image),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Buffer(vk::Buffer),
    Memory {
        memory: vk::DeviceMemory,
        size: u64,
        mapped: Option<*mut c_void>,
    },
    Sampler(vk::Sampler),
    ShaderModule(vk::ShaderModule),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSet {
        set: vk::DescriptorSet,
        pool: vk::DescriptorPool,
    },
    PipelineLayout(vk::PipelineLayout),
    Pipeline(vk::Pipeline),
    RenderPass(vk::RenderPass),
    Framebuffer(vk::Framebuffer),
    CommandPool(vk::CommandPool),
    CommandBuffer {
        command_buffer: vk::CommandBuffer,
        pool: vk::CommandPool,
    },
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
}

// SAFETY: the driver is used from one thread at a time (the bridge takes
// `&mut self` for every call), and the raw mapped pointers are only touched
// through `&mut self`.
unsafe impl Send for VulkanDriver {}

/// Layout, access mask and pipeline stage for a barrier endpoint.
fn image_state_info(state: ImageState) -> (vk::ImageLayout, vk::AccessFlags, vk::PipelineStageFlags) {
    match state {
        ImageState::Undefined => (
            vk::ImageLayout::UNDEFINED,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TOP_OF_PIPE,
        ),
        ImageState::TransferSrc => (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ImageState::TransferDst => (
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ImageState::ShaderRead => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        ImageState::ColorAttachment => (
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        ImageState::DepthAttachment => (
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        ImageState::Present => (
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
    }
}

fn to_vk_extent(extent: Extent2D) -> vk::Extent2D {
    vk::Extent2D {
        width: extent.width,
        height: extent.height,
    }
}

fn to_vk_rect(rect: Rect2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D {
            x: rect.x,
            y: rect.y,
        },
        extent: vk::Extent2D {
            width: rect.width,
            height: rect.height,
        },
    }
}

fn to_vk_viewport(viewport: Viewport) -> vk::Viewport {
    vk::Viewport {
        x: viewport.x,
        y: viewport.y,
        width: viewport.width,
        height: viewport.height,
        min_depth: viewport.min_depth,
        max_depth: viewport.max_depth,
    }
}

fn to_vk_clear(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

fn subresource_layers(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: aspect,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn far_corner(extent: Extent2D) -> vk::Offset3D {
    vk::Offset3D {
        x: extent.width as i32,
        y: extent.height as i32,
        z: 1,
    }
}

fn adapter_kind(ty: vk::PhysicalDeviceType) -> AdapterKind {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => AdapterKind::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterKind::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterKind::Virtual,
        vk::PhysicalDeviceType::CPU => AdapterKind::Cpu,
        _ => AdapterKind::Other,
    }
}

impl VulkanDriver {
    /// Load the Vulkan loader from the system.
    pub fn new() -> DriverResult<Self> {
        // SAFETY: loading the system Vulkan library has no preconditions beyond
        // the library being a conforming loader.
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| DriverError::LoaderUnavailable(e.to_string()))?;
        info!("Vulkan entry loaded successfully");
        Ok(Self {
            entry,
            handles: HandleAllocator::new(),
            instance: None,
            device: None,
            objects: HashMap::new(),
        })
    }

    fn instance_state(&self) -> DriverResult<&InstanceState> {
        self.instance
            .as_ref()
            .ok_or_else(|| DriverError::Validation("no instance".into()))
    }

    fn device_state(&self) -> DriverResult<&DeviceState> {
        self.device
            .as_ref()
            .ok_or_else(|| DriverError::Validation("no logical device".into()))
    }

    fn device(&self) -> DriverResult<&ash::Device> {
        Ok(&self.device_state()?.device)
    }

    fn insert(&mut self, resource_type: ResourceType, object: VkObject) -> GpuHandle {
        let handle = self.handles.alloc(resource_type);
        self.objects.insert(handle, object);
        debug!("created {:?}", handle);
        handle
    }

    fn surface(&self, handle: GpuHandle) -> DriverResult<vk::SurfaceKHR> {
        match self.objects.get(&handle) {
            Some(VkObject::Surface(s)) => Ok(*s),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn physical_device(&self, handle: GpuHandle) -> DriverResult<vk::PhysicalDevice> {
        match self.objects.get(&handle) {
            Some(VkObject::PhysicalDevice(pd)) => Ok(*pd),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn queue(&self, handle: GpuHandle) -> DriverResult<vk::Queue> {
        match self.objects.get(&handle) {
            Some(VkObject::Queue(q)) => Ok(*q),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn swapchain(&self, handle: GpuHandle) -> DriverResult<vk::SwapchainKHR> {
        match self.objects.get(&handle) {
            Some(VkObject::Swapchain { swapchain, .. }) => Ok(*swapchain),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn image(&self, handle: GpuHandle) -> DriverResult<vk::Image> {
        match self.objects.get(&handle) {
            Some(VkObject::Image(i)) | Some(VkObject::SwapchainImage(i)) => Ok(*i),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn image_view(&self, handle: GpuHandle) -> DriverResult<vk::ImageView> {
        match self.objects.get(&handle) {
            Some(VkObject::ImageView(v)) => Ok(*v),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn buffer(&self, handle: GpuHandle) -> DriverResult<vk::Buffer> {
        match self.objects.get(&handle) {
            Some(VkObject::Buffer(b)) => Ok(*b),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn sampler(&self, handle: GpuHandle) -> DriverResult<vk::Sampler> {
        match self.objects.get(&handle) {
            Some(VkObject::Sampler(s)) => Ok(*s),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn shader_module(&self, handle: GpuHandle) -> DriverResult<vk::ShaderModule> {
        match self.objects.get(&handle) {
            Some(VkObject::ShaderModule(m)) => Ok(*m),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn set_layout(&self, handle: GpuHandle) -> DriverResult<vk::DescriptorSetLayout> {
        match self.objects.get(&handle) {
            Some(VkObject::DescriptorSetLayout(l)) => Ok(*l),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn descriptor_set(&self, handle: GpuHandle) -> DriverResult<vk::DescriptorSet> {
        match self.objects.get(&handle) {
            Some(VkObject::DescriptorSet { set, .. }) => Ok(*set),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn pipeline_layout(&self, handle: GpuHandle) -> DriverResult<vk::PipelineLayout> {
        match self.objects.get(&handle) {
            Some(VkObject::PipelineLayout(l)) => Ok(*l),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn pipeline(&self, handle: GpuHandle) -> DriverResult<vk::Pipeline> {
        match self.objects.get(&handle) {
            Some(VkObject::Pipeline(p)) => Ok(*p),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn render_pass(&self, handle: GpuHandle) -> DriverResult<vk::RenderPass> {
        match self.objects.get(&handle) {
            Some(VkObject::RenderPass(rp)) => Ok(*rp),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn framebuffer(&self, handle: GpuHandle) -> DriverResult<vk::Framebuffer> {
        match self.objects.get(&handle) {
            Some(VkObject::Framebuffer(fb)) => Ok(*fb),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn command_pool(&self, handle: GpuHandle) -> DriverResult<vk::CommandPool> {
        match self.objects.get(&handle) {
            Some(VkObject::CommandPool(p)) => Ok(*p),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn command_buffer(&self, handle: GpuHandle) -> DriverResult<vk::CommandBuffer> {
        match self.objects.get(&handle) {
            Some(VkObject::CommandBuffer { command_buffer, .. }) => Ok(*command_buffer),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn fence(&self, handle: GpuHandle) -> DriverResult<vk::Fence> {
        match self.objects.get(&handle) {
            Some(VkObject::Fence(f)) => Ok(*f),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn semaphore(&self, handle: GpuHandle) -> DriverResult<vk::Semaphore> {
        match self.objects.get(&handle) {
            Some(VkObject::Semaphore(s)) => Ok(*s),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn validation_layer_available(&self) -> bool {
        // SAFETY: plain enumeration through a loaded entry.
        let layers = match unsafe { self.entry.enumerate_instance_layer_properties() } {
            Ok(layers) => layers,
            Err(_) => return false,
        };
        layers.iter().any(|layer| {
            layer
                .layer_name_as_c_str()
                .is_ok_and(|name| name == VALIDATION_LAYER)
        })
    }

    fn find_memory_type(
        &self,
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> DriverResult<u32> {
        let props = &self.device_state()?.memory_properties;
        (0..props.memory_type_count)
            .find(|&i| {
                type_bits & (1 << i) != 0
                    && props.memory_types[i as usize].property_flags.contains(flags)
            })
            .ok_or_else(|| {
                DriverError::Unsupported(format!("no memory type with {:?}", flags))
            })
    }

    fn record_command(&self, cb: vk::CommandBuffer, command: &RecordedCommand) -> DriverResult<()> {
        let device = self.device()?;
        // SAFETY: every handle below was resolved from a live object of this
        // device and `cb` is in the recording state.
        unsafe {
            match command {
                RecordedCommand::BeginRenderPass {
                    render_pass,
                    framebuffer,
                    render_area,
                    clear_values,
                } => {
                    let clears: Vec<vk::ClearValue> =
                        clear_values.iter().copied().map(to_vk_clear).collect();
                    let info = vk::RenderPassBeginInfo::default()
                        .render_pass(self.render_pass(*render_pass)?)
                        .framebuffer(self.framebuffer(*framebuffer)?)
                        .render_area(to_vk_rect(*render_area))
                        .clear_values(&clears);
                    device.cmd_begin_render_pass(cb, &info, vk::SubpassContents::INLINE);
                }
                RecordedCommand::EndRenderPass => device.cmd_end_render_pass(cb),
                RecordedCommand::BindPipeline { pipeline } => device.cmd_bind_pipeline(
                    cb,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.pipeline(*pipeline)?,
                ),
                RecordedCommand::BindVertexBuffer { buffer, offset } => {
                    device.cmd_bind_vertex_buffers(cb, 0, &[self.buffer(*buffer)?], &[*offset])
                }
                RecordedCommand::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => device.cmd_bind_index_buffer(cb, self.buffer(*buffer)?, *offset, *index_type),
                RecordedCommand::BindDescriptorSet { layout, set } => device
                    .cmd_bind_descriptor_sets(
                        cb,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.pipeline_layout(*layout)?,
                        0,
                        &[self.descriptor_set(*set)?],
                        &[],
                    ),
                RecordedCommand::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => device.cmd_push_constants(
                    cb,
                    self.pipeline_layout(*layout)?,
                    *stages,
                    *offset,
                    data,
                ),
                RecordedCommand::SetViewport(viewport) => {
                    device.cmd_set_viewport(cb, 0, &[to_vk_viewport(*viewport)])
                }
                RecordedCommand::SetScissor(rect) => {
                    device.cmd_set_scissor(cb, 0, &[to_vk_rect(*rect)])
                }
                RecordedCommand::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(cb, *vertex_count, *instance_count, *first_vertex, *first_instance),
                RecordedCommand::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => device.cmd_draw_indexed(
                    cb,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *vertex_offset,
                    *first_instance,
                ),
                RecordedCommand::ClearAttachments { attachments, rects } => {
                    let attachments: Vec<vk::ClearAttachment> = attachments
                        .iter()
                        .map(|a| vk::ClearAttachment {
                            aspect_mask: a.aspect,
                            color_attachment: a.color_attachment,
                            clear_value: to_vk_clear(a.value),
                        })
                        .collect();
                    let rects: Vec<vk::ClearRect> = rects
                        .iter()
                        .map(|r| vk::ClearRect {
                            rect: to_vk_rect(*r),
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .collect();
                    device.cmd_clear_attachments(cb, &attachments, &rects);
                }
                RecordedCommand::ImageBarrier {
                    image,
                    aspect,
                    from,
                    to,
                } => {
                    let (old_layout, src_access, src_stage) = image_state_info(*from);
                    let (new_layout, dst_access, dst_stage) = image_state_info(*to);
                    let barrier = vk::ImageMemoryBarrier::default()
                        .old_layout(old_layout)
                        .new_layout(new_layout)
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .image(self.image(*image)?)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: *aspect,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        });
                    device.cmd_pipeline_barrier(
                        cb,
                        src_stage,
                        dst_stage,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[barrier],
                    );
                }
                RecordedCommand::CopyBufferToImage {
                    buffer,
                    buffer_offset,
                    image,
                    extent,
                    aspect,
                } => {
                    let region = vk::BufferImageCopy {
                        buffer_offset: *buffer_offset,
                        buffer_row_length: 0,
                        buffer_image_height: 0,
                        image_subresource: subresource_layers(*aspect),
                        image_offset: vk::Offset3D::default(),
                        image_extent: vk::Extent3D {
                            width: extent.width,
                            height: extent.height,
                            depth: 1,
                        },
                    };
                    device.cmd_copy_buffer_to_image(
                        cb,
                        self.buffer(*buffer)?,
                        self.image(*image)?,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                RecordedCommand::BlitImage {
                    src,
                    src_extent,
                    dst,
                    dst_extent,
                } => {
                    let region = vk::ImageBlit {
                        src_subresource: subresource_layers(vk::ImageAspectFlags::COLOR),
                        src_offsets: [vk::Offset3D::default(), far_corner(*src_extent)],
                        dst_subresource: subresource_layers(vk::ImageAspectFlags::COLOR),
                        dst_offsets: [vk::Offset3D::default(), far_corner(*dst_extent)],
                    };
                    device.cmd_blit_image(
                        cb,
                        self.image(*src)?,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        self.image(*dst)?,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                        vk::Filter::LINEAR,
                    );
                }
            }
        }
        Ok(())
    }
}

impl Driver for VulkanDriver {
    // ── Instance / device ───────────────────────────────────

    fn create_instance(&mut self, desc: &InstanceDesc) -> DriverResult<InstanceInfo> {
        if self.instance.is_some() {
            return Err(DriverError::Validation("instance already exists".into()));
        }
        let app_name = CString::new(desc.application_name.as_str()).unwrap_or_default();
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name.as_c_str())
            .engine_name(c"fixvk")
            .api_version(vk::make_api_version(0, 1, 1, 0));

        let mut extensions: Vec<*const c_char> = vec![khr::surface::NAME.as_ptr()];
        if let Some(display) = desc.display {
            let required = ash_window::enumerate_required_extensions(display)?;
            for ext in required {
                if !extensions.contains(ext) {
                    extensions.push(*ext);
                }
            }
        }

        let validation = desc.enable_validation && self.validation_layer_available();
        if desc.enable_validation && !validation {
            warn!("validation requested but {:?} is not installed", VALIDATION_LAYER);
        }
        let layers: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        // SAFETY: all pointers in `create_info` outlive the call.
        let instance = unsafe { self.entry.create_instance(&create_info, None) }?;
        let surface_fn = khr::surface::Instance::new(&self.entry, &instance);
        let handle = self.handles.alloc(ResourceType::Instance);
        self.instance = Some(InstanceState {
            handle,
            instance,
            surface_fn,
            validation,
        });
        info!("created Vulkan instance: {:?} (validation: {})", handle, validation);
        Ok(InstanceInfo {
            instance: handle,
            validation_enabled: validation,
        })
    }

    fn create_surface(
        &mut self,
        instance: GpuHandle,
        window: &WindowTarget,
    ) -> DriverResult<GpuHandle> {
        let state = self.instance_state()?;
        if state.handle != instance {
            return Err(DriverError::InvalidHandle(instance));
        }
        // SAFETY: the host guarantees the window outlives the surface.
        let surface = unsafe {
            ash_window::create_surface(
                &self.entry,
                &state.instance,
                window.display,
                window.window,
                None,
            )
        }?;
        Ok(self.insert(ResourceType::Surface, VkObject::Surface(surface)))
    }

    fn enumerate_adapters(
        &mut self,
        instance: GpuHandle,
        surface: Option<GpuHandle>,
    ) -> DriverResult<Vec<AdapterInfo>> {
        let surface = surface.map(|s| self.surface(s)).transpose()?;
        let state = self.instance_state()?;
        if state.handle != instance {
            return Err(DriverError::InvalidHandle(instance));
        }
        // SAFETY: queries on a live instance.
        let physical_devices = unsafe { state.instance.enumerate_physical_devices() }?;
        let mut found = Vec::with_capacity(physical_devices.len());
        for pd in physical_devices {
            let (props, features, families) = unsafe {
                (
                    state.instance.get_physical_device_properties(pd),
                    state.instance.get_physical_device_features(pd),
                    state.instance.get_physical_device_queue_family_properties(pd),
                )
            };
            let queue_family = families.iter().enumerate().find_map(|(i, family)| {
                let index = i as u32;
                if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                    return None;
                }
                let present = match surface {
                    // SAFETY: `pd` and `s` belong to this instance.
                    Some(s) => unsafe {
                        state
                            .surface_fn
                            .get_physical_device_surface_support(pd, index, s)
                            .unwrap_or(false)
                    },
                    None => true,
                };
                present.then_some(index)
            });
            let name = props
                .device_name_as_c_str()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            found.push((
                pd,
                AdapterInfo {
                    adapter: GpuHandle::null(),
                    name,
                    kind: adapter_kind(props.device_type),
                    api_version: props.api_version,
                    queue_family,
                    features: AdapterFeatures {
                        sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
                        fill_mode_non_solid: features.fill_mode_non_solid == vk::TRUE,
                    },
                    max_sampler_anisotropy: props.limits.max_sampler_anisotropy,
                },
            ));
        }
        let adapters = found
            .into_iter()
            .map(|(pd, mut info)| {
                info.adapter = self.insert(ResourceType::PhysicalDevice, VkObject::PhysicalDevice(pd));
                info
            })
            .collect::<Vec<_>>();
        debug!("enumerated {} physical devices", adapters.len());
        Ok(adapters)
    }

    fn create_device(&mut self, desc: &DeviceDesc) -> DriverResult<DeviceInfo> {
        let pd = self.physical_device(desc.adapter)?;
        if self.device.is_some() {
            return Err(DriverError::Validation("device already exists".into()));
        }
        let state = self.instance_state()?;
        let priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(desc.queue_family)
            .queue_priorities(&priorities)];
        let extensions = [khr::swapchain::NAME.as_ptr()];
        let layers: Vec<*const c_char> = if desc.enable_validation && state.validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };
        let features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(desc.features.sampler_anisotropy)
            .fill_mode_non_solid(desc.features.fill_mode_non_solid);
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers)
            .enabled_features(&features);

        // SAFETY: `pd` was enumerated from this instance and `create_info`
        // only points at locals that outlive the call.
        let device = unsafe { state.instance.create_device(pd, &create_info, None) }?;
        let swapchain_fn = khr::swapchain::Device::new(&state.instance, &device);
        let memory_properties = unsafe { state.instance.get_physical_device_memory_properties(pd) };
        let queue = unsafe { device.get_device_queue(desc.queue_family, 0) };

        let handle = self.handles.alloc(ResourceType::Device);
        self.device = Some(DeviceState {
            handle,
            device,
            swapchain_fn,
            memory_properties,
        });
        let queue = self.insert(ResourceType::Queue, VkObject::Queue(queue));
        info!("created Vulkan device: {:?}", handle);
        Ok(DeviceInfo {
            device: handle,
            queue,
        })
    }

    // ── Surface / swapchain ─────────────────────────────────

    fn surface_capabilities(
        &mut self,
        adapter: GpuHandle,
        surface: GpuHandle,
    ) -> DriverResult<SurfaceCapabilities> {
        let pd = self.physical_device(adapter)?;
        let surface = self.surface(surface)?;
        let surface_fn = &self.instance_state()?.surface_fn;
        // SAFETY: `pd` and `surface` belong to the live instance.
        let (caps, formats, modes) = unsafe {
            (
                surface_fn.get_physical_device_surface_capabilities(pd, surface)?,
                surface_fn.get_physical_device_surface_formats(pd, surface)?,
                surface_fn.get_physical_device_surface_present_modes(pd, surface)?,
            )
        };
        let current_extent = (caps.current_extent.width != u32::MAX).then_some(Extent2D::new(
            caps.current_extent.width,
            caps.current_extent.height,
        ));
        Ok(SurfaceCapabilities {
            min_image_count: caps.min_image_count,
            max_image_count: caps.max_image_count,
            current_extent,
            min_image_extent: Extent2D::new(
                caps.min_image_extent.width,
                caps.min_image_extent.height,
            ),
            max_image_extent: Extent2D::new(
                caps.max_image_extent.width,
                caps.max_image_extent.height,
            ),
            formats: formats
                .into_iter()
                .map(|f| SurfaceFormat {
                    format: f.format,
                    color_space: f.color_space,
                })
                .collect(),
            present_modes: modes,
        })
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> DriverResult<SwapchainInfo> {
        let surface = self.surface(desc.surface)?;
        let old = match desc.old_swapchain.non_null() {
            Some(old) => self.swapchain(old)?,
            None => vk::SwapchainKHR::null(),
        };
        let swapchain_fn = &self.device_state()?.swapchain_fn;
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(desc.image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(to_vk_extent(desc.extent))
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(old);
        // SAFETY: surface and old swapchain are live objects of this device.
        let (swapchain, raw_images) = unsafe {
            let swapchain = swapchain_fn.create_swapchain(&create_info, None)?;
            match swapchain_fn.get_swapchain_images(swapchain) {
                Ok(images) => (swapchain, images),
                Err(e) => {
                    swapchain_fn.destroy_swapchain(swapchain, None);
                    return Err(e.into());
                }
            }
        };
        let images: Vec<GpuHandle> = raw_images
            .into_iter()
            .map(|image| self.insert(ResourceType::SwapchainImage, VkObject::SwapchainImage(image)))
            .collect();
        let handle = self.insert(
            ResourceType::Swapchain,
            VkObject::Swapchain {
                swapchain,
                images: images.clone(),
            },
        );
        Ok(SwapchainInfo {
            swapchain: handle,
            images,
        })
    }

    fn acquire_next_image(
        &mut self,
        swapchain: GpuHandle,
        timeout_ns: u64,
        signal: GpuHandle,
    ) -> DriverResult<AcquiredImage> {
        let swapchain = self.swapchain(swapchain)?;
        let semaphore = self.semaphore(signal)?;
        let swapchain_fn = &self.device_state()?.swapchain_fn;
        // SAFETY: live swapchain and semaphore of this device.
        let (index, suboptimal) = unsafe {
            swapchain_fn.acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
        }?;
        Ok(AcquiredImage { index, suboptimal })
    }

    fn queue_present(
        &mut self,
        queue: GpuHandle,
        present: &PresentDesc,
    ) -> DriverResult<PresentStatus> {
        let queue = self.queue(queue)?;
        let swapchains = [self.swapchain(present.swapchain)?];
        let indices = [present.image_index];
        let waits: Vec<vk::Semaphore> = present
            .wait
            .map(|s| self.semaphore(s))
            .transpose()?
            .into_iter()
            .collect();
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        let swapchain_fn = &self.device_state()?.swapchain_fn;
        // SAFETY: every referenced object is alive for the duration of the call.
        let suboptimal = unsafe { swapchain_fn.queue_present(queue, &info) }?;
        Ok(if suboptimal {
            PresentStatus::Suboptimal
        } else {
            PresentStatus::Optimal
        })
    }

    // ── Resources ───────────────────────────────────────────

    fn create_buffer(&mut self, desc: &BufferDesc) -> DriverResult<GpuHandle> {
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: plain object creation on a live device.
        let buffer = unsafe { self.device()?.create_buffer(&info, None) }?;
        Ok(self.insert(ResourceType::Buffer, VkObject::Buffer(buffer)))
    }

    fn create_image(&mut self, desc: &ImageDesc) -> DriverResult<GpuHandle> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        // SAFETY: plain object creation on a live device.
        let image = unsafe { self.device()?.create_image(&info, None) }?;
        Ok(self.insert(ResourceType::Image, VkObject::Image(image)))
    }

    fn create_image_view(&mut self, desc: &ImageViewDesc) -> DriverResult<GpuHandle> {
        let image = self.image(desc.image)?;
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .components(vk::ComponentMapping {
                r: desc.swizzle.r,
                g: desc.swizzle.g,
                b: desc.swizzle.b,
                a: desc.swizzle.a,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: desc.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        // SAFETY: `image` is a live image of this device.
        let view = unsafe { self.device()?.create_image_view(&info, None) }?;
        Ok(self.insert(ResourceType::ImageView, VkObject::ImageView(view)))
    }

    fn memory_requirements(&mut self, resource: GpuHandle) -> DriverResult<MemoryRequirements> {
        let device = self.device()?;
        // SAFETY: queries on live objects.
        let reqs = match self.objects.get(&resource) {
            Some(VkObject::Buffer(b)) => unsafe { device.get_buffer_memory_requirements(*b) },
            Some(VkObject::Image(i)) => unsafe { device.get_image_memory_requirements(*i) },
            _ => return Err(DriverError::InvalidHandle(resource)),
        };
        Ok(MemoryRequirements {
            size: reqs.size,
            alignment: reqs.alignment,
            memory_type_bits: reqs.memory_type_bits,
        })
    }

    fn allocate_memory(
        &mut self,
        requirements: &MemoryRequirements,
        location: MemoryLocation,
    ) -> DriverResult<GpuHandle> {
        let flags = match location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let memory_type = self.find_memory_type(requirements.memory_type_bits, flags)?;
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let device = self.device()?;
        // SAFETY: allocation on a live device; host-visible memory stays
        // mapped until it is freed.
        let (memory, mapped) = unsafe {
            let memory = device.allocate_memory(&info, None)?;
            let mapped = match location {
                MemoryLocation::HostVisible => {
                    match device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) {
                        Ok(ptr) => Some(ptr),
                        Err(e) => {
                            device.free_memory(memory, None);
                            return Err(e.into());
                        }
                    }
                }
                MemoryLocation::DeviceLocal => None,
            };
            (memory, mapped)
        };
        Ok(self.insert(
            ResourceType::DeviceMemory,
            VkObject::Memory {
                memory,
                size: requirements.size,
                mapped,
            },
        ))
    }

    fn bind_memory(&mut self, resource: GpuHandle, memory: GpuHandle) -> DriverResult<()> {
        let mem = match self.objects.get(&memory) {
            Some(VkObject::Memory { memory, .. }) => *memory,
            _ => return Err(DriverError::InvalidHandle(memory)),
        };
        let device = self.device()?;
        // SAFETY: both objects are live and the memory was sized from the
        // resource's requirements.
        match self.objects.get(&resource) {
            Some(VkObject::Buffer(b)) => unsafe { device.bind_buffer_memory(*b, mem, 0) }?,
            Some(VkObject::Image(i)) => unsafe { device.bind_image_memory(*i, mem, 0) }?,
            _ => return Err(DriverError::InvalidHandle(resource)),
        }
        Ok(())
    }

    fn write_memory(&mut self, memory: GpuHandle, offset: u64, data: &[u8]) -> DriverResult<()> {
        let (size, ptr) = match self.objects.get(&memory) {
            Some(VkObject::Memory {
                size,
                mapped: Some(ptr),
                ..
            }) => (*size, *ptr),
            Some(VkObject::Memory { .. }) => {
                return Err(DriverError::Validation(
                    "write to memory that is not host visible".into(),
                ))
            }
            _ => return Err(DriverError::InvalidHandle(memory)),
        };
        if offset + data.len() as u64 > size {
            return Err(DriverError::Validation(format!(
                "write of {} bytes at {} overruns {} byte allocation",
                data.len(),
                offset,
                size
            )));
        }
        // SAFETY: the range was bounds-checked against the mapped allocation
        // and the memory is host-coherent.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (ptr as *mut u8).add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> DriverResult<GpuHandle> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .mip_lod_bias(desc.mip_lod_bias)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .compare_enable(false)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK);
        // SAFETY: plain object creation on a live device.
        let sampler = unsafe { self.device()?.create_sampler(&info, None) }?;
        Ok(self.insert(ResourceType::Sampler, VkObject::Sampler(sampler)))
    }

    // ── Pipelines ───────────────────────────────────────────

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DriverResult<GpuHandle> {
        let (color_final, _, _) = image_state_info(desc.color_final);
        let mut attachments = vec![vk::AttachmentDescription::default()
            .format(desc.color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(color_final)];
        if let Some(depth_format) = desc.depth_format {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(depth_format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::CLEAR)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
        }
        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if desc.depth_format.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .dst_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )];
        let subpasses = [subpass];
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);
        // SAFETY: `info` only borrows locals that outlive the call.
        let render_pass = unsafe { self.device()?.create_render_pass(&info, None) }?;
        Ok(self.insert(ResourceType::RenderPass, VkObject::RenderPass(render_pass)))
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> DriverResult<GpuHandle> {
        let render_pass = self.render_pass(desc.render_pass)?;
        let attachments = desc
            .attachments
            .iter()
            .map(|v| self.image_view(*v))
            .collect::<DriverResult<Vec<_>>>()?;
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(desc.extent.width)
            .height(desc.extent.height)
            .layers(1);
        // SAFETY: render pass and views are live objects of this device.
        let framebuffer = unsafe { self.device()?.create_framebuffer(&info, None) }?;
        Ok(self.insert(ResourceType::Framebuffer, VkObject::Framebuffer(framebuffer)))
    }

    fn create_shader_module(&mut self, code: &[u32]) -> DriverResult<GpuHandle> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        // SAFETY: `code` is SPIR-V produced by the shader compiler.
        let module = unsafe { self.device()?.create_shader_module(&info, None) }?;
        Ok(self.insert(ResourceType::ShaderModule, VkObject::ShaderModule(module)))
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> DriverResult<GpuHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(b.stages)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        // SAFETY: plain object creation on a live device.
        let layout = unsafe { self.device()?.create_descriptor_set_layout(&info, None) }?;
        Ok(self.insert(
            ResourceType::DescriptorSetLayout,
            VkObject::DescriptorSetLayout(layout),
        ))
    }

    fn create_pipeline_layout(&mut self, desc: &PipelineLayoutDesc) -> DriverResult<GpuHandle> {
        let set_layouts = desc
            .set_layouts
            .iter()
            .map(|l| self.set_layout(*l))
            .collect::<DriverResult<Vec<_>>>()?;
        let ranges: Vec<vk::PushConstantRange> = if desc.push_constant_size > 0 {
            vec![vk::PushConstantRange {
                stage_flags: desc.push_constant_stages,
                offset: 0,
                size: desc.push_constant_size,
            }]
        } else {
            Vec::new()
        };
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&ranges);
        // SAFETY: set layouts are live objects of this device.
        let layout = unsafe { self.device()?.create_pipeline_layout(&info, None) }?;
        Ok(self.insert(ResourceType::PipelineLayout, VkObject::PipelineLayout(layout)))
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
    ) -> DriverResult<GpuHandle> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(self.shader_module(desc.vertex_shader)?)
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(self.shader_module(desc.fragment_shader)?)
                .name(ENTRY_POINT),
        ];

        let vi_bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: desc.vertex_stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let vi_attrs: Vec<vk::VertexInputAttributeDescription> = desc
            .attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: 0,
                format: a.format,
                offset: a.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vi_bindings)
            .vertex_attribute_descriptions(&vi_attrs);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.topology);

        let (viewports, scissors, dynamic_states) = match desc.viewport {
            ViewportState::Dynamic => (
                Vec::new(),
                Vec::new(),
                vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            ),
            ViewportState::Fixed { viewport, scissor } => (
                vec![to_vk_viewport(viewport)],
                vec![to_vk_rect(scissor)],
                Vec::new(),
            ),
        };
        let viewport_state = if dynamic_states.is_empty() {
            vk::PipelineViewportStateCreateInfo::default()
                .viewports(&viewports)
                .scissors(&scissors)
        } else {
            vk::PipelineViewportStateCreateInfo::default()
                .viewport_count(1)
                .scissor_count(1)
        };
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth.test)
            .depth_write_enable(desc.depth.write)
            .depth_compare_op(desc.depth.compare)
            .max_depth_bounds(1.0);
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(desc.blend.enabled)
            .src_color_blend_factor(desc.blend.src_color)
            .dst_color_blend_factor(desc.blend.dst_color)
            .color_blend_op(desc.blend.color_op)
            .src_alpha_blend_factor(desc.blend.src_alpha)
            .dst_alpha_blend_factor(desc.blend.dst_alpha)
            .alpha_blend_op(desc.blend.alpha_op)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(self.pipeline_layout(desc.layout)?)
            .render_pass(self.render_pass(desc.render_pass)?)
            .subpass(0);

        // SAFETY: `info` only borrows locals that outlive the call.
        let pipelines = unsafe {
            self.device()?
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| DriverError::from(e))?;
        let pipeline = pipelines
            .into_iter()
            .next()
            .ok_or(DriverError::Vk(vk::Result::ERROR_UNKNOWN))?;
        Ok(self.insert(ResourceType::Pipeline, VkObject::Pipeline(pipeline)))
    }

    fn create_descriptor_pool(&mut self, desc: &DescriptorPoolDesc) -> DriverResult<GpuHandle> {
        let sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: desc.sampled_images,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: desc.samplers,
            },
        ];
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(desc.max_sets)
            .pool_sizes(&sizes);
        // SAFETY: plain object creation on a live device.
        let pool = unsafe { self.device()?.create_descriptor_pool(&info, None) }?;
        Ok(self.insert(ResourceType::DescriptorPool, VkObject::DescriptorPool(pool)))
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: GpuHandle,
        layout: GpuHandle,
    ) -> DriverResult<GpuHandle> {
        let vk_pool = match self.objects.get(&pool) {
            Some(VkObject::DescriptorPool(p)) => *p,
            _ => return Err(DriverError::InvalidHandle(pool)),
        };
        let layouts = [self.set_layout(layout)?];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(vk_pool)
            .set_layouts(&layouts);
        // SAFETY: pool and layout are live objects of this device.
        let sets = unsafe { self.device()?.allocate_descriptor_sets(&info) }?;
        let set = sets
            .into_iter()
            .next()
            .ok_or(DriverError::Vk(vk::Result::ERROR_OUT_OF_POOL_MEMORY))?;
        Ok(self.insert(
            ResourceType::DescriptorSet,
            VkObject::DescriptorSet { set, pool: vk_pool },
        ))
    }

    fn write_texture_descriptor(
        &mut self,
        set: GpuHandle,
        view: GpuHandle,
        sampler: GpuHandle,
    ) -> DriverResult<()> {
        let set = self.descriptor_set(set)?;
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: self.image_view(view)?,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let sampler_info = [vk::DescriptorImageInfo {
            sampler: self.sampler(sampler)?,
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        }];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&image_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .image_info(&sampler_info),
        ];
        // SAFETY: the set is not in use by a pending command buffer; the
        // bridge only writes freshly allocated sets.
        unsafe { self.device()?.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    // ── Commands / sync ─────────────────────────────────────

    fn create_command_pool(&mut self, queue_family: u32) -> DriverResult<GpuHandle> {
        let info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family);
        // SAFETY: plain object creation on a live device.
        let pool = unsafe { self.device()?.create_command_pool(&info, None) }?;
        Ok(self.insert(ResourceType::CommandPool, VkObject::CommandPool(pool)))
    }

    fn allocate_command_buffer(&mut self, pool: GpuHandle) -> DriverResult<GpuHandle> {
        let vk_pool = self.command_pool(pool)?;
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: `vk_pool` is a live pool of this device.
        let buffers = unsafe { self.device()?.allocate_command_buffers(&info) }?;
        let command_buffer = buffers
            .into_iter()
            .next()
            .ok_or(DriverError::OutOfHostMemory)?;
        Ok(self.insert(
            ResourceType::CommandBuffer,
            VkObject::CommandBuffer {
                command_buffer,
                pool: vk_pool,
            },
        ))
    }

    fn create_fence(&mut self, signaled: bool) -> DriverResult<GpuHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: plain object creation on a live device.
        let fence = unsafe { self.device()?.create_fence(&info, None) }?;
        Ok(self.insert(ResourceType::Fence, VkObject::Fence(fence)))
    }

    fn create_semaphore(&mut self) -> DriverResult<GpuHandle> {
        let info = vk::SemaphoreCreateInfo::default();
        // SAFETY: plain object creation on a live device.
        let semaphore = unsafe { self.device()?.create_semaphore(&info, None) }?;
        Ok(self.insert(ResourceType::Semaphore, VkObject::Semaphore(semaphore)))
    }

    fn wait_for_fence(&mut self, fence: GpuHandle, timeout_ns: u64) -> DriverResult<()> {
        let fence = self.fence(fence)?;
        // SAFETY: live fence of this device.
        unsafe { self.device()?.wait_for_fences(&[fence], true, timeout_ns) }?;
        Ok(())
    }

    fn reset_fence(&mut self, fence: GpuHandle) -> DriverResult<()> {
        let fence = self.fence(fence)?;
        // SAFETY: the caller waited on the fence before resetting it.
        unsafe { self.device()?.reset_fences(&[fence]) }?;
        Ok(())
    }

    fn begin_command_buffer(&mut self, command_buffer: GpuHandle) -> DriverResult<()> {
        let cb = self.command_buffer(command_buffer)?;
        let device = self.device()?;
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: the pool allows individual resets and the caller has waited
        // for the previous submission of `cb`.
        unsafe {
            device.reset_command_buffer(cb, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(cb, &info)?;
        }
        Ok(())
    }

    fn record(&mut self, command_buffer: GpuHandle, command: &RecordedCommand) -> DriverResult<()> {
        let cb = self.command_buffer(command_buffer)?;
        self.record_command(cb, command)
    }

    fn end_command_buffer(&mut self, command_buffer: GpuHandle) -> DriverResult<()> {
        let cb = self.command_buffer(command_buffer)?;
        // SAFETY: `cb` is in the recording state.
        unsafe { self.device()?.end_command_buffer(cb) }?;
        Ok(())
    }

    fn queue_submit(&mut self, queue: GpuHandle, submit: &SubmitDesc) -> DriverResult<()> {
        let queue = self.queue(queue)?;
        let command_buffers = [self.command_buffer(submit.command_buffer)?];
        let (wait_semaphores, wait_stages) = match submit.wait {
            Some((semaphore, stage)) => (vec![self.semaphore(semaphore)?], vec![stage]),
            None => (Vec::new(), Vec::new()),
        };
        let signal_semaphores: Vec<vk::Semaphore> = submit
            .signal
            .map(|s| self.semaphore(s))
            .transpose()?
            .into_iter()
            .collect();
        let fence = match submit.fence {
            Some(f) => self.fence(f)?,
            None => vk::Fence::null(),
        };
        let info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        // SAFETY: every referenced object is alive until the fence signals.
        unsafe { self.device()?.queue_submit(queue, &[info], fence) }?;
        Ok(())
    }

    fn device_wait_idle(&mut self) -> DriverResult<()> {
        // SAFETY: live device.
        unsafe { self.device()?.device_wait_idle() }?;
        Ok(())
    }

    fn destroy(&mut self, handle: GpuHandle) {
        if handle.resource_type == ResourceType::Device {
            if let Some(state) = self.device.take_if(|d| d.handle == handle) {
                self.objects
                    .retain(|h, _| h.resource_type != ResourceType::Queue);
                // SAFETY: all children were destroyed by the session before
                // the device.
                unsafe { state.device.destroy_device(None) };
                debug!("destroyed Vulkan device: {:?}", handle);
            }
            return;
        }
        if handle.resource_type == ResourceType::Instance {
            if let Some(state) = self.instance.take_if(|i| i.handle == handle) {
                self.objects
                    .retain(|h, _| h.resource_type != ResourceType::PhysicalDevice);
                // SAFETY: the device and surfaces are gone by now.
                unsafe { state.instance.destroy_instance(None) };
                debug!("destroyed Vulkan instance: {:?}", handle);
            }
            return;
        }

        let Some(object) = self.objects.remove(&handle) else {
            return;
        };
        if let VkObject::Surface(surface) = object {
            if let Some(state) = &self.instance {
                // SAFETY: the swapchain using this surface was destroyed first.
                unsafe { state.surface_fn.destroy_surface(surface, None) };
            }
            debug!("destroyed {:?}", handle);
            return;
        }
        let Some(state) = &self.device else {
            warn!("{:?} outlived its device", handle);
            return;
        };
        let device = &state.device;
        // SAFETY: the bridge only destroys objects once no pending submission
        // references them.
        unsafe {
            match object {
                VkObject::Swapchain { swapchain, images } => {
                    for image in images {
                        self.objects.remove(&image);
                    }
                    state.swapchain_fn.destroy_swapchain(swapchain, None);
                }
                VkObject::Image(i) => device.destroy_image(i, None),
                VkObject::ImageView(v) => device.destroy_image_view(v, None),
                VkObject::Buffer(b) => device.destroy_buffer(b, None),
                VkObject::Memory { memory, mapped, .. } => {
                    if mapped.is_some() {
                        device.unmap_memory(memory);
                    }
                    device.free_memory(memory, None);
                }
                VkObject::Sampler(s) => device.destroy_sampler(s, None),
                VkObject::ShaderModule(m) => device.destroy_shader_module(m, None),
                VkObject::DescriptorSetLayout(l) => device.destroy_descriptor_set_layout(l, None),
                VkObject::DescriptorPool(p) => {
                    self.objects.retain(
                        |_, o| !matches!(o, VkObject::DescriptorSet { pool, .. } if *pool == p),
                    );
                    device.destroy_descriptor_pool(p, None);
                }
                VkObject::DescriptorSet { set, pool } => {
                    if let Err(e) = device.free_descriptor_sets(pool, &[set]) {
                        warn!("vkFreeDescriptorSets failed for {:?}: {:?}", handle, e);
                    }
                }
                VkObject::PipelineLayout(l) => device.destroy_pipeline_layout(l, None),
                VkObject::Pipeline(p) => device.destroy_pipeline(p, None),
                VkObject::RenderPass(rp) => device.destroy_render_pass(rp, None),
                VkObject::Framebuffer(fb) => device.destroy_framebuffer(fb, None),
                VkObject::CommandPool(p) => {
                    self.objects.retain(
                        |_, o| !matches!(o, VkObject::CommandBuffer { pool, .. } if *pool == p),
                    );
                    device.destroy_command_pool(p, None);
                }
                VkObject::CommandBuffer {
                    command_buffer,
                    pool,
                } => device.free_command_buffers(pool, &[command_buffer]),
                VkObject::Fence(f) => device.destroy_fence(f, None),
                VkObject::Semaphore(s) => device.destroy_semaphore(s, None),
                VkObject::Surface(_)
                | VkObject::PhysicalDevice(_)
                | VkObject::Queue(_)
                | VkObject::SwapchainImage(_) => {}
            }
        }
        debug!("destroyed {:?}", handle);
    }
}

impl Drop for VulkanDriver {
    fn drop(&mut self) {
        if !self.objects.is_empty() || self.device.is_some() {
            warn!(
                "Vulkan driver dropped with {} live objects",
                self.objects.len()
            );
        }
    }
}
