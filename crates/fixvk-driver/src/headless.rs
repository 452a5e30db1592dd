//! In-memory driver that simulates a single GPU.
//!
//! Every call is validated the way the Vulkan validation layer would flag
//! the obvious mistakes (use of destroyed handles, recording outside a
//! render pass, reusing an in-flight command buffer) and logged, so tests
//! can assert on exactly what the bridge asked for. GPU work completes when
//! something waits on it, which keeps fence behaviour deterministic.

use std::collections::HashMap;

use ash::vk;
use tracing::trace;

use fixvk_protocol::commands::RecordedCommand;
use fixvk_protocol::descriptors::*;
use fixvk_protocol::types::{AdapterKind, Extent2D, MemoryLocation};
use fixvk_protocol::{
    Driver, DriverError, DriverResult, GpuHandle, HandleAllocator, ResourceType, WindowTarget,
};

/// One entry in the driver's call log.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Create { resource_type: ResourceType, handle: GpuHandle },
    Destroy { handle: GpuHandle },
    EnumerateAdapters,
    SurfaceCapabilities,
    BindMemory { resource: GpuHandle, memory: GpuHandle },
    WriteMemory { memory: GpuHandle, offset: u64, len: usize },
    WriteDescriptor { set: GpuHandle },
    WaitForFence { fence: GpuHandle, timeout_ns: u64 },
    ResetFence { fence: GpuHandle },
    AcquireNextImage { swapchain: GpuHandle, index: Option<u32> },
    BeginCommandBuffer { command_buffer: GpuHandle },
    Record { command_buffer: GpuHandle, command: RecordedCommand },
    EndCommandBuffer { command_buffer: GpuHandle },
    QueueSubmit(SubmitDesc),
    QueuePresent(PresentDesc),
    DeviceWaitIdle,
}

/// A queue submission together with the commands it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub serial: u64,
    pub desc: SubmitDesc,
    pub commands: Vec<RecordedCommand>,
}

impl Submission {
    pub fn count(&self, pred: impl Fn(&RecordedCommand) -> bool) -> usize {
        self.commands.iter().filter(|c| pred(c)).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresentRecord {
    pub desc: PresentDesc,
    pub result: DriverResult<PresentStatus>,
}

/// Description of a simulated physical device.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadlessAdapter {
    pub name: String,
    pub kind: AdapterKind,
    pub features: AdapterFeatures,
    pub max_sampler_anisotropy: f32,
    pub graphics: bool,
    pub present: bool,
}

impl Default for HeadlessAdapter {
    fn default() -> Self {
        Self {
            name: "fixvk headless adapter".to_string(),
            kind: AdapterKind::Discrete,
            features: AdapterFeatures {
                sampler_anisotropy: true,
                fill_mode_non_solid: true,
            },
            max_sampler_anisotropy: 16.0,
            graphics: true,
            present: true,
        }
    }
}

fn default_surface_capabilities() -> SurfaceCapabilities {
    SurfaceCapabilities {
        min_image_count: 2,
        max_image_count: 3,
        current_extent: None,
        min_image_extent: Extent2D::new(1, 1),
        max_image_extent: Extent2D::new(16384, 16384),
        formats: vec![
            SurfaceFormat {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            SurfaceFormat {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ],
        present_modes: vec![
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
}

enum Object {
    Instance,
    Surface,
    PhysicalDevice(usize),
    Device(DeviceDesc),
    Queue,
    Swapchain {
        desc: SwapchainDesc,
        images: Vec<GpuHandle>,
        next_index: u32,
    },
    SwapchainImage,
    Buffer {
        desc: BufferDesc,
        memory: Option<GpuHandle>,
    },
    Image {
        desc: ImageDesc,
        memory: Option<GpuHandle>,
    },
    ImageView(ImageViewDesc),
    Memory {
        size: u64,
        location: MemoryLocation,
        contents: Vec<u8>,
    },
    Sampler(SamplerDesc),
    ShaderModule,
    DescriptorSetLayout,
    DescriptorPool {
        desc: DescriptorPoolDesc,
        allocated: u32,
    },
    DescriptorSet {
        pool: GpuHandle,
    },
    PipelineLayout,
    Pipeline(GraphicsPipelineDesc),
    RenderPass(RenderPassDesc),
    Framebuffer,
    CommandPool,
    CommandBuffer {
        pool: GpuHandle,
        state: RecordingState,
        in_render_pass: bool,
        pending: Option<u64>,
        commands: Vec<RecordedCommand>,
    },
    Fence {
        signaled: bool,
        pending: Option<u64>,
    },
    Semaphore {
        signaled: bool,
    },
}

/// Simulated GPU implementing [`Driver`] without touching any hardware.
pub struct HeadlessDriver {
    handles: HandleAllocator,
    objects: HashMap<GpuHandle, Object>,
    calls: Vec<DriverCall>,
    submissions: Vec<Submission>,
    presents: Vec<PresentRecord>,

    adapters: Vec<HeadlessAdapter>,
    surface_caps: SurfaceCapabilities,
    validation_layer_available: bool,
    instance: Option<GpuHandle>,
    device: Option<GpuHandle>,

    submitted_serial: u64,
    completed_serial: u64,
    allocated_bytes: u64,

    // Fault injection
    gpu_stalled: bool,
    memory_budget: Option<u64>,
    fail_pipelines: bool,
    out_of_date_acquires: u32,
    out_of_date_presents: u32,
    suboptimal_presents: u32,
    create_failures: HashMap<ResourceType, DriverError>,
}

impl HeadlessDriver {
    pub fn new() -> Self {
        Self {
            handles: HandleAllocator::new(),
            objects: HashMap::new(),
            calls: Vec::new(),
            submissions: Vec::new(),
            presents: Vec::new(),
            adapters: vec![HeadlessAdapter::default()],
            surface_caps: default_surface_capabilities(),
            validation_layer_available: true,
            instance: None,
            device: None,
            submitted_serial: 0,
            completed_serial: 0,
            allocated_bytes: 0,
            gpu_stalled: false,
            memory_budget: None,
            fail_pipelines: false,
            out_of_date_acquires: 0,
            out_of_date_presents: 0,
            suboptimal_presents: 0,
            create_failures: HashMap::new(),
        }
    }

    pub fn with_adapters(mut self, adapters: Vec<HeadlessAdapter>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_surface_capabilities(mut self, caps: SurfaceCapabilities) -> Self {
        self.surface_caps = caps;
        self
    }

    /// Surface properties reported from now on, e.g. to simulate a window resize.
    pub fn surface_capabilities_mut(&mut self) -> &mut SurfaceCapabilities {
        &mut self.surface_caps
    }

    pub fn set_validation_layer_available(&mut self, available: bool) {
        self.validation_layer_available = available;
    }

    // ── Fault injection ─────────────────────────────────────

    /// When stalled, submitted work never completes.
    pub fn stall_gpu(&mut self, stalled: bool) {
        self.gpu_stalled = stalled;
    }

    /// Total bytes of memory that may be allocated at once.
    pub fn set_memory_budget(&mut self, budget: Option<u64>) {
        self.memory_budget = budget;
    }

    pub fn fail_pipeline_creation(&mut self, fail: bool) {
        self.fail_pipelines = fail;
    }

    pub fn fail_next_acquires(&mut self, count: u32) {
        self.out_of_date_acquires = count;
    }

    pub fn fail_next_presents(&mut self, count: u32) {
        self.out_of_date_presents = count;
    }

    pub fn suboptimal_next_presents(&mut self, count: u32) {
        self.suboptimal_presents = count;
    }

    /// Make the next creation of `resource_type` fail with `error`.
    pub fn fail_next_create(&mut self, resource_type: ResourceType, error: DriverError) {
        self.create_failures.insert(resource_type, error);
    }

    // ── Introspection ───────────────────────────────────────

    pub fn calls(&self) -> &[DriverCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    pub fn presents(&self) -> &[PresentRecord] {
        &self.presents
    }

    /// Number of objects that still need a destroy call.
    pub fn live_objects(&self) -> usize {
        self.objects
            .keys()
            .filter(|h| !h.resource_type.is_borrowed())
            .count()
    }

    pub fn live_count(&self, resource_type: ResourceType) -> usize {
        self.objects
            .keys()
            .filter(|h| h.resource_type == resource_type)
            .count()
    }

    /// Live handles of one type, in creation order.
    pub fn live_handles(&self, resource_type: ResourceType) -> Vec<GpuHandle> {
        let mut handles: Vec<GpuHandle> = self
            .objects
            .keys()
            .filter(|h| h.resource_type == resource_type)
            .copied()
            .collect();
        handles.sort();
        handles
    }

    pub fn is_live(&self, handle: GpuHandle) -> bool {
        self.objects.contains_key(&handle)
    }

    /// Resource types in the order their first object was created.
    pub fn creation_order(&self) -> Vec<ResourceType> {
        let mut order = Vec::new();
        for call in &self.calls {
            if let DriverCall::Create { resource_type, .. } = call {
                if !order.contains(resource_type) {
                    order.push(*resource_type);
                }
            }
        }
        order
    }

    pub fn count_calls(&self, pred: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls.iter().filter(|c| pred(c)).count()
    }

    /// The most recently created swapchain that is still alive.
    pub fn current_swapchain(&self) -> Option<(GpuHandle, SwapchainDesc, Vec<GpuHandle>)> {
        self.live_handles(ResourceType::Swapchain)
            .into_iter()
            .last()
            .and_then(|h| match self.objects.get(&h) {
                Some(Object::Swapchain { desc, images, .. }) => Some((h, *desc, images.clone())),
                _ => None,
            })
    }

    pub fn pipeline_desc(&self, pipeline: GpuHandle) -> Option<&GraphicsPipelineDesc> {
        match self.objects.get(&pipeline) {
            Some(Object::Pipeline(desc)) => Some(desc),
            _ => None,
        }
    }

    pub fn render_pass_desc(&self, render_pass: GpuHandle) -> Option<&RenderPassDesc> {
        match self.objects.get(&render_pass) {
            Some(Object::RenderPass(desc)) => Some(desc),
            _ => None,
        }
    }

    pub fn sampler_descs(&self) -> Vec<SamplerDesc> {
        self.objects
            .values()
            .filter_map(|o| match o {
                Object::Sampler(desc) => Some(*desc),
                _ => None,
            })
            .collect()
    }

    pub fn device_desc(&self) -> Option<DeviceDesc> {
        self.device.and_then(|d| match self.objects.get(&d) {
            Some(Object::Device(desc)) => Some(*desc),
            _ => None,
        })
    }

    pub fn image_desc(&self, image: GpuHandle) -> Option<ImageDesc> {
        match self.objects.get(&image) {
            Some(Object::Image { desc, .. }) => Some(*desc),
            _ => None,
        }
    }

    pub fn image_view_desc(&self, view: GpuHandle) -> Option<ImageViewDesc> {
        match self.objects.get(&view) {
            Some(Object::ImageView(desc)) => Some(*desc),
            _ => None,
        }
    }

    pub fn buffer_desc(&self, buffer: GpuHandle) -> Option<BufferDesc> {
        match self.objects.get(&buffer) {
            Some(Object::Buffer { desc, .. }) => Some(*desc),
            _ => None,
        }
    }

    /// Bytes currently stored in the memory bound to a host-visible buffer.
    pub fn buffer_contents(&self, buffer: GpuHandle) -> Option<&[u8]> {
        let memory = match self.objects.get(&buffer) {
            Some(Object::Buffer { memory, .. }) => (*memory)?,
            _ => return None,
        };
        match self.objects.get(&memory) {
            Some(Object::Memory { contents, .. }) => Some(contents.as_slice()),
            _ => None,
        }
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    pub fn submitted_serial(&self) -> u64 {
        self.submitted_serial
    }

    pub fn completed_serial(&self) -> u64 {
        self.completed_serial
    }

    /// Let the GPU finish everything submitted so far.
    pub fn complete_all(&mut self) {
        self.complete_through(self.submitted_serial);
    }

    // ── Internals ───────────────────────────────────────────

    fn alloc(&mut self, resource_type: ResourceType, object: Object) -> DriverResult<GpuHandle> {
        if let Some(err) = self.create_failures.remove(&resource_type) {
            trace!("injected failure creating {:?}: {}", resource_type, err);
            return Err(err);
        }
        let handle = self.handles.alloc(resource_type);
        self.objects.insert(handle, object);
        self.calls.push(DriverCall::Create {
            resource_type,
            handle,
        });
        trace!("created {:?}", handle);
        Ok(handle)
    }

    fn require(&self, handle: GpuHandle, resource_type: ResourceType) -> DriverResult<()> {
        if handle.resource_type == resource_type && self.objects.contains_key(&handle) {
            Ok(())
        } else {
            Err(DriverError::InvalidHandle(handle))
        }
    }

    fn require_device(&self) -> DriverResult<()> {
        if self.device.is_some() {
            Ok(())
        } else {
            Err(DriverError::Validation("no logical device".into()))
        }
    }

    fn complete_through(&mut self, serial: u64) {
        if serial <= self.completed_serial {
            return;
        }
        self.completed_serial = serial;
        for object in self.objects.values_mut() {
            match object {
                Object::Fence { signaled, pending } => {
                    if pending.is_some_and(|s| s <= serial) {
                        *pending = None;
                        *signaled = true;
                    }
                }
                Object::CommandBuffer { pending, .. } => {
                    if pending.is_some_and(|s| s <= serial) {
                        *pending = None;
                    }
                }
                _ => {}
            }
        }
    }

    fn semaphore_mut(&mut self, handle: GpuHandle) -> DriverResult<&mut bool> {
        match self.objects.get_mut(&handle) {
            Some(Object::Semaphore { signaled }) => Ok(signaled),
            _ => Err(DriverError::InvalidHandle(handle)),
        }
    }

    fn validate_command(&self, command: &RecordedCommand) -> DriverResult<()> {
        match command {
            RecordedCommand::BeginRenderPass {
                render_pass,
                framebuffer,
                ..
            } => {
                self.require(*render_pass, ResourceType::RenderPass)?;
                self.require(*framebuffer, ResourceType::Framebuffer)
            }
            RecordedCommand::BindPipeline { pipeline } => {
                self.require(*pipeline, ResourceType::Pipeline)
            }
            RecordedCommand::BindVertexBuffer { buffer, .. }
            | RecordedCommand::BindIndexBuffer { buffer, .. } => {
                match self.objects.get(buffer) {
                    Some(Object::Buffer {
                        memory: Some(_), ..
                    }) => Ok(()),
                    Some(Object::Buffer { memory: None, .. }) => Err(DriverError::Validation(
                        format!("buffer {:?} has no memory bound", buffer),
                    )),
                    _ => Err(DriverError::InvalidHandle(*buffer)),
                }
            }
            RecordedCommand::BindDescriptorSet { layout, set } => {
                self.require(*layout, ResourceType::PipelineLayout)?;
                self.require(*set, ResourceType::DescriptorSet)
            }
            RecordedCommand::PushConstants { layout, .. } => {
                self.require(*layout, ResourceType::PipelineLayout)
            }
            RecordedCommand::ImageBarrier { image, .. } => self.require_image(*image),
            RecordedCommand::CopyBufferToImage { buffer, image, .. } => {
                self.require(*buffer, ResourceType::Buffer)?;
                self.require_image(*image)
            }
            RecordedCommand::BlitImage { src, dst, .. } => {
                self.require_image(*src)?;
                self.require_image(*dst)
            }
            _ => Ok(()),
        }
    }

    fn require_image(&self, image: GpuHandle) -> DriverResult<()> {
        self.require(image, ResourceType::Image)
            .or_else(|_| self.require(image, ResourceType::SwapchainImage))
    }
}

impl Default for HeadlessDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn outside_pass_only(command: &RecordedCommand) -> bool {
    matches!(
        command,
        RecordedCommand::ImageBarrier { .. }
            | RecordedCommand::CopyBufferToImage { .. }
            | RecordedCommand::BlitImage { .. }
    )
}

fn inside_pass_only(command: &RecordedCommand) -> bool {
    matches!(
        command,
        RecordedCommand::Draw { .. }
            | RecordedCommand::DrawIndexed { .. }
            | RecordedCommand::ClearAttachments { .. }
    )
}

impl Driver for HeadlessDriver {
    fn create_instance(&mut self, desc: &InstanceDesc) -> DriverResult<InstanceInfo> {
        if self.instance.is_some() {
            return Err(DriverError::Validation("instance already exists".into()));
        }
        let instance = self.alloc(ResourceType::Instance, Object::Instance)?;
        self.instance = Some(instance);
        Ok(InstanceInfo {
            instance,
            validation_enabled: desc.enable_validation && self.validation_layer_available,
        })
    }

    fn create_surface(
        &mut self,
        instance: GpuHandle,
        _window: &WindowTarget,
    ) -> DriverResult<GpuHandle> {
        self.require(instance, ResourceType::Instance)?;
        self.alloc(ResourceType::Surface, Object::Surface)
    }

    fn enumerate_adapters(
        &mut self,
        instance: GpuHandle,
        surface: Option<GpuHandle>,
    ) -> DriverResult<Vec<AdapterInfo>> {
        self.require(instance, ResourceType::Instance)?;
        if let Some(surface) = surface {
            self.require(surface, ResourceType::Surface)?;
        }
        self.calls.push(DriverCall::EnumerateAdapters);
        let mut out = Vec::with_capacity(self.adapters.len());
        for index in 0..self.adapters.len() {
            let adapter = self.handles.alloc(ResourceType::PhysicalDevice);
            self.objects.insert(adapter, Object::PhysicalDevice(index));
            let template = &self.adapters[index];
            let usable = template.graphics && (surface.is_none() || template.present);
            out.push(AdapterInfo {
                adapter,
                name: template.name.clone(),
                kind: template.kind,
                api_version: vk::make_api_version(0, 1, 3, 0),
                queue_family: usable.then_some(0),
                features: template.features,
                max_sampler_anisotropy: template.max_sampler_anisotropy,
            });
        }
        Ok(out)
    }

    fn create_device(&mut self, desc: &DeviceDesc) -> DriverResult<DeviceInfo> {
        let index = match self.objects.get(&desc.adapter) {
            Some(Object::PhysicalDevice(index)) => *index,
            _ => return Err(DriverError::InvalidHandle(desc.adapter)),
        };
        if self.device.is_some() {
            return Err(DriverError::Validation("device already exists".into()));
        }
        let adapter = &self.adapters[index];
        if (desc.features.sampler_anisotropy && !adapter.features.sampler_anisotropy)
            || (desc.features.fill_mode_non_solid && !adapter.features.fill_mode_non_solid)
        {
            return Err(DriverError::Vk(vk::Result::ERROR_FEATURE_NOT_PRESENT));
        }
        let device = self.alloc(ResourceType::Device, Object::Device(*desc))?;
        let queue = self.handles.alloc(ResourceType::Queue);
        self.objects.insert(queue, Object::Queue);
        self.device = Some(device);
        Ok(DeviceInfo { device, queue })
    }

    fn surface_capabilities(
        &mut self,
        adapter: GpuHandle,
        surface: GpuHandle,
    ) -> DriverResult<SurfaceCapabilities> {
        self.require(adapter, ResourceType::PhysicalDevice)?;
        self.require(surface, ResourceType::Surface)?;
        self.calls.push(DriverCall::SurfaceCapabilities);
        Ok(self.surface_caps.clone())
    }

    fn create_swapchain(&mut self, desc: &SwapchainDesc) -> DriverResult<SwapchainInfo> {
        self.require_device()?;
        self.require(desc.surface, ResourceType::Surface)?;
        if let Some(old) = desc.old_swapchain.non_null() {
            self.require(old, ResourceType::Swapchain)?;
        }
        let caps = &self.surface_caps;
        if desc.extent.is_empty() {
            return Err(DriverError::Validation("zero-sized swapchain".into()));
        }
        if desc.image_count < caps.min_image_count
            || (caps.max_image_count > 0 && desc.image_count > caps.max_image_count)
        {
            return Err(DriverError::Validation(format!(
                "image count {} outside {}..={}",
                desc.image_count, caps.min_image_count, caps.max_image_count
            )));
        }
        if !caps.formats.contains(&desc.format) {
            return Err(DriverError::Validation(format!(
                "surface format {:?} not supported",
                desc.format
            )));
        }
        if !caps.present_modes.contains(&desc.present_mode) {
            return Err(DriverError::Validation(format!(
                "present mode {:?} not supported",
                desc.present_mode
            )));
        }
        let mut images = Vec::with_capacity(desc.image_count as usize);
        for _ in 0..desc.image_count {
            let image = self.handles.alloc(ResourceType::SwapchainImage);
            self.objects.insert(image, Object::SwapchainImage);
            images.push(image);
        }
        let swapchain = match self.alloc(
            ResourceType::Swapchain,
            Object::Swapchain {
                desc: *desc,
                images: images.clone(),
                next_index: 0,
            },
        ) {
            Ok(handle) => handle,
            Err(e) => {
                for image in &images {
                    self.objects.remove(image);
                }
                return Err(e);
            }
        };
        Ok(SwapchainInfo { swapchain, images })
    }

    fn acquire_next_image(
        &mut self,
        swapchain: GpuHandle,
        _timeout_ns: u64,
        signal: GpuHandle,
    ) -> DriverResult<AcquiredImage> {
        self.require(swapchain, ResourceType::Swapchain)?;
        if *self.semaphore_mut(signal)? {
            return Err(DriverError::Validation(
                "acquire semaphore is already signaled".into(),
            ));
        }
        if self.out_of_date_acquires > 0 {
            self.out_of_date_acquires -= 1;
            self.calls.push(DriverCall::AcquireNextImage {
                swapchain,
                index: None,
            });
            return Err(DriverError::OutOfDate);
        }
        let index = match self.objects.get_mut(&swapchain) {
            Some(Object::Swapchain {
                images, next_index, ..
            }) => {
                let index = *next_index;
                *next_index = (index + 1) % images.len() as u32;
                index
            }
            _ => return Err(DriverError::InvalidHandle(swapchain)),
        };
        *self.semaphore_mut(signal)? = true;
        self.calls.push(DriverCall::AcquireNextImage {
            swapchain,
            index: Some(index),
        });
        Ok(AcquiredImage {
            index,
            suboptimal: false,
        })
    }

    fn queue_present(
        &mut self,
        queue: GpuHandle,
        present: &PresentDesc,
    ) -> DriverResult<PresentStatus> {
        self.require(queue, ResourceType::Queue)?;
        let image_count = match self.objects.get(&present.swapchain) {
            Some(Object::Swapchain { images, .. }) => images.len() as u32,
            _ => return Err(DriverError::InvalidHandle(present.swapchain)),
        };
        if present.image_index >= image_count {
            return Err(DriverError::Validation(format!(
                "image index {} out of range",
                present.image_index
            )));
        }
        if let Some(wait) = present.wait {
            let signaled = self.semaphore_mut(wait)?;
            if !*signaled {
                return Err(DriverError::Validation(
                    "present waits on an unsignaled semaphore".into(),
                ));
            }
            *signaled = false;
        }
        self.calls.push(DriverCall::QueuePresent(*present));
        let result = if self.out_of_date_presents > 0 {
            self.out_of_date_presents -= 1;
            Err(DriverError::OutOfDate)
        } else if self.suboptimal_presents > 0 {
            self.suboptimal_presents -= 1;
            Ok(PresentStatus::Suboptimal)
        } else {
            Ok(PresentStatus::Optimal)
        };
        self.presents.push(PresentRecord {
            desc: *present,
            result: result.clone(),
        });
        result
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DriverResult<GpuHandle> {
        self.require_device()?;
        if desc.size == 0 {
            return Err(DriverError::Validation("zero-sized buffer".into()));
        }
        self.alloc(
            ResourceType::Buffer,
            Object::Buffer {
                desc: *desc,
                memory: None,
            },
        )
    }

    fn create_image(&mut self, desc: &ImageDesc) -> DriverResult<GpuHandle> {
        self.require_device()?;
        if desc.extent.is_empty() {
            return Err(DriverError::Validation("zero-sized image".into()));
        }
        self.alloc(
            ResourceType::Image,
            Object::Image {
                desc: *desc,
                memory: None,
            },
        )
    }

    fn create_image_view(&mut self, desc: &ImageViewDesc) -> DriverResult<GpuHandle> {
        self.require_image(desc.image)?;
        self.alloc(ResourceType::ImageView, Object::ImageView(*desc))
    }

    fn memory_requirements(&mut self, resource: GpuHandle) -> DriverResult<MemoryRequirements> {
        match self.objects.get(&resource) {
            Some(Object::Buffer { desc, .. }) => Ok(MemoryRequirements {
                size: desc.size.next_multiple_of(256),
                alignment: 256,
                memory_type_bits: 0b11,
            }),
            Some(Object::Image { desc, .. }) => {
                let bytes = u64::from(desc.extent.width) * u64::from(desc.extent.height) * 4;
                Ok(MemoryRequirements {
                    size: bytes.next_multiple_of(4096),
                    alignment: 4096,
                    memory_type_bits: 0b01,
                })
            }
            _ => Err(DriverError::InvalidHandle(resource)),
        }
    }

    fn allocate_memory(
        &mut self,
        requirements: &MemoryRequirements,
        location: MemoryLocation,
    ) -> DriverResult<GpuHandle> {
        self.require_device()?;
        if let Some(budget) = self.memory_budget {
            if self.allocated_bytes + requirements.size > budget {
                return Err(DriverError::OutOfDeviceMemory);
            }
        }
        let contents = match location {
            MemoryLocation::HostVisible => vec![0u8; requirements.size as usize],
            MemoryLocation::DeviceLocal => Vec::new(),
        };
        let memory = self.alloc(
            ResourceType::DeviceMemory,
            Object::Memory {
                size: requirements.size,
                location,
                contents,
            },
        )?;
        self.allocated_bytes += requirements.size;
        Ok(memory)
    }

    fn bind_memory(&mut self, resource: GpuHandle, memory: GpuHandle) -> DriverResult<()> {
        let available = match self.objects.get(&memory) {
            Some(Object::Memory { size, .. }) => *size,
            _ => return Err(DriverError::InvalidHandle(memory)),
        };
        let needed = self.memory_requirements(resource)?.size;
        if needed > available {
            return Err(DriverError::Validation(format!(
                "memory {:?} too small: {} < {}",
                memory, available, needed
            )));
        }
        let slot = match self.objects.get_mut(&resource) {
            Some(Object::Buffer { memory, .. }) | Some(Object::Image { memory, .. }) => memory,
            _ => return Err(DriverError::InvalidHandle(resource)),
        };
        if slot.is_some() {
            return Err(DriverError::Validation(format!(
                "{:?} already has memory bound",
                resource
            )));
        }
        *slot = Some(memory);
        self.calls.push(DriverCall::BindMemory { resource, memory });
        Ok(())
    }

    fn write_memory(&mut self, memory: GpuHandle, offset: u64, data: &[u8]) -> DriverResult<()> {
        match self.objects.get_mut(&memory) {
            Some(Object::Memory {
                location: MemoryLocation::HostVisible,
                contents,
                ..
            }) => {
                let start = offset as usize;
                let end = start + data.len();
                if end > contents.len() {
                    return Err(DriverError::Validation(format!(
                        "write of {} bytes at {} overruns {} byte allocation",
                        data.len(),
                        offset,
                        contents.len()
                    )));
                }
                contents[start..end].copy_from_slice(data);
            }
            Some(Object::Memory { .. }) => {
                return Err(DriverError::Validation(
                    "write to memory that is not host visible".into(),
                ))
            }
            _ => return Err(DriverError::InvalidHandle(memory)),
        }
        self.calls.push(DriverCall::WriteMemory {
            memory,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> DriverResult<GpuHandle> {
        self.require_device()?;
        if let Some(level) = desc.max_anisotropy {
            let anisotropy_enabled = self
                .device_desc()
                .is_some_and(|d| d.features.sampler_anisotropy);
            if !anisotropy_enabled || !(1.0..=16.0).contains(&level) {
                return Err(DriverError::Validation(format!(
                    "anisotropy {} without the samplerAnisotropy feature or out of range",
                    level
                )));
            }
        }
        self.alloc(ResourceType::Sampler, Object::Sampler(*desc))
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DriverResult<GpuHandle> {
        self.require_device()?;
        self.alloc(ResourceType::RenderPass, Object::RenderPass(*desc))
    }

    fn create_framebuffer(&mut self, desc: &FramebufferDesc) -> DriverResult<GpuHandle> {
        self.require(desc.render_pass, ResourceType::RenderPass)?;
        for view in &desc.attachments {
            self.require(*view, ResourceType::ImageView)?;
            if let Some(Object::ImageView(view_desc)) = self.objects.get(view) {
                if !view_desc.swizzle.is_identity() {
                    return Err(DriverError::Validation(format!(
                        "framebuffer attachment {view:?} has a non-identity swizzle"
                    )));
                }
            }
        }
        self.alloc(ResourceType::Framebuffer, Object::Framebuffer)
    }

    fn create_shader_module(&mut self, code: &[u32]) -> DriverResult<GpuHandle> {
        self.require_device()?;
        if code.first() != Some(&0x0723_0203) {
            return Err(DriverError::Validation("shader code is not SPIR-V".into()));
        }
        self.alloc(ResourceType::ShaderModule, Object::ShaderModule)
    }

    fn create_descriptor_set_layout(
        &mut self,
        _bindings: &[DescriptorBinding],
    ) -> DriverResult<GpuHandle> {
        self.require_device()?;
        self.alloc(ResourceType::DescriptorSetLayout, Object::DescriptorSetLayout)
    }

    fn create_pipeline_layout(&mut self, desc: &PipelineLayoutDesc) -> DriverResult<GpuHandle> {
        for layout in &desc.set_layouts {
            self.require(*layout, ResourceType::DescriptorSetLayout)?;
        }
        self.alloc(ResourceType::PipelineLayout, Object::PipelineLayout)
    }

    fn create_graphics_pipeline(
        &mut self,
        desc: &GraphicsPipelineDesc,
    ) -> DriverResult<GpuHandle> {
        self.require(desc.vertex_shader, ResourceType::ShaderModule)?;
        self.require(desc.fragment_shader, ResourceType::ShaderModule)?;
        self.require(desc.layout, ResourceType::PipelineLayout)?;
        self.require(desc.render_pass, ResourceType::RenderPass)?;
        if self.fail_pipelines {
            return Err(DriverError::Vk(vk::Result::ERROR_UNKNOWN));
        }
        self.alloc(ResourceType::Pipeline, Object::Pipeline(desc.clone()))
    }

    fn create_descriptor_pool(&mut self, desc: &DescriptorPoolDesc) -> DriverResult<GpuHandle> {
        self.require_device()?;
        self.alloc(
            ResourceType::DescriptorPool,
            Object::DescriptorPool {
                desc: *desc,
                allocated: 0,
            },
        )
    }

    fn allocate_descriptor_set(
        &mut self,
        pool: GpuHandle,
        layout: GpuHandle,
    ) -> DriverResult<GpuHandle> {
        self.require(layout, ResourceType::DescriptorSetLayout)?;
        match self.objects.get_mut(&pool) {
            Some(Object::DescriptorPool { desc, allocated }) => {
                if *allocated >= desc.max_sets {
                    return Err(DriverError::Vk(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
                }
                *allocated += 1;
            }
            _ => return Err(DriverError::InvalidHandle(pool)),
        }
        self.alloc(ResourceType::DescriptorSet, Object::DescriptorSet { pool })
    }

    fn write_texture_descriptor(
        &mut self,
        set: GpuHandle,
        view: GpuHandle,
        sampler: GpuHandle,
    ) -> DriverResult<()> {
        self.require(set, ResourceType::DescriptorSet)?;
        self.require(view, ResourceType::ImageView)?;
        self.require(sampler, ResourceType::Sampler)?;
        self.calls.push(DriverCall::WriteDescriptor { set });
        Ok(())
    }

    fn create_command_pool(&mut self, _queue_family: u32) -> DriverResult<GpuHandle> {
        self.require_device()?;
        self.alloc(ResourceType::CommandPool, Object::CommandPool)
    }

    fn allocate_command_buffer(&mut self, pool: GpuHandle) -> DriverResult<GpuHandle> {
        self.require(pool, ResourceType::CommandPool)?;
        self.alloc(
            ResourceType::CommandBuffer,
            Object::CommandBuffer {
                pool,
                state: RecordingState::Initial,
                in_render_pass: false,
                pending: None,
                commands: Vec::new(),
            },
        )
    }

    fn create_fence(&mut self, signaled: bool) -> DriverResult<GpuHandle> {
        self.require_device()?;
        self.alloc(
            ResourceType::Fence,
            Object::Fence {
                signaled,
                pending: None,
            },
        )
    }

    fn create_semaphore(&mut self) -> DriverResult<GpuHandle> {
        self.require_device()?;
        self.alloc(ResourceType::Semaphore, Object::Semaphore { signaled: false })
    }

    fn wait_for_fence(&mut self, fence: GpuHandle, timeout_ns: u64) -> DriverResult<()> {
        let (signaled, pending) = match self.objects.get(&fence) {
            Some(Object::Fence { signaled, pending }) => (*signaled, *pending),
            _ => return Err(DriverError::InvalidHandle(fence)),
        };
        self.calls.push(DriverCall::WaitForFence { fence, timeout_ns });
        if signaled {
            return Ok(());
        }
        match pending {
            Some(serial) if timeout_ns > 0 && !self.gpu_stalled => {
                self.complete_through(serial);
                Ok(())
            }
            _ => Err(DriverError::Timeout),
        }
    }

    fn reset_fence(&mut self, fence: GpuHandle) -> DriverResult<()> {
        match self.objects.get_mut(&fence) {
            Some(Object::Fence { signaled, pending }) => {
                if pending.is_some() {
                    return Err(DriverError::Validation(
                        "reset of a fence with pending work".into(),
                    ));
                }
                *signaled = false;
            }
            _ => return Err(DriverError::InvalidHandle(fence)),
        }
        self.calls.push(DriverCall::ResetFence { fence });
        Ok(())
    }

    fn begin_command_buffer(&mut self, command_buffer: GpuHandle) -> DriverResult<()> {
        match self.objects.get_mut(&command_buffer) {
            Some(Object::CommandBuffer {
                state,
                in_render_pass,
                pending,
                commands,
                ..
            }) => {
                if pending.is_some() {
                    return Err(DriverError::Validation(format!(
                        "{:?} is still in use by the GPU",
                        command_buffer
                    )));
                }
                *state = RecordingState::Recording;
                *in_render_pass = false;
                commands.clear();
            }
            _ => return Err(DriverError::InvalidHandle(command_buffer)),
        }
        self.calls
            .push(DriverCall::BeginCommandBuffer { command_buffer });
        Ok(())
    }

    fn record(&mut self, command_buffer: GpuHandle, command: &RecordedCommand) -> DriverResult<()> {
        self.validate_command(command)?;
        match self.objects.get_mut(&command_buffer) {
            Some(Object::CommandBuffer {
                state,
                in_render_pass,
                commands,
                ..
            }) => {
                if *state != RecordingState::Recording {
                    return Err(DriverError::Validation(format!(
                        "{:?} is not recording",
                        command_buffer
                    )));
                }
                match command {
                    RecordedCommand::BeginRenderPass { .. } if *in_render_pass => {
                        return Err(DriverError::Validation("nested render pass".into()))
                    }
                    RecordedCommand::BeginRenderPass { .. } => *in_render_pass = true,
                    RecordedCommand::EndRenderPass if !*in_render_pass => {
                        return Err(DriverError::Validation(
                            "end of a render pass that was never begun".into(),
                        ))
                    }
                    RecordedCommand::EndRenderPass => *in_render_pass = false,
                    c if inside_pass_only(c) && !*in_render_pass => {
                        return Err(DriverError::Validation(format!(
                            "{:?} outside a render pass",
                            c
                        )))
                    }
                    c if outside_pass_only(c) && *in_render_pass => {
                        return Err(DriverError::Validation(format!(
                            "{:?} inside a render pass",
                            c
                        )))
                    }
                    _ => {}
                }
                commands.push(command.clone());
            }
            _ => return Err(DriverError::InvalidHandle(command_buffer)),
        }
        self.calls.push(DriverCall::Record {
            command_buffer,
            command: command.clone(),
        });
        Ok(())
    }

    fn end_command_buffer(&mut self, command_buffer: GpuHandle) -> DriverResult<()> {
        match self.objects.get_mut(&command_buffer) {
            Some(Object::CommandBuffer {
                state,
                in_render_pass,
                ..
            }) => {
                if *state != RecordingState::Recording || *in_render_pass {
                    return Err(DriverError::Validation(format!(
                        "{:?} ended while not recording or inside a render pass",
                        command_buffer
                    )));
                }
                *state = RecordingState::Executable;
            }
            _ => return Err(DriverError::InvalidHandle(command_buffer)),
        }
        self.calls.push(DriverCall::EndCommandBuffer { command_buffer });
        Ok(())
    }

    fn queue_submit(&mut self, queue: GpuHandle, submit: &SubmitDesc) -> DriverResult<()> {
        self.require(queue, ResourceType::Queue)?;
        match self.objects.get(&submit.command_buffer) {
            Some(Object::CommandBuffer {
                state: RecordingState::Executable,
                pending: None,
                ..
            }) => {}
            Some(Object::CommandBuffer { .. }) => {
                return Err(DriverError::Validation(format!(
                    "{:?} is not executable",
                    submit.command_buffer
                )))
            }
            _ => return Err(DriverError::InvalidHandle(submit.command_buffer)),
        }
        if let Some(fence) = submit.fence {
            match self.objects.get(&fence) {
                Some(Object::Fence {
                    signaled: false,
                    pending: None,
                }) => {}
                Some(Object::Fence { .. }) => {
                    return Err(DriverError::Validation(
                        "submit with a signaled or in-use fence".into(),
                    ))
                }
                _ => return Err(DriverError::InvalidHandle(fence)),
            }
        }
        if let Some((wait, _)) = submit.wait {
            let signaled = self.semaphore_mut(wait)?;
            if !*signaled {
                return Err(DriverError::Validation(
                    "submit waits on an unsignaled semaphore".into(),
                ));
            }
            *signaled = false;
        }
        if let Some(signal) = submit.signal {
            *self.semaphore_mut(signal)? = true;
        }

        self.submitted_serial += 1;
        let serial = self.submitted_serial;
        if let Some(fence) = submit.fence {
            if let Some(Object::Fence { pending, .. }) = self.objects.get_mut(&fence) {
                *pending = Some(serial);
            }
        }
        let commands = match self.objects.get_mut(&submit.command_buffer) {
            Some(Object::CommandBuffer {
                pending, commands, ..
            }) => {
                *pending = Some(serial);
                commands.clone()
            }
            _ => Vec::new(),
        };
        self.calls.push(DriverCall::QueueSubmit(*submit));
        self.submissions.push(Submission {
            serial,
            desc: *submit,
            commands,
        });
        Ok(())
    }

    fn device_wait_idle(&mut self) -> DriverResult<()> {
        self.require_device()?;
        self.calls.push(DriverCall::DeviceWaitIdle);
        if self.gpu_stalled {
            return Err(DriverError::DeviceLost);
        }
        self.complete_all();
        Ok(())
    }

    fn destroy(&mut self, handle: GpuHandle) {
        let Some(object) = self.objects.remove(&handle) else {
            return;
        };
        match object {
            Object::Swapchain { images, .. } => {
                for image in images {
                    self.objects.remove(&image);
                }
            }
            Object::Memory { size, .. } => {
                self.allocated_bytes = self.allocated_bytes.saturating_sub(size);
            }
            Object::CommandPool => {
                self.objects.retain(|_, o| {
                    !matches!(o, Object::CommandBuffer { pool, .. } if *pool == handle)
                });
            }
            Object::DescriptorPool { .. } => {
                self.objects.retain(|_, o| {
                    !matches!(o, Object::DescriptorSet { pool } if *pool == handle)
                });
            }
            Object::DescriptorSet { pool } => {
                if let Some(Object::DescriptorPool { allocated, .. }) = self.objects.get_mut(&pool)
                {
                    *allocated = allocated.saturating_sub(1);
                }
            }
            Object::Device(_) => {
                self.device = None;
                self.objects.retain(|h, _| h.resource_type != ResourceType::Queue);
            }
            Object::Instance => {
                self.instance = None;
                self.objects
                    .retain(|h, _| h.resource_type != ResourceType::PhysicalDevice);
            }
            _ => {}
        }
        self.calls.push(DriverCall::Destroy { handle });
        trace!("destroyed {:?}", handle);
    }
}
