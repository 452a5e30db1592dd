/// Opaque handle for an object created through a [`Driver`](crate::Driver).
///
/// Drivers assign these; the bridge never sees the underlying Vulkan handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuHandle {
    /// Unique object identifier within the driver
    pub id: u64,
    /// Type tag for debugging and validation
    pub resource_type: ResourceType,
}

impl GpuHandle {
    /// Create a null/invalid handle.
    pub const fn null() -> Self {
        Self {
            id: 0,
            resource_type: ResourceType::None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.resource_type == ResourceType::None && self.id == 0
    }

    /// `None` for the null handle.
    pub fn non_null(self) -> Option<Self> {
        (!self.is_null()).then_some(self)
    }
}

impl Default for GpuHandle {
    fn default() -> Self {
        Self::null()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    None,
    Instance,
    Surface,
    PhysicalDevice,
    Device,
    Queue,
    Swapchain,
    SwapchainImage,
    Image,
    ImageView,
    Buffer,
    DeviceMemory,
    Sampler,
    ShaderModule,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    PipelineLayout,
    Pipeline,
    RenderPass,
    Framebuffer,
    CommandPool,
    CommandBuffer,
    Fence,
    Semaphore,
}

impl ResourceType {
    /// Objects that are owned by a parent and have no destroy call of their own.
    pub fn is_borrowed(self) -> bool {
        matches!(
            self,
            ResourceType::None
                | ResourceType::PhysicalDevice
                | ResourceType::Queue
                | ResourceType::SwapchainImage
        )
    }
}

/// Driver-side handle allocator. Generates unique handles for one driver.
pub struct HandleAllocator {
    next_id: u64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        // Start from 1 to avoid confusion with NULL/0 handles
        Self { next_id: 1 }
    }

    /// Allocate a new handle with the given resource type.
    pub fn alloc(&mut self, resource_type: ResourceType) -> GpuHandle {
        let id = self.next_id;
        self.next_id += 1;
        GpuHandle { id, resource_type }
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}
