//! Creation descriptors handed to a [`Driver`](crate::Driver).
//!
//! These mirror the Vulkan create-info structs but own their data, so the
//! bridge can build them without lifetimes and drivers can log or store them.

use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::handle::GpuHandle;
use crate::types::{AdapterKind, Extent2D, ImageState, Rect2D, Viewport};

// ── Instance / device ───────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InstanceDesc {
    pub application_name: String,
    pub enable_validation: bool,
    /// Display the instance must be able to present to; `None` for headless probing
    pub display: Option<RawDisplayHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance: GpuHandle,
    /// Whether the validation layer was actually found and enabled
    pub validation_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterFeatures {
    pub sampler_anisotropy: bool,
    pub fill_mode_non_solid: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterInfo {
    pub adapter: GpuHandle,
    pub name: String,
    pub kind: AdapterKind,
    pub api_version: u32,
    /// A queue family supporting graphics and, when a surface was given, present
    pub queue_family: Option<u32>,
    pub features: AdapterFeatures,
    pub max_sampler_anisotropy: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDesc {
    pub adapter: GpuHandle,
    pub queue_family: u32,
    pub enable_validation: bool,
    pub features: AdapterFeatures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device: GpuHandle,
    pub queue: GpuHandle,
}

// ── Surface / swapchain ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceFormat {
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// Zero means no upper bound
    pub max_image_count: u32,
    /// `None` when the window lets the swapchain pick its size
    pub current_extent: Option<Extent2D>,
    pub min_image_extent: Extent2D,
    pub max_image_extent: Extent2D,
    pub formats: Vec<SurfaceFormat>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub surface: GpuHandle,
    pub format: SurfaceFormat,
    pub extent: Extent2D,
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    /// Null when there is no swapchain to retire
    pub old_swapchain: GpuHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub swapchain: GpuHandle,
    pub images: Vec<GpuHandle>,
}

// ── Resources ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Swizzle {
    pub r: vk::ComponentSwizzle,
    pub g: vk::ComponentSwizzle,
    pub b: vk::ComponentSwizzle,
    pub a: vk::ComponentSwizzle,
}

impl Swizzle {
    pub const IDENTITY: Swizzle = Swizzle {
        r: vk::ComponentSwizzle::IDENTITY,
        g: vk::ComponentSwizzle::IDENTITY,
        b: vk::ComponentSwizzle::IDENTITY,
        a: vk::ComponentSwizzle::IDENTITY,
    };

    /// Every component maps to itself, as framebuffer attachment views require.
    pub fn is_identity(&self) -> bool {
        use vk::ComponentSwizzle as C;
        matches!(self.r, C::IDENTITY | C::R)
            && matches!(self.g, C::IDENTITY | C::G)
            && matches!(self.b, C::IDENTITY | C::B)
            && matches!(self.a, C::IDENTITY | C::A)
    }
}

impl Default for Swizzle {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageViewDesc {
    pub image: GpuHandle,
    pub format: vk::Format,
    pub aspect: vk::ImageAspectFlags,
    pub swizzle: Swizzle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    /// `None` disables anisotropic filtering
    pub max_anisotropy: Option<f32>,
    pub mip_lod_bias: f32,
}

// ── Render passes / framebuffers ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassDesc {
    pub color_format: vk::Format,
    /// Layout the color attachment is left in: `Present` or `TransferSrc`
    pub color_final: ImageState,
    pub depth_format: Option<vk::Format>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub render_pass: GpuHandle,
    pub attachments: Vec<GpuHandle>,
    pub extent: Extent2D,
}

// ── Descriptors / pipelines ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolDesc {
    pub max_sets: u32,
    pub sampled_images: u32,
    pub samplers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLayoutDesc {
    pub set_layouts: Vec<GpuHandle>,
    pub push_constant_size: u32,
    pub push_constant_stages: vk::ShaderStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendState {
    pub enabled: bool,
    pub src_color: vk::BlendFactor,
    pub dst_color: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha: vk::BlendFactor,
    pub dst_alpha: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
}

impl BlendState {
    pub const OPAQUE: BlendState = BlendState {
        enabled: false,
        src_color: vk::BlendFactor::ONE,
        dst_color: vk::BlendFactor::ZERO,
        color_op: vk::BlendOp::ADD,
        src_alpha: vk::BlendFactor::ONE,
        dst_alpha: vk::BlendFactor::ZERO,
        alpha_op: vk::BlendOp::ADD,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: vk::CompareOp,
}

impl DepthState {
    pub const DISABLED: DepthState = DepthState {
        test: false,
        write: false,
        compare: vk::CompareOp::ALWAYS,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ViewportState {
    /// Viewport and scissor are set per draw with dynamic state
    Dynamic,
    /// Viewport and scissor are baked into the pipeline
    Fixed { viewport: Viewport, scissor: Rect2D },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDesc {
    pub vertex_shader: GpuHandle,
    pub fragment_shader: GpuHandle,
    pub layout: GpuHandle,
    pub render_pass: GpuHandle,
    pub vertex_stride: u32,
    pub attributes: Vec<VertexAttribute>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub blend: BlendState,
    pub depth: DepthState,
    pub viewport: ViewportState,
}

// ── Submission ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitDesc {
    pub command_buffer: GpuHandle,
    /// Semaphore to wait on and the stage that waits
    pub wait: Option<(GpuHandle, vk::PipelineStageFlags)>,
    pub signal: Option<GpuHandle>,
    pub fence: Option<GpuHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentDesc {
    pub swapchain: GpuHandle,
    pub image_index: u32,
    pub wait: Option<GpuHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    Suboptimal,
}
