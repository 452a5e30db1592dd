use ash::vk;

use crate::handle::GpuHandle;
use crate::types::{ClearValue, Extent2D, ImageState, Rect2D, Viewport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearAttachment {
    pub aspect: vk::ImageAspectFlags,
    /// Index of the color attachment; ignored for depth/stencil clears
    pub color_attachment: u32,
    pub value: ClearValue,
}

/// One command recorded into a command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRenderPass {
        render_pass: GpuHandle,
        framebuffer: GpuHandle,
        render_area: Rect2D,
        clear_values: Vec<ClearValue>,
    },
    EndRenderPass,
    BindPipeline {
        pipeline: GpuHandle,
    },
    BindVertexBuffer {
        buffer: GpuHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: GpuHandle,
        offset: u64,
        index_type: vk::IndexType,
    },
    BindDescriptorSet {
        layout: GpuHandle,
        set: GpuHandle,
    },
    PushConstants {
        layout: GpuHandle,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    SetViewport(Viewport),
    SetScissor(Rect2D),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    ClearAttachments {
        attachments: Vec<ClearAttachment>,
        rects: Vec<Rect2D>,
    },
    ImageBarrier {
        image: GpuHandle,
        aspect: vk::ImageAspectFlags,
        from: ImageState,
        to: ImageState,
    },
    CopyBufferToImage {
        buffer: GpuHandle,
        buffer_offset: u64,
        image: GpuHandle,
        extent: Extent2D,
        aspect: vk::ImageAspectFlags,
    },
    BlitImage {
        src: GpuHandle,
        src_extent: Extent2D,
        dst: GpuHandle,
        dst_extent: Extent2D,
    },
}

impl RecordedCommand {
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }
        )
    }
}
