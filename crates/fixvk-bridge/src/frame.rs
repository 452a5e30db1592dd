//! Per-frame recording: fence wait, acquire, render pass, lazy binds,
//! submit and present.

use ash::vk;
use tracing::{debug, error, trace, warn};

use fixvk_protocol::commands::{ClearAttachment, RecordedCommand};
use fixvk_protocol::descriptors::{PresentDesc, PresentStatus, RenderPassDesc, SubmitDesc};
use fixvk_protocol::types::{ClearValue, Extent2D, ImageState, Rect2D, Viewport};
use fixvk_protocol::{Driver, DriverError, GpuHandle};

use crate::error::{BridgeError, Result};
use crate::state::ClearValues;
use crate::swap::FrameContext;

/// Serial for objects released while a frame is still being recorded.
///
/// Settled to the frame's real serial once it is submitted.
pub const UNSUBMITTED: u64 = u64::MAX;

/// Mirrors the queue's submission serials on the CPU side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitTracker {
    submitted: u64,
    completed: u64,
}

impl SubmitTracker {
    pub fn submitted(&self) -> u64 {
        self.submitted
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Serial the next submission will get.
    pub fn next_serial(&self) -> u64 {
        self.submitted + 1
    }

    pub(crate) fn record_submit(&mut self) -> u64 {
        self.submitted += 1;
        self.submitted
    }

    /// Everything at or below `serial` is known to have finished.
    pub fn complete_through(&mut self, serial: u64) {
        self.completed = self.completed.max(serial.min(self.submitted));
    }

    pub fn complete_all(&mut self) {
        self.completed = self.submitted;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramePhase {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presented,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_submitted: u64,
    pub frames_presented: u64,
    pub draws_recorded: u64,
    pub draws_skipped: u64,
    pub surface_rebuilds: u64,
}

/// Where a frame renders, resolved before the frame begins.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetPlan {
    pub render_pass: GpuHandle,
    pub desc: RenderPassDesc,
    pub extent: Extent2D,
    /// One per swap image, or a single entry for an offscreen target
    pub framebuffers: Vec<GpuHandle>,
    /// Offscreen color image blitted onto the swap image at submit
    pub offscreen: Option<GpuHandle>,
}

impl TargetPlan {
    fn framebuffer(&self, image_index: u32) -> Option<GpuHandle> {
        if self.offscreen.is_some() {
            return self.framebuffers.first().copied();
        }
        self.framebuffers.get(image_index as usize).copied()
    }

    pub fn has_depth(&self) -> bool {
        self.desc.depth_format.is_some()
    }
}

/// Everything one draw needs bound, as resolved by the façade.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub pipeline: GpuHandle,
    pub layout: GpuHandle,
    /// Pipeline bakes viewport and scissor in
    pub fixed_viewport: bool,
    pub vertex: (GpuHandle, u64),
    pub index: Option<(GpuHandle, u64, vk::IndexType)>,
    pub descriptor_set: Option<GpuHandle>,
    pub transform: [u8; 64],
    pub viewport: Viewport,
    pub scissor: Rect2D,
    pub draw: RecordedCommand,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct BoundState {
    pipeline: Option<GpuHandle>,
    vertex: Option<(GpuHandle, u64)>,
    index: Option<(GpuHandle, u64, vk::IndexType)>,
    descriptor_set: Option<GpuHandle>,
    transform: Option<[u8; 64]>,
    viewport: Option<Viewport>,
    scissor: Option<Rect2D>,
}

#[derive(Debug)]
pub struct FrameRecorder {
    phase: FramePhase,
    frame_index: usize,
    image_index: Option<u32>,
    fence_timeout_ns: u64,
    bound: BoundState,
    target: Option<TargetPlan>,
    stats: FrameStats,
    rebuild_pending: bool,
}

impl FrameRecorder {
    pub fn new(fence_timeout_ns: u64) -> Self {
        Self {
            phase: FramePhase::Idle,
            frame_index: 0,
            image_index: None,
            fence_timeout_ns,
            bound: BoundState::default(),
            target: None,
            stats: FrameStats::default(),
            rebuild_pending: false,
        }
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn image_index(&self) -> Option<u32> {
        self.image_index
    }

    pub fn target(&self) -> Option<&TargetPlan> {
        self.target.as_ref()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn is_recording(&self) -> bool {
        self.phase == FramePhase::Recording
    }

    pub fn rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    pub fn request_rebuild(&mut self) {
        self.rebuild_pending = true;
    }

    pub fn note_skipped_draw(&mut self) {
        self.stats.draws_skipped += 1;
    }

    /// Start over on a fresh set of frame contexts.
    pub fn surface_rebuilt(&mut self) {
        self.rebuild_pending = false;
        self.frame_index = 0;
        self.bound = BoundState::default();
        self.stats.surface_rebuilds += 1;
    }

    /// Serial that objects released right now must wait for.
    pub fn retire_serial(&self, tracker: &SubmitTracker) -> u64 {
        match self.phase {
            FramePhase::Acquiring | FramePhase::Recording => UNSUBMITTED,
            _ => tracker.submitted(),
        }
    }

    fn require_recording(&self) -> Result<()> {
        if self.phase != FramePhase::Recording {
            return Err(BridgeError::InvalidCallOrder("draw outside BeginScene/EndScene"));
        }
        Ok(())
    }

    fn current<'a>(&self, frames: &'a mut [FrameContext]) -> Result<&'a mut FrameContext> {
        frames
            .get_mut(self.frame_index)
            .ok_or(BridgeError::InvalidCallOrder("no frame contexts"))
    }

    /// Drop the open frame. Its semaphore or fence may be left in a state
    /// only fresh contexts recover from, so the surface is rebuilt next time.
    pub fn abort(&mut self) {
        if matches!(self.phase, FramePhase::Acquiring | FramePhase::Recording) {
            warn!(frame = self.frame_index, "aborting frame");
            self.rebuild_pending = true;
        }
        self.phase = FramePhase::Idle;
        self.image_index = None;
        self.target = None;
        self.bound = BoundState::default();
    }

    /// Wait for the context, acquire an image and open the render pass.
    ///
    /// Returns the acquired swap image index.
    pub fn begin<D: Driver>(
        &mut self,
        driver: &mut D,
        frames: &mut [FrameContext],
        swapchain: GpuHandle,
        tracker: &mut SubmitTracker,
        target: TargetPlan,
        clear: &ClearValues,
    ) -> Result<u32> {
        if self.phase != FramePhase::Idle {
            return Err(BridgeError::InvalidCallOrder("frame already open"));
        }
        let timeout_ns = self.fence_timeout_ns;
        let frame = self.current(frames)?;
        let (fence, image_available, command_buffer) =
            (frame.fence, frame.image_available, frame.command_buffer);
        self.phase = FramePhase::Acquiring;

        if let Err(e) = driver.wait_for_fence(fence, timeout_ns) {
            self.phase = FramePhase::Idle;
            error!(frame = self.frame_index, timeout_ns, "frame fence wait failed: {}", e);
            return Err(match e {
                DriverError::Timeout => BridgeError::DeviceLost,
                other => other.into(),
            });
        }
        tracker.complete_through(frame.last_serial);

        let acquired = match driver.acquire_next_image(swapchain, u64::MAX, image_available) {
            Ok(acquired) => acquired,
            Err(DriverError::OutOfDate) => {
                debug!("acquire reported an out-of-date surface");
                self.rebuild_pending = true;
                self.phase = FramePhase::Idle;
                return Err(BridgeError::SurfaceOutOfDate);
            }
            Err(e) => {
                self.phase = FramePhase::Idle;
                return Err(e.into());
            }
        };
        if acquired.suboptimal {
            self.rebuild_pending = true;
        }

        let Some(framebuffer) = target.framebuffer(acquired.index) else {
            self.abort();
            return Err(BridgeError::InvalidCallOrder("no framebuffer for the acquired image"));
        };
        let mut clear_values = vec![ClearValue::Color(clear.color)];
        if target.has_depth() {
            clear_values.push(ClearValue::DepthStencil {
                depth: clear.depth,
                stencil: clear.stencil,
            });
        }
        let opened = driver
            .reset_fence(fence)
            .and_then(|()| {
                frame.ring.reset();
                driver.begin_command_buffer(command_buffer)
            })
            .and_then(|()| {
                driver.record(
                    command_buffer,
                    &RecordedCommand::BeginRenderPass {
                        render_pass: target.render_pass,
                        framebuffer,
                        render_area: Rect2D::from_extent(target.extent),
                        clear_values,
                    },
                )
            });
        if let Err(e) = opened {
            self.abort();
            return Err(e.into());
        }

        trace!(
            frame = self.frame_index,
            image = acquired.index,
            offscreen = target.offscreen.is_some(),
            "frame begun"
        );
        self.image_index = Some(acquired.index);
        self.target = Some(target);
        self.bound = BoundState::default();
        self.phase = FramePhase::Recording;
        Ok(acquired.index)
    }

    /// Copy user-pointer data into this frame's ring.
    pub fn push_immediate<D: Driver>(
        &mut self,
        driver: &mut D,
        frames: &mut [FrameContext],
        data: &[u8],
        align: u64,
    ) -> Result<(GpuHandle, u64)> {
        self.require_recording()?;
        let frame = self.current(frames)?;
        let offset = frame.ring.push(driver, data, align)?;
        Ok((frame.ring.buffer, offset))
    }

    /// Record one draw, re-binding only what changed since the last one.
    pub fn record_draw<D: Driver>(
        &mut self,
        driver: &mut D,
        frames: &mut [FrameContext],
        draw: &DrawRecord,
    ) -> Result<()> {
        self.require_recording()?;
        let command_buffer = self.current(frames)?.command_buffer;
        if let Err(e) = self.record_binds(driver, command_buffer, draw) {
            // Whatever made it into the buffer is unknown now.
            self.bound = BoundState::default();
            return Err(e.into());
        }
        self.stats.draws_recorded += 1;
        Ok(())
    }

    fn record_binds<D: Driver>(
        &mut self,
        driver: &mut D,
        command_buffer: GpuHandle,
        draw: &DrawRecord,
    ) -> std::result::Result<(), DriverError> {
        let bound = &mut self.bound;
        if bound.pipeline != Some(draw.pipeline) {
            driver.record(
                command_buffer,
                &RecordedCommand::BindPipeline {
                    pipeline: draw.pipeline,
                },
            )?;
            bound.pipeline = Some(draw.pipeline);
            if draw.fixed_viewport {
                bound.viewport = None;
                bound.scissor = None;
            }
        }
        if !draw.fixed_viewport {
            if bound.viewport != Some(draw.viewport) {
                driver.record(command_buffer, &RecordedCommand::SetViewport(draw.viewport))?;
                bound.viewport = Some(draw.viewport);
            }
            if bound.scissor != Some(draw.scissor) {
                driver.record(command_buffer, &RecordedCommand::SetScissor(draw.scissor))?;
                bound.scissor = Some(draw.scissor);
            }
        }
        if let Some(set) = draw.descriptor_set {
            if bound.descriptor_set != Some(set) {
                driver.record(
                    command_buffer,
                    &RecordedCommand::BindDescriptorSet {
                        layout: draw.layout,
                        set,
                    },
                )?;
                bound.descriptor_set = Some(set);
            }
        }
        if bound.transform != Some(draw.transform) {
            driver.record(
                command_buffer,
                &RecordedCommand::PushConstants {
                    layout: draw.layout,
                    stages: vk::ShaderStageFlags::VERTEX,
                    offset: 0,
                    data: draw.transform.to_vec(),
                },
            )?;
            bound.transform = Some(draw.transform);
        }
        if bound.vertex != Some(draw.vertex) {
            let (buffer, offset) = draw.vertex;
            driver.record(
                command_buffer,
                &RecordedCommand::BindVertexBuffer { buffer, offset },
            )?;
            bound.vertex = Some(draw.vertex);
        }
        if let Some(index) = draw.index {
            if bound.index != Some(index) {
                let (buffer, offset, index_type) = index;
                driver.record(
                    command_buffer,
                    &RecordedCommand::BindIndexBuffer {
                        buffer,
                        offset,
                        index_type,
                    },
                )?;
                bound.index = Some(index);
            }
        }
        driver.record(command_buffer, &draw.draw)
    }

    pub fn clear_attachments<D: Driver>(
        &mut self,
        driver: &mut D,
        frames: &mut [FrameContext],
        attachments: Vec<ClearAttachment>,
        rects: Vec<Rect2D>,
    ) -> Result<()> {
        self.require_recording()?;
        if attachments.is_empty() || rects.is_empty() {
            return Ok(());
        }
        let command_buffer = self.current(frames)?.command_buffer;
        driver.record(
            command_buffer,
            &RecordedCommand::ClearAttachments { attachments, rects },
        )?;
        Ok(())
    }

    /// Close the pass and the command buffer and submit them.
    ///
    /// Returns the submission serial.
    pub fn submit<D: Driver>(
        &mut self,
        driver: &mut D,
        frames: &mut [FrameContext],
        queue: GpuHandle,
        swap_images: &[GpuHandle],
        swap_extent: Extent2D,
        tracker: &mut SubmitTracker,
    ) -> Result<u64> {
        if self.phase != FramePhase::Recording {
            return Err(BridgeError::NotInScene);
        }
        let (Some(target), Some(image_index)) = (self.target.as_ref(), self.image_index) else {
            return Err(BridgeError::NotInScene);
        };
        let frame = self.current(frames)?;
        let command_buffer = frame.command_buffer;

        let mut commands = vec![RecordedCommand::EndRenderPass];
        if let Some(offscreen) = target.offscreen {
            let Some(&swap_image) = swap_images.get(image_index as usize) else {
                self.abort();
                return Err(BridgeError::InvalidCallOrder("acquired image is gone"));
            };
            let color = vk::ImageAspectFlags::COLOR;
            commands.extend([
                RecordedCommand::ImageBarrier {
                    image: swap_image,
                    aspect: color,
                    from: ImageState::Undefined,
                    to: ImageState::TransferDst,
                },
                RecordedCommand::BlitImage {
                    src: offscreen,
                    src_extent: target.extent,
                    dst: swap_image,
                    dst_extent: swap_extent,
                },
                RecordedCommand::ImageBarrier {
                    image: swap_image,
                    aspect: color,
                    from: ImageState::TransferDst,
                    to: ImageState::Present,
                },
                RecordedCommand::ImageBarrier {
                    image: offscreen,
                    aspect: color,
                    from: ImageState::TransferSrc,
                    to: ImageState::ShaderRead,
                },
            ]);
        }
        let submit = SubmitDesc {
            command_buffer,
            wait: Some((
                frame.image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER,
            )),
            signal: Some(frame.render_finished),
            fence: Some(frame.fence),
        };
        let submitted = commands
            .iter()
            .try_for_each(|command| driver.record(command_buffer, command))
            .and_then(|()| driver.end_command_buffer(command_buffer))
            .and_then(|()| driver.queue_submit(queue, &submit));
        if let Err(e) = submitted {
            self.abort();
            return Err(e.into());
        }
        let serial = tracker.record_submit();
        frame.last_serial = serial;
        self.stats.frames_submitted += 1;
        self.phase = FramePhase::Submitted;
        trace!(frame = self.frame_index, serial, "frame submitted");
        Ok(serial)
    }

    /// Present the submitted frame and move on to the next context.
    pub fn present<D: Driver>(
        &mut self,
        driver: &mut D,
        frames: &[FrameContext],
        queue: GpuHandle,
        swapchain: GpuHandle,
    ) -> Result<()> {
        if self.phase != FramePhase::Submitted {
            return Err(BridgeError::InvalidCallOrder("Present without a submitted frame"));
        }
        let (Some(frame), Some(image_index)) = (frames.get(self.frame_index), self.image_index)
        else {
            return Err(BridgeError::InvalidCallOrder("no frame contexts"));
        };
        let result = driver.queue_present(
            queue,
            &PresentDesc {
                swapchain,
                image_index,
                wait: Some(frame.render_finished),
            },
        );

        self.phase = FramePhase::Presented;
        self.frame_index = (self.frame_index + 1) % frames.len().max(1);
        self.image_index = None;
        self.target = None;
        self.phase = FramePhase::Idle;

        match result {
            Ok(status) => {
                self.stats.frames_presented += 1;
                if status == PresentStatus::Suboptimal {
                    debug!("present reported a suboptimal surface");
                    self.rebuild_pending = true;
                }
                Ok(())
            }
            Err(DriverError::OutOfDate) => {
                debug!("present reported an out-of-date surface");
                self.rebuild_pending = true;
                Err(BridgeError::SurfaceOutOfDate)
            }
            Err(e) => Err(e.into()),
        }
    }
}
