//! The legacy device façade.
//!
//! [`Bridge`] owns one session: device, swap surface, resources, pipelines
//! and the frame recorder. Every legacy call maps onto one method here and
//! is assumed to arrive from a single render thread; wrap the bridge in
//! [`crate::SharedBridge`] when several callers need it.
//!
//! Scene flow:
//!
//! ```text
//! BeginScene ─► wait fence ─► acquire ─► begin pass
//!   Set*/Draw*/Clear  (recorded into the open pass)
//! EndScene   ─► end pass ─► [blit offscreen] ─► submit
//! Present    ─► present ─► next frame context
//! ```
//!
//! Once the device is lost every call except [`Bridge::shutdown`] fails with
//! [`BridgeError::DeviceLost`].

use ash::vk;
use tracing::{debug, error, info, warn};

use fixvk_core::FixvkConfig;
use fixvk_protocol::commands::{ClearAttachment, RecordedCommand};
use fixvk_protocol::descriptors::RenderPassDesc;
use fixvk_protocol::types::{ClearValue, Extent2D, ImageState, Rect2D};
use fixvk_protocol::{Driver, GpuHandle, WindowTarget};

use crate::error::{BridgeError, ErrorClass, Result};
use crate::format::index_size;
use crate::frame::{DrawRecord, FramePhase, FrameRecorder, FrameStats, SubmitTracker, TargetPlan};
use crate::legacy::{
    ClearFlags, D3dColor, D3dRect, Fvf, IndexData, LegacyFormat, LegacyViewport, Matrix4,
    PrimitiveType, RenderState, TransformKind, Usage,
};
use crate::pipeline::{effective_viewport, KeyOptions, PipelineCache, PipelineKey, PipelineStats, ViewportKey};
use crate::session::{DeviceSession, SessionState};
use crate::state::{IndexBinding, StateVector, VertexStream};
use crate::swap::{create_frames, destroy_frames, SwapChain, SwapSurface};
use crate::translator::{BufferId, BufferRole, ImageId, ImageResource, ResourceTranslator};

/// Alignment of vertex data pushed into the immediate ring.
const IMMEDIATE_VERTEX_ALIGN: u64 = 16;
const IMMEDIATE_INDEX_ALIGN: u64 = 4;

fn fence_timeout_ns(config: &FixvkConfig) -> u64 {
    config.frame.fence_timeout_ms.saturating_mul(1_000_000)
}

fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT
    )
}

fn check_covers(depth: &ImageResource, extent: Extent2D) -> Result<()> {
    if depth.extent.width < extent.width || depth.extent.height < extent.height {
        return Err(BridgeError::InvalidArgument(format!(
            "depth buffer {}x{} is smaller than the {}x{} color target",
            depth.extent.width, depth.extent.height, extent.width, extent.height
        )));
    }
    Ok(())
}

/// Resolve the render pass and framebuffers the next frame draws into.
fn plan_target<D: Driver>(
    driver: &mut D,
    surface: &mut SwapSurface,
    translator: &ResourceTranslator,
    state: &StateVector,
) -> Result<TargetPlan> {
    let SwapSurface {
        chain,
        render_passes,
        framebuffers,
        ..
    } = surface;
    let chain = chain
        .as_ref()
        .ok_or(BridgeError::InvalidCallOrder("no swap surface"))?;
    let depth = state
        .depth_stencil
        .map(|id| translator.image(id))
        .transpose()?;

    let Some(color_id) = state.render_target else {
        let Some(depth) = depth else {
            let desc = chain.render_pass_desc();
            return Ok(TargetPlan {
                render_pass: render_passes.get_or_create(driver, desc)?,
                desc,
                extent: chain.extent,
                framebuffers: chain.framebuffers.clone(),
                offscreen: None,
            });
        };
        check_covers(depth, chain.extent)?;
        let desc = RenderPassDesc {
            color_format: chain.format.format,
            color_final: ImageState::Present,
            depth_format: Some(depth.format.format),
        };
        let render_pass = render_passes.get_or_create(driver, desc)?;
        let mut targets = Vec::with_capacity(chain.views.len());
        for view in &chain.views {
            targets.push(framebuffers.get_or_create(
                driver,
                render_pass,
                &[*view, depth.attachment()],
                chain.extent,
            )?);
        }
        return Ok(TargetPlan {
            render_pass,
            desc,
            extent: chain.extent,
            framebuffers: targets,
            offscreen: None,
        });
    };

    let color = translator.image(color_id)?;
    if let Some(depth) = depth {
        check_covers(depth, color.extent)?;
    }
    let desc = RenderPassDesc {
        color_format: color.format.format,
        color_final: ImageState::TransferSrc,
        depth_format: depth.map(|d| d.format.format),
    };
    let render_pass = render_passes.get_or_create(driver, desc)?;
    let mut attachments = vec![color.attachment()];
    attachments.extend(depth.map(|d| d.attachment()));
    let framebuffer = framebuffers.get_or_create(driver, render_pass, &attachments, color.extent)?;
    Ok(TargetPlan {
        render_pass,
        desc,
        extent: color.extent,
        framebuffers: vec![framebuffer],
        offscreen: Some(color.handle),
    })
}

pub struct Bridge<D: Driver> {
    driver: D,
    config: FixvkConfig,
    state: SessionState,
    lost: bool,
    session: DeviceSession,
    surface: SwapSurface,
    translator: ResourceTranslator,
    pipelines: PipelineCache,
    recorder: FrameRecorder,
    tracker: SubmitTracker,
    state_vector: StateVector,
    /// Size last asked for by Initialize or Resize
    requested: Extent2D,
}

impl<D: Driver> Bridge<D> {
    pub fn new(driver: D, config: FixvkConfig) -> Self {
        let recorder = FrameRecorder::new(fence_timeout_ns(&config));
        Self {
            driver,
            config,
            state: SessionState::Uninitialized,
            lost: false,
            session: DeviceSession::default(),
            surface: SwapSurface::new(),
            translator: ResourceTranslator::new(),
            pipelines: PipelineCache::new(),
            recorder,
            tracker: SubmitTracker::default(),
            state_vector: StateVector::default(),
            requested: Extent2D::default(),
        }
    }

    // ── Accessors ───────────────────────────────────────────

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn config(&self) -> &FixvkConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn phase(&self) -> FramePhase {
        self.recorder.phase()
    }

    pub fn stats(&self) -> FrameStats {
        self.recorder.stats()
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipelines.stats()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    pub fn tracker(&self) -> SubmitTracker {
        self.tracker
    }

    pub fn swap_extent(&self) -> Option<Extent2D> {
        self.surface.chain.as_ref().map(|c| c.extent)
    }

    pub fn swapchain_handle(&self) -> Option<GpuHandle> {
        self.surface.chain.as_ref().map(|c| c.handle)
    }

    /// Number of successful swap surface rebuilds this session.
    pub fn swap_generation(&self) -> u64 {
        self.surface.generation
    }

    /// Swap image acquired for the open frame.
    pub fn image_index(&self) -> Option<u32> {
        self.recorder.image_index()
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    pub fn retired_count(&self) -> usize {
        self.translator.retired_count()
    }

    // ── Guards ──────────────────────────────────────────────

    fn guard(&self) -> Result<()> {
        if self.lost {
            return Err(BridgeError::DeviceLost);
        }
        Ok(())
    }

    fn require_ready(&self) -> Result<()> {
        self.guard()?;
        if self.state != SessionState::Ready {
            return Err(BridgeError::InvalidCallOrder("bridge is not initialized"));
        }
        Ok(())
    }

    /// Latch device loss so every later call reports it.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(BridgeError::DeviceLost) = &result {
            if !self.lost {
                error!("device lost; the session must be shut down and initialized again");
            }
            self.lost = true;
            self.recorder.abort();
        }
        result
    }

    /// Like [`Self::track`], counting a failure as a skipped draw.
    fn track_skip<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!("draw skipped: {}", e);
            self.recorder.note_skipped_draw();
        }
        self.track(result)
    }

    fn key_options(&self) -> KeyOptions {
        KeyOptions {
            dynamic_viewport: self.config.performance.dynamic_viewport,
            fill_mode_non_solid: self.session.features.fill_mode_non_solid,
        }
    }

    // ── Session lifecycle ───────────────────────────────────

    /// Bring the whole session up for `window`.
    ///
    /// On failure nothing is left alive and the bridge stays uninitialized.
    pub fn initialize(&mut self, window: &WindowTarget, width: u32, height: u32) -> Result<()> {
        self.guard()?;
        if self.state != SessionState::Uninitialized {
            return Err(BridgeError::InvalidCallOrder("Initialize on a live session"));
        }
        if width == 0 || height == 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "back buffer size must be non-zero, got {width}x{height}"
            )));
        }
        self.config
            .validate()
            .map_err(|e| BridgeError::InitializationFailure(e.to_string()))?;

        self.state = SessionState::Initializing;
        self.requested = Extent2D::new(width, height);
        self.recorder = FrameRecorder::new(fence_timeout_ns(&self.config));
        match self.bring_up(window) {
            Ok(()) => {
                self.state = SessionState::Ready;
                info!(
                    width,
                    height,
                    frames_in_flight = self.surface.frames.len(),
                    pipelines = self.pipelines.len(),
                    "bridge initialized"
                );
                Ok(())
            }
            Err(e) => {
                error!("initialize failed: {}", e);
                self.teardown();
                self.state = SessionState::Uninitialized;
                Err(match e {
                    e if e.class() == ErrorClass::InitializationFailure => e,
                    other => BridgeError::InitializationFailure(other.to_string()),
                })
            }
        }
    }

    fn bring_up(&mut self, window: &WindowTarget) -> Result<()> {
        self.session = DeviceSession::create(&mut self.driver, window, &self.config)?;

        let chain = SwapChain::build(
            &mut self.driver,
            &self.session,
            &self.config,
            self.requested,
            GpuHandle::null(),
        )?;
        let desc = chain.render_pass_desc();
        let extent = chain.extent;
        let chain = self.surface.chain.insert(chain);
        let render_pass = self
            .surface
            .render_passes
            .get_or_create(&mut self.driver, desc)?;
        chain.create_framebuffers(&mut self.driver, render_pass)?;

        self.translator.init_shared(
            &mut self.driver,
            &self.config,
            self.session.anisotropy_limit(),
        )?;
        self.pipelines
            .init(&mut self.driver, self.translator.set_layout())?;
        self.pipelines.prepare_shaders(&mut self.driver)?;
        self.warm_up(render_pass, desc, extent);

        self.session.create_command_pool(&mut self.driver)?;
        self.surface.frames = create_frames(
            &mut self.driver,
            self.session.command_pool,
            self.config.frame.frames_in_flight as usize,
            self.config.frame.immediate_buffer_size,
        )?;
        self.translator
            .init_upload(&mut self.driver, self.session.command_pool, self.session.queue)?;
        Ok(())
    }

    /// Build the pipeline for the default state so the first draw is a hit.
    fn warm_up(&mut self, render_pass: GpuHandle, desc: RenderPassDesc, extent: Extent2D) {
        let state = StateVector::default();
        let key = PipelineKey::derive(
            &state,
            PrimitiveType::TriangleList,
            state.stream_stride(),
            false,
            desc,
            extent,
            self.key_options(),
        );
        if let Err(e) = self.pipelines.resolve(&mut self.driver, &key, render_pass) {
            warn!("default pipeline could not be built up front: {}", e);
        }
    }

    /// Destroy everything in reverse dependency order.
    fn teardown(&mut self) {
        let driver = &mut self.driver;
        self.recorder.abort();
        destroy_frames(driver, std::mem::take(&mut self.surface.frames));
        self.pipelines.destroy(driver);
        self.translator.destroy(driver);
        self.session.destroy_command_pool(driver);
        self.surface.destroy(driver);
        self.session.destroy(driver);
    }

    /// Idle the device and release every object. Safe to call at any time.
    pub fn shutdown(&mut self) {
        if self.state == SessionState::Uninitialized {
            return;
        }
        self.state = SessionState::ShuttingDown;
        if self.session.is_created() {
            if let Err(e) = self.driver.device_wait_idle() {
                warn!("device did not idle before shutdown: {}", e);
            }
        }
        self.tracker.complete_all();
        let stats = self.recorder.stats();
        self.teardown();
        self.state_vector = StateVector::default();
        self.recorder = FrameRecorder::new(fence_timeout_ns(&self.config));
        self.lost = false;
        self.state = SessionState::Uninitialized;
        info!(
            frames = stats.frames_presented,
            draws = stats.draws_recorded,
            rebuilds = stats.surface_rebuilds,
            "bridge shut down"
        );
    }

    // ── Swap surface ────────────────────────────────────────

    /// Rebuild the swap surface for a new window size.
    ///
    /// The current size with no pending rebuild is a no-op.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.guard()?;
        if width == 0 || height == 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "resize to {width}x{height}"
            )));
        }
        self.require_ready()?;
        if self.recorder.phase() != FramePhase::Idle {
            return Err(BridgeError::InvalidCallOrder("Resize inside a frame"));
        }
        let requested = Extent2D::new(width, height);
        if requested == self.requested && !self.recorder.rebuild_pending() {
            debug!(width, height, "resize to the current size ignored");
            return Ok(());
        }
        self.requested = requested;
        let result = self.rebuild();
        self.track(result)
    }

    fn rebuild(&mut self) -> Result<()> {
        self.state = SessionState::Resizing;
        let result = self.rebuild_surface();
        self.state = SessionState::Ready;
        if let Err(e) = &result {
            warn!("swap surface rebuild failed, keeping the old one: {}", e);
            self.recorder.request_rebuild();
        }
        result
    }

    /// Build a complete new surface, then swap it in and drop the old one.
    fn rebuild_surface(&mut self) -> Result<()> {
        let Self {
            driver,
            config,
            session,
            surface,
            pipelines,
            recorder,
            tracker,
            translator,
            requested,
            ..
        } = self;
        driver.device_wait_idle()?;
        tracker.complete_all();
        translator.collect(driver, tracker.completed());

        let (old_handle, old_format, old_extent) = {
            let old = surface.chain()?;
            (old.handle, old.format, old.extent)
        };
        let mut chain = SwapChain::build(driver, session, config, *requested, old_handle)?;
        let built = surface
            .render_passes
            .get_or_create(driver, chain.render_pass_desc())
            .and_then(|pass| chain.create_framebuffers(driver, pass))
            .and_then(|()| {
                create_frames(
                    driver,
                    session.command_pool,
                    config.frame.frames_in_flight as usize,
                    config.frame.immediate_buffer_size,
                )
            });
        let frames = match built {
            Ok(frames) => frames,
            Err(e) => {
                // The old chain may already be retired by the new one.
                chain.destroy(driver);
                recorder.request_rebuild();
                return Err(e);
            }
        };
        let (new_format, new_extent) = (chain.format, chain.extent);

        destroy_frames(driver, std::mem::replace(&mut surface.frames, frames));
        if let Some(old) = surface.chain.replace(chain) {
            let mut stale = old.views.clone();
            stale.extend(old.depth.map(|d| d.view));
            for framebuffer in surface.framebuffers.take_referencing(&stale) {
                driver.destroy(framebuffer);
            }
            old.destroy(driver);
        }

        let mut purged = 0;
        if new_format.format != old_format.format {
            let outdated = |desc: &RenderPassDesc| {
                desc.color_final == ImageState::Present && desc.color_format == old_format.format
            };
            purged += pipelines.purge_target(driver, &outdated);
            let passes = surface.render_passes.take_matching(&outdated);
            for framebuffer in surface.framebuffers.take_referencing(&passes) {
                driver.destroy(framebuffer);
            }
            for pass in passes {
                driver.destroy(pass);
            }
        }
        if new_extent != old_extent {
            purged += pipelines.invalidate_fixed_viewport(driver);
        }

        surface.generation += 1;
        recorder.surface_rebuilt();
        info!(
            width = new_extent.width,
            height = new_extent.height,
            generation = surface.generation,
            purged_pipelines = purged,
            "swap surface rebuilt"
        );
        Ok(())
    }

    // ── Scene ───────────────────────────────────────────────

    pub fn begin_scene(&mut self) -> Result<()> {
        self.require_ready()?;
        match self.recorder.phase() {
            FramePhase::Idle => {}
            FramePhase::Acquiring | FramePhase::Recording => return Err(BridgeError::AlreadyInScene),
            FramePhase::Submitted | FramePhase::Presented => {
                return Err(BridgeError::InvalidCallOrder("BeginScene before Present"))
            }
        }
        if self.recorder.rebuild_pending() {
            let result = self.rebuild();
            self.track(result)?;
        }
        let plan = plan_target(
            &mut self.driver,
            &mut self.surface,
            &self.translator,
            &self.state_vector,
        );
        let plan = self.track(plan)?;
        let swapchain = self.surface.chain()?.handle;
        let result = self.recorder.begin(
            &mut self.driver,
            &mut self.surface.frames,
            swapchain,
            &mut self.tracker,
            plan,
            &self.state_vector.clear,
        );
        self.track(result)?;
        self.translator
            .collect(&mut self.driver, self.tracker.completed());
        Ok(())
    }

    pub fn end_scene(&mut self) -> Result<()> {
        self.guard()?;
        if self.recorder.phase() != FramePhase::Recording {
            return Err(BridgeError::NotInScene);
        }
        let chain = self
            .surface
            .chain
            .as_ref()
            .ok_or(BridgeError::InvalidCallOrder("no swap surface"))?;
        let result = self.recorder.submit(
            &mut self.driver,
            &mut self.surface.frames,
            self.session.queue,
            &chain.images,
            chain.extent,
            &mut self.tracker,
        );
        let serial = match &result {
            Ok(serial) => *serial,
            Err(_) => self.tracker.submitted(),
        };
        self.translator.settle_unsubmitted(serial);
        self.track(result).map(|_| ())
    }

    pub fn present(&mut self) -> Result<()> {
        self.require_ready()?;
        let swapchain = self.surface.chain()?.handle;
        let result = self.recorder.present(
            &mut self.driver,
            &self.surface.frames,
            self.session.queue,
            swapchain,
        );
        self.track(result)
    }

    // ── Draws ───────────────────────────────────────────────

    fn require_scene(&self) -> Result<()> {
        self.guard()?;
        if !self.recorder.is_recording() {
            return Err(BridgeError::InvalidCallOrder("draw outside BeginScene/EndScene"));
        }
        Ok(())
    }

    /// Resolve state into a pipeline and record the draw.
    ///
    /// Pipeline and descriptor failures skip this draw only.
    fn submit_draw(
        &mut self,
        primitive: PrimitiveType,
        stride: u32,
        vertex: (GpuHandle, u64),
        index: Option<(GpuHandle, u64, vk::IndexType)>,
        draw: RecordedCommand,
    ) -> Result<()> {
        let target = self
            .recorder
            .target()
            .ok_or(BridgeError::InvalidCallOrder("draw outside BeginScene/EndScene"))?;
        let (render_pass, desc, extent) = (target.render_pass, target.desc, target.extent);
        let texture = self.state_vector.texture;
        let key = PipelineKey::derive(
            &self.state_vector,
            primitive,
            stride,
            texture.is_some(),
            desc,
            extent,
            self.key_options(),
        );
        let resolved = self.pipelines.resolve(&mut self.driver, &key, render_pass);
        let pipeline = match self.track(resolved) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.recorder.note_skipped_draw();
                return Err(e);
            }
        };
        let descriptor_set = match texture.filter(|_| key.shaders.textured) {
            Some(id) => {
                let set = self.translator.descriptor_set(&mut self.driver, id);
                match self.track(set) {
                    Ok(set) => Some(set),
                    Err(e) => {
                        warn!("texture descriptor unavailable, draw skipped: {}", e);
                        self.recorder.note_skipped_draw();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let (viewport, scissor) = effective_viewport(&self.state_vector, extent);
        let record = DrawRecord {
            pipeline,
            layout: self.pipelines.layout(),
            fixed_viewport: matches!(key.viewport, ViewportKey::Fixed { .. }),
            vertex,
            index,
            descriptor_set,
            transform: bytemuck::cast(self.state_vector.wvp()),
            viewport,
            scissor,
            draw,
        };
        let result = self
            .recorder
            .record_draw(&mut self.driver, &mut self.surface.frames, &record);
        self.track(result)
    }

    fn bound_stream(&self, call: &'static str) -> Result<(VertexStream, GpuHandle, u64)> {
        let stream = self
            .state_vector
            .stream
            .ok_or(BridgeError::InvalidCallOrder(call))?;
        let buffer = self.translator.buffer(stream.buffer)?;
        Ok((stream, buffer.handle, buffer.size))
    }

    /// `DrawPrimitive`: non-indexed draw from stream 0.
    pub fn draw_primitive(
        &mut self,
        primitive: PrimitiveType,
        start_vertex: u32,
        primitive_count: u32,
    ) -> Result<()> {
        self.require_scene()?;
        let vertex_count = primitive.vertex_count(primitive_count);
        if vertex_count == 0 {
            return Ok(());
        }
        let (_, buffer, size) = self.bound_stream("DrawPrimitive without a vertex buffer")?;
        let stride = self.state_vector.stream_stride();
        let end = (u64::from(start_vertex) + u64::from(vertex_count)) * u64::from(stride);
        if end > size {
            return Err(BridgeError::InvalidArgument(format!(
                "{vertex_count} vertices from {start_vertex} overrun a {size} byte buffer"
            )));
        }
        self.submit_draw(
            primitive,
            stride,
            (buffer, 0),
            None,
            RecordedCommand::Draw {
                vertex_count,
                instance_count: 1,
                first_vertex: start_vertex,
                first_instance: 0,
            },
        )
    }

    /// `DrawIndexedPrimitive`: indices from the bound index buffer, offset by its base vertex.
    pub fn draw_indexed_primitive(
        &mut self,
        primitive: PrimitiveType,
        min_index: u32,
        num_vertices: u32,
        start_index: u32,
        primitive_count: u32,
    ) -> Result<()> {
        self.require_scene()?;
        let index_count = primitive.vertex_count(primitive_count);
        if index_count == 0 {
            return Ok(());
        }
        let (_, vertex_buffer, vertex_size) =
            self.bound_stream("DrawIndexedPrimitive without a vertex buffer")?;
        let binding: IndexBinding = self.state_vector.indices.ok_or(
            BridgeError::InvalidCallOrder("DrawIndexedPrimitive without an index buffer"),
        )?;
        let indices = self.translator.buffer(binding.buffer)?;
        let index_type = indices.index_type.ok_or_else(|| {
            BridgeError::InvalidArgument("bound index buffer has no index format".into())
        })?;
        let index_end = (u64::from(start_index) + u64::from(index_count)) * index_size(index_type);
        if index_end > indices.size {
            return Err(BridgeError::InvalidArgument(format!(
                "{index_count} indices from {start_index} overrun a {} byte index buffer",
                indices.size
            )));
        }
        let stride = self.state_vector.stream_stride();
        let last_vertex =
            i64::from(binding.base_vertex) + i64::from(min_index) + i64::from(num_vertices);
        if last_vertex * i64::from(stride) > vertex_size as i64 {
            return Err(BridgeError::InvalidArgument(format!(
                "vertex range up to {last_vertex} overruns a {vertex_size} byte buffer"
            )));
        }
        let index_buffer = indices.handle;
        self.submit_draw(
            primitive,
            stride,
            (vertex_buffer, 0),
            Some((index_buffer, 0, index_type)),
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count: 1,
                first_index: start_index,
                vertex_offset: binding.base_vertex,
                first_instance: 0,
            },
        )
    }

    /// `DrawPrimitiveUP`: vertices from host memory. Stream 0 is unset afterwards.
    pub fn draw_primitive_up(
        &mut self,
        primitive: PrimitiveType,
        primitive_count: u32,
        vertices: &[u8],
        stride: u32,
    ) -> Result<()> {
        self.require_scene()?;
        let result = self.draw_up(primitive, primitive_count, vertices, stride);
        self.state_vector.stream = None;
        result
    }

    fn draw_up(
        &mut self,
        primitive: PrimitiveType,
        primitive_count: u32,
        vertices: &[u8],
        stride: u32,
    ) -> Result<()> {
        let vertex_count = primitive.vertex_count(primitive_count);
        if vertex_count == 0 {
            return Ok(());
        }
        if stride == 0 {
            return Err(BridgeError::InvalidArgument("vertex stride must be non-zero".into()));
        }
        let needed = vertex_count as usize * stride as usize;
        let data = vertices.get(..needed).ok_or_else(|| {
            BridgeError::InvalidArgument(format!(
                "{vertex_count} vertices need {needed} bytes, got {}",
                vertices.len()
            ))
        })?;
        let pushed = self.recorder.push_immediate(
            &mut self.driver,
            &mut self.surface.frames,
            data,
            IMMEDIATE_VERTEX_ALIGN,
        );
        let vertex = self.track_skip(pushed)?;
        self.submit_draw(
            primitive,
            stride,
            vertex,
            None,
            RecordedCommand::Draw {
                vertex_count,
                instance_count: 1,
                first_vertex: 0,
                first_instance: 0,
            },
        )
    }

    /// `DrawIndexedPrimitiveUP`: vertices and indices from host memory.
    ///
    /// Only `[min_vertex, min_vertex + num_vertices)` is copied. Stream 0 and
    /// the index buffer are unset afterwards.
    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed_primitive_up(
        &mut self,
        primitive: PrimitiveType,
        min_vertex: u32,
        num_vertices: u32,
        primitive_count: u32,
        indices: IndexData<'_>,
        vertices: &[u8],
        stride: u32,
    ) -> Result<()> {
        self.require_scene()?;
        let result = self.draw_indexed_up(
            primitive,
            min_vertex,
            num_vertices,
            primitive_count,
            indices,
            vertices,
            stride,
        );
        self.state_vector.stream = None;
        self.state_vector.indices = None;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_indexed_up(
        &mut self,
        primitive: PrimitiveType,
        min_vertex: u32,
        num_vertices: u32,
        primitive_count: u32,
        indices: IndexData<'_>,
        vertices: &[u8],
        stride: u32,
    ) -> Result<()> {
        let index_count = primitive.vertex_count(primitive_count);
        if index_count == 0 || num_vertices == 0 {
            return Ok(());
        }
        if stride == 0 {
            return Err(BridgeError::InvalidArgument("vertex stride must be non-zero".into()));
        }
        let indices = indices.truncated(index_count as usize).ok_or_else(|| {
            BridgeError::InvalidArgument(format!(
                "{index_count} indices needed, got {}",
                indices.len()
            ))
        })?;
        let start = min_vertex as usize * stride as usize;
        let end = start + num_vertices as usize * stride as usize;
        let data = vertices.get(start..end).ok_or_else(|| {
            BridgeError::InvalidArgument(format!(
                "vertex range {start}..{end} outside {} bytes of vertex data",
                vertices.len()
            ))
        })?;

        let pushed = self
            .recorder
            .push_immediate(&mut self.driver, &mut self.surface.frames, data, IMMEDIATE_VERTEX_ALIGN)
            .and_then(|vertex| {
                self.recorder
                    .push_immediate(
                        &mut self.driver,
                        &mut self.surface.frames,
                        indices.as_bytes(),
                        IMMEDIATE_INDEX_ALIGN,
                    )
                    .map(|(buffer, offset)| (vertex, (buffer, offset, indices.index_type())))
            });
        let (vertex, index) = self.track_skip(pushed)?;
        self.submit_draw(
            primitive,
            stride,
            vertex,
            Some(index),
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count: 1,
                first_index: 0,
                // The copy starts at min_vertex.
                vertex_offset: -(min_vertex as i32),
                first_instance: 0,
            },
        )
    }

    // ── Clear ───────────────────────────────────────────────

    /// `Clear`. Inside a scene this clears `rects` (or the viewport) now;
    /// outside one it sets what the next scene starts with.
    pub fn clear(
        &mut self,
        rects: &[D3dRect],
        flags: ClearFlags,
        color: D3dColor,
        z: f32,
        stencil: u32,
    ) -> Result<()> {
        self.guard()?;
        if !(0.0..=1.0).contains(&z) {
            return Err(BridgeError::InvalidArgument(format!("clear depth {z} outside 0..1")));
        }
        if !self.recorder.is_recording() {
            let clear = &mut self.state_vector.clear;
            if flags.contains(ClearFlags::TARGET) {
                clear.color = color.to_rgba();
            }
            if flags.contains(ClearFlags::ZBUFFER) {
                clear.depth = z;
            }
            if flags.contains(ClearFlags::STENCIL) {
                clear.stencil = stencil;
            }
            return Ok(());
        }

        let target = self
            .recorder
            .target()
            .ok_or(BridgeError::InvalidCallOrder("clear outside BeginScene/EndScene"))?;
        let mut attachments = Vec::with_capacity(2);
        if flags.contains(ClearFlags::TARGET) {
            attachments.push(ClearAttachment {
                aspect: vk::ImageAspectFlags::COLOR,
                color_attachment: 0,
                value: ClearValue::Color(color.to_rgba()),
            });
        }
        if let Some(depth_format) = target.desc.depth_format {
            let mut aspect = vk::ImageAspectFlags::empty();
            if flags.contains(ClearFlags::ZBUFFER) {
                aspect |= vk::ImageAspectFlags::DEPTH;
            }
            if flags.contains(ClearFlags::STENCIL) && has_stencil(depth_format) {
                aspect |= vk::ImageAspectFlags::STENCIL;
            }
            if !aspect.is_empty() {
                attachments.push(ClearAttachment {
                    aspect,
                    color_attachment: 0,
                    value: ClearValue::DepthStencil { depth: z, stencil },
                });
            }
        }

        let full = Rect2D::from_extent(target.extent);
        let Some(area) = (match self.state_vector.viewport {
            Some(viewport) => viewport.rect().intersect(&full),
            None => Some(full),
        }) else {
            return Ok(());
        };
        let regions: Vec<Rect2D> = if rects.is_empty() {
            vec![area]
        } else {
            rects
                .iter()
                .filter_map(|r| r.to_rect())
                .filter_map(|r| r.intersect(&area))
                .collect()
        };
        let result = self.recorder.clear_attachments(
            &mut self.driver,
            &mut self.surface.frames,
            attachments,
            regions,
        );
        self.track(result)
    }

    // ── State setters ───────────────────────────────────────

    /// Bind stream 0. A `stride` of zero uses the vertex format's own stride.
    pub fn set_vertex_buffer(&mut self, buffer: Option<BufferId>, stride: u32) -> Result<()> {
        self.guard()?;
        if let Some(id) = buffer {
            if self.translator.buffer(id)?.role != BufferRole::Vertex {
                return Err(BridgeError::InvalidArgument("not a vertex buffer".into()));
            }
        }
        self.state_vector.stream = buffer.map(|buffer| VertexStream { buffer, stride });
        Ok(())
    }

    pub fn set_index_buffer(&mut self, buffer: Option<BufferId>, base_vertex: i32) -> Result<()> {
        self.guard()?;
        if let Some(id) = buffer {
            if self.translator.buffer(id)?.role != BufferRole::Index {
                return Err(BridgeError::InvalidArgument("not an index buffer".into()));
            }
        }
        self.state_vector.indices = buffer.map(|buffer| IndexBinding {
            buffer,
            base_vertex,
        });
        Ok(())
    }

    /// Select the color and depth targets for the next scene. `None` color
    /// means the back buffer, `None` depth the automatic depth buffer.
    pub fn set_render_targets(
        &mut self,
        color: Option<ImageId>,
        depth: Option<ImageId>,
    ) -> Result<()> {
        self.guard()?;
        let color_image = color.map(|id| self.translator.image(id)).transpose()?;
        let depth_image = depth.map(|id| self.translator.image(id)).transpose()?;
        if color_image.is_some_and(|c| !c.is_render_target()) {
            return Err(BridgeError::InvalidArgument(
                "color target was not created as a render target".into(),
            ));
        }
        if let Some(d) = depth_image {
            if !d.is_depth_stencil() {
                return Err(BridgeError::InvalidArgument(
                    "depth target was not created as a depth-stencil surface".into(),
                ));
            }
            if let Some(c) = color_image {
                check_covers(d, c.extent)?;
            }
        }
        self.state_vector.render_target = color;
        self.state_vector.depth_stencil = depth;
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: LegacyViewport) -> Result<()> {
        self.guard()?;
        let depth_ok = (0.0..=1.0).contains(&viewport.min_z)
            && (0.0..=1.0).contains(&viewport.max_z)
            && viewport.min_z <= viewport.max_z;
        if viewport.width == 0 || viewport.height == 0 || !depth_ok {
            return Err(BridgeError::InvalidArgument(format!(
                "invalid viewport {viewport:?}"
            )));
        }
        self.state_vector.viewport = Some(viewport);
        Ok(())
    }

    /// `None` clips to the viewport again.
    pub fn set_scissor(&mut self, scissor: Option<Rect2D>) -> Result<()> {
        self.guard()?;
        self.state_vector.scissor = scissor;
        Ok(())
    }

    pub fn set_vertex_format(&mut self, fvf: Fvf) -> Result<()> {
        self.guard()?;
        if !fvf.contains(Fvf::XYZ) {
            return Err(BridgeError::InvalidArgument(format!(
                "vertex format {fvf:?} has no position"
            )));
        }
        self.state_vector.fvf = fvf;
        Ok(())
    }

    pub fn set_transform(&mut self, kind: TransformKind, matrix: &Matrix4) -> Result<()> {
        self.guard()?;
        self.state_vector.set_transform(kind, *matrix);
        Ok(())
    }

    pub fn set_render_state(&mut self, state: RenderState) -> Result<()> {
        self.guard()?;
        self.state_vector.apply_render_state(state);
        Ok(())
    }

    /// Only stage 0 exists.
    pub fn set_texture(&mut self, stage: u32, texture: Option<ImageId>) -> Result<()> {
        self.guard()?;
        if stage != 0 {
            return Err(BridgeError::InvalidArgument(format!(
                "texture stage {stage} is not supported"
            )));
        }
        if let Some(id) = texture {
            if self.translator.image(id)?.is_depth_stencil() {
                return Err(BridgeError::InvalidArgument(
                    "depth-stencil surfaces cannot be sampled".into(),
                ));
            }
        }
        self.state_vector.texture = texture;
        Ok(())
    }

    // ── Resources ───────────────────────────────────────────

    pub fn create_vertex_buffer(&mut self, size: u64, usage: Usage) -> Result<BufferId> {
        self.require_ready()?;
        let result =
            self.translator
                .create_buffer(&mut self.driver, BufferRole::Vertex, size, usage);
        self.track(result)
    }

    pub fn create_index_buffer(
        &mut self,
        size: u64,
        usage: Usage,
        format: LegacyFormat,
    ) -> Result<BufferId> {
        self.require_ready()?;
        let result = self
            .translator
            .create_index_buffer(&mut self.driver, size, usage, format);
        self.track(result)
    }

    fn create_image(
        &mut self,
        width: u32,
        height: u32,
        format: LegacyFormat,
        usage: Usage,
    ) -> Result<ImageId> {
        self.require_ready()?;
        let result = self.translator.create_image(
            &mut self.driver,
            &mut self.tracker,
            width,
            height,
            format,
            usage,
        );
        self.track(result)
    }

    pub fn create_texture(&mut self, width: u32, height: u32, format: LegacyFormat) -> Result<ImageId> {
        self.create_image(width, height, format, Usage::empty())
    }

    pub fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
        format: LegacyFormat,
    ) -> Result<ImageId> {
        self.create_image(width, height, format, Usage::RENDERTARGET)
    }

    pub fn create_depth_stencil(
        &mut self,
        width: u32,
        height: u32,
        format: LegacyFormat,
    ) -> Result<ImageId> {
        self.create_image(width, height, format, Usage::DEPTHSTENCIL)
    }

    pub fn update_buffer(&mut self, id: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        self.require_ready()?;
        let result = self
            .translator
            .update_buffer(&mut self.driver, id, offset, data);
        self.track(result)
    }

    pub fn update_image(&mut self, id: ImageId, data: &[u8]) -> Result<()> {
        self.require_ready()?;
        let result =
            self.translator
                .update_image(&mut self.driver, &mut self.tracker, id, data);
        self.track(result)
    }

    /// Invalidate `id` now and destroy it once the GPU is done with it.
    pub fn release_buffer(&mut self, id: BufferId) -> Result<()> {
        self.guard()?;
        let serial = self.recorder.retire_serial(&self.tracker);
        self.translator.release_buffer(id, serial)?;
        self.state_vector.forget_buffer(id);
        self.translator
            .collect(&mut self.driver, self.tracker.completed());
        Ok(())
    }

    pub fn release_image(&mut self, id: ImageId) -> Result<()> {
        self.guard()?;
        let serial = self.recorder.retire_serial(&self.tracker);
        let views = self.translator.release_image(id, serial)?;
        self.state_vector.forget_image(id);
        let framebuffers = self.surface.framebuffers.take_referencing(&views);
        self.translator.retire(framebuffers, serial);
        self.translator
            .collect(&mut self.driver, self.tracker.completed());
        Ok(())
    }
}

impl<D: Driver> Drop for Bridge<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stencil_formats() {
        assert!(has_stencil(vk::Format::D24_UNORM_S8_UINT));
        assert!(!has_stencil(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn test_fence_timeout_in_nanoseconds() {
        let mut config = FixvkConfig::default();
        config.frame.fence_timeout_ms = 250;
        assert_eq!(fence_timeout_ns(&config), 250_000_000);
        config.frame.fence_timeout_ms = u64::MAX;
        assert_eq!(fence_timeout_ns(&config), u64::MAX);
    }
}
