//! Pipeline objects keyed by the fixed-function state that shapes them.

use std::collections::HashMap;

use ash::vk;
use tracing::{debug, warn};

use fixvk_protocol::descriptors::{
    BlendState, DepthState, GraphicsPipelineDesc, PipelineLayoutDesc, RenderPassDesc,
    VertexAttribute, ViewportState,
};
use fixvk_protocol::types::{Extent2D, Rect2D, Viewport};
use fixvk_protocol::{Driver, GpuHandle};

use crate::error::{BridgeError, Result};
use crate::legacy::{Blend, CmpFunc, CullMode, FillMode, Fvf, PrimitiveType};
use crate::shaders::{
    ShaderLibrary, ShaderVariant, COLOR_LOCATION, POSITION_LOCATION, TEXCOORD_LOCATION,
    TRANSFORM_PUSH_SIZE,
};
use crate::state::StateVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexLayout {
    pub fvf: Fvf,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendKey {
    pub enabled: bool,
    pub src: Blend,
    pub dst: Blend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthKey {
    pub test: bool,
    pub write: bool,
    pub func: CmpFunc,
}

impl DepthKey {
    const OFF: DepthKey = DepthKey {
        test: false,
        write: false,
        func: CmpFunc::Always,
    };
}

/// Viewport handling baked into a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewportKey {
    Dynamic,
    /// `[x, y, width, height, min_depth, max_depth]` as f32 bits
    Fixed { viewport: [u32; 6], scissor: Rect2D },
}

impl ViewportKey {
    fn fixed(viewport: Viewport, scissor: Rect2D) -> Self {
        ViewportKey::Fixed {
            viewport: [
                viewport.x.to_bits(),
                viewport.y.to_bits(),
                viewport.width.to_bits(),
                viewport.height.to_bits(),
                viewport.min_depth.to_bits(),
                viewport.max_depth.to_bits(),
            ],
            scissor,
        }
    }

    fn state(&self) -> ViewportState {
        match *self {
            ViewportKey::Dynamic => ViewportState::Dynamic,
            ViewportKey::Fixed { viewport, scissor } => ViewportState::Fixed {
                viewport: Viewport {
                    x: f32::from_bits(viewport[0]),
                    y: f32::from_bits(viewport[1]),
                    width: f32::from_bits(viewport[2]),
                    height: f32::from_bits(viewport[3]),
                    min_depth: f32::from_bits(viewport[4]),
                    max_depth: f32::from_bits(viewport[5]),
                },
                scissor,
            },
        }
    }
}

/// Device properties that change how state folds into a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOptions {
    pub dynamic_viewport: bool,
    pub fill_mode_non_solid: bool,
}

/// Hashable snapshot of everything a pipeline object depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub layout: VertexLayout,
    pub primitive: PrimitiveType,
    pub blend: BlendKey,
    pub cull: CullMode,
    pub fill: FillMode,
    pub shaders: ShaderVariant,
    pub depth: DepthKey,
    pub target: RenderPassDesc,
    pub viewport: ViewportKey,
}

impl PipelineKey {
    /// Snapshot the pipeline-relevant part of `state`.
    ///
    /// Transforms, bound buffers and clear values never reach the key.
    pub fn derive(
        state: &StateVector,
        primitive: PrimitiveType,
        stride: u32,
        texture_bound: bool,
        target: RenderPassDesc,
        extent: Extent2D,
        options: KeyOptions,
    ) -> Self {
        let raster = &state.raster;
        let blend = if raster.blend_enable {
            BlendKey {
                enabled: true,
                src: raster.src_blend,
                dst: raster.dest_blend,
            }
        } else {
            BlendKey {
                enabled: false,
                src: Blend::One,
                dst: Blend::Zero,
            }
        };
        let depth = if target.depth_format.is_some() && raster.z_enable {
            DepthKey {
                test: true,
                write: raster.z_write,
                func: raster.z_func,
            }
        } else {
            DepthKey::OFF
        };
        let fill = if options.fill_mode_non_solid {
            raster.fill
        } else {
            FillMode::Solid
        };
        let viewport = if options.dynamic_viewport {
            ViewportKey::Dynamic
        } else {
            let (viewport, scissor) = effective_viewport(state, extent);
            ViewportKey::fixed(viewport, scissor)
        };
        Self {
            layout: VertexLayout {
                fvf: state.fvf,
                stride,
            },
            primitive,
            blend,
            cull: raster.cull,
            fill,
            shaders: ShaderVariant::select(state.fvf, texture_bound),
            depth,
            target,
            viewport,
        }
    }
}

/// Viewport and scissor in effect for a target of `extent`.
pub fn effective_viewport(state: &StateVector, extent: Extent2D) -> (Viewport, Rect2D) {
    let full = Rect2D::from_extent(extent);
    let viewport = state
        .viewport
        .map(|v| v.to_viewport())
        .unwrap_or_else(|| Viewport::covering(extent));
    // Legacy viewports clip, so an unset scissor follows the viewport.
    let scissor = match state.scissor.or_else(|| state.viewport.map(|v| v.rect())) {
        Some(rect) => rect.intersect(&full).unwrap_or_default(),
        None => full,
    };
    (viewport, scissor)
}

/// Attribute list for the vertex layout, walking FVF components in order.
pub fn vertex_attributes(fvf: Fvf, variant: ShaderVariant) -> Vec<VertexAttribute> {
    let mut attributes = Vec::with_capacity(3);
    let mut offset = 0;
    if fvf.contains(Fvf::XYZ) {
        attributes.push(VertexAttribute {
            location: POSITION_LOCATION,
            format: vk::Format::R32G32B32_SFLOAT,
            offset,
        });
        offset += 12;
    }
    if fvf.contains(Fvf::NORMAL) {
        offset += 12;
    }
    if fvf.contains(Fvf::DIFFUSE) {
        if variant.colored {
            attributes.push(VertexAttribute {
                location: COLOR_LOCATION,
                format: vk::Format::B8G8R8A8_UNORM,
                offset,
            });
        }
        offset += 4;
    }
    if fvf.contains(Fvf::SPECULAR) {
        offset += 4;
    }
    if variant.textured && fvf.tex_count() > 0 {
        attributes.push(VertexAttribute {
            location: TEXCOORD_LOCATION,
            format: vk::Format::R32G32_SFLOAT,
            offset,
        });
    }
    attributes
}

pub fn blend_factor(blend: Blend) -> vk::BlendFactor {
    match blend {
        Blend::Zero => vk::BlendFactor::ZERO,
        Blend::One => vk::BlendFactor::ONE,
        Blend::SrcColor => vk::BlendFactor::SRC_COLOR,
        Blend::InvSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        Blend::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        Blend::InvSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        Blend::DestAlpha => vk::BlendFactor::DST_ALPHA,
        Blend::InvDestAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        Blend::DestColor => vk::BlendFactor::DST_COLOR,
        Blend::InvDestColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        Blend::SrcAlphaSat => vk::BlendFactor::SRC_ALPHA_SATURATE,
    }
}

pub fn compare_op(func: CmpFunc) -> vk::CompareOp {
    match func {
        CmpFunc::Never => vk::CompareOp::NEVER,
        CmpFunc::Less => vk::CompareOp::LESS,
        CmpFunc::Equal => vk::CompareOp::EQUAL,
        CmpFunc::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CmpFunc::Greater => vk::CompareOp::GREATER,
        CmpFunc::NotEqual => vk::CompareOp::NOT_EQUAL,
        CmpFunc::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CmpFunc::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Cw => vk::CullModeFlags::FRONT,
        CullMode::Ccw => vk::CullModeFlags::BACK,
    }
}

pub fn polygon_mode(mode: FillMode) -> vk::PolygonMode {
    match mode {
        FillMode::Point => vk::PolygonMode::POINT,
        FillMode::Wireframe => vk::PolygonMode::LINE,
        FillMode::Solid => vk::PolygonMode::FILL,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

/// Owns every pipeline object and the layout they share.
#[derive(Debug, Default)]
pub struct PipelineCache {
    pipelines: HashMap<PipelineKey, GpuHandle>,
    shaders: ShaderLibrary,
    layout: GpuHandle,
    stats: PipelineStats,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the shared pipeline layout over `set_layout`.
    pub fn init<D: Driver>(&mut self, driver: &mut D, set_layout: GpuHandle) -> Result<()> {
        self.layout = driver
            .create_pipeline_layout(&PipelineLayoutDesc {
                set_layouts: vec![set_layout],
                push_constant_size: TRANSFORM_PUSH_SIZE,
                push_constant_stages: vk::ShaderStageFlags::VERTEX,
            })
            .map_err(|e| BridgeError::init("pipeline layout", e))?;
        Ok(())
    }

    pub fn layout(&self) -> GpuHandle {
        self.layout
    }

    /// Compile every shader variant up front.
    pub fn prepare_shaders<D: Driver>(&mut self, driver: &mut D) -> Result<()> {
        for variant in ShaderVariant::ALL {
            self.shaders.get_or_create(driver, variant)?;
        }
        Ok(())
    }

    /// The pipeline for `key`, built on first use. Failures are not cached.
    pub fn resolve<D: Driver>(
        &mut self,
        driver: &mut D,
        key: &PipelineKey,
        render_pass: GpuHandle,
    ) -> Result<GpuHandle> {
        if let Some(pipeline) = self.pipelines.get(key) {
            self.stats.hits += 1;
            return Ok(*pipeline);
        }
        self.stats.misses += 1;
        match self.build(driver, key, render_pass) {
            Ok(pipeline) => {
                debug!(
                    ?pipeline,
                    primitive = ?key.primitive,
                    live = self.pipelines.len() + 1,
                    "created pipeline"
                );
                self.pipelines.insert(*key, pipeline);
                Ok(pipeline)
            }
            Err(e) => {
                self.stats.failures += 1;
                warn!("pipeline creation failed: {}", e);
                Err(e)
            }
        }
    }

    fn build<D: Driver>(
        &mut self,
        driver: &mut D,
        key: &PipelineKey,
        render_pass: GpuHandle,
    ) -> Result<GpuHandle> {
        let shaders = self.shaders.get_or_create(driver, key.shaders)?;
        let blend = if key.blend.enabled {
            let src = blend_factor(key.blend.src);
            let dst = blend_factor(key.blend.dst);
            BlendState {
                enabled: true,
                src_color: src,
                dst_color: dst,
                color_op: vk::BlendOp::ADD,
                src_alpha: src,
                dst_alpha: dst,
                alpha_op: vk::BlendOp::ADD,
            }
        } else {
            BlendState::OPAQUE
        };
        let desc = GraphicsPipelineDesc {
            vertex_shader: shaders.vertex,
            fragment_shader: shaders.fragment,
            layout: self.layout,
            render_pass,
            vertex_stride: key.layout.stride,
            attributes: vertex_attributes(key.layout.fvf, key.shaders),
            topology: key.primitive.topology(),
            polygon_mode: polygon_mode(key.fill),
            cull_mode: cull_mode(key.cull),
            front_face: vk::FrontFace::CLOCKWISE,
            blend,
            depth: DepthState {
                test: key.depth.test,
                write: key.depth.write,
                compare: compare_op(key.depth.func),
            },
            viewport: key.viewport.state(),
        };
        driver.create_graphics_pipeline(&desc).map_err(|e| {
            BridgeError::PipelineCreationFailed(format!("{:?}: {}", key.primitive, e))
        })
    }

    pub fn get(&self, key: &PipelineKey) -> Option<GpuHandle> {
        self.pipelines.get(key).copied()
    }

    fn purge<D: Driver>(&mut self, driver: &mut D, doomed: impl Fn(&PipelineKey) -> bool) -> usize {
        let before = self.pipelines.len();
        self.pipelines.retain(|key, pipeline| {
            if doomed(key) {
                driver.destroy(*pipeline);
                false
            } else {
                true
            }
        });
        before - self.pipelines.len()
    }

    /// Drop pipelines that embed absolute viewport dimensions.
    pub fn invalidate_fixed_viewport<D: Driver>(&mut self, driver: &mut D) -> usize {
        self.purge(driver, |key| matches!(key.viewport, ViewportKey::Fixed { .. }))
    }

    /// Drop pipelines built for a render target signature that no longer exists.
    pub fn purge_target<D: Driver>(
        &mut self,
        driver: &mut D,
        stale: impl Fn(&RenderPassDesc) -> bool,
    ) -> usize {
        self.purge(driver, |key| stale(&key.target))
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn destroy<D: Driver>(&mut self, driver: &mut D) {
        for (_, pipeline) in self.pipelines.drain() {
            driver.destroy(pipeline);
        }
        self.shaders.destroy(driver);
        if let Some(layout) = std::mem::take(&mut self.layout).non_null() {
            driver.destroy(layout);
        }
        self.stats = PipelineStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::legacy::{LegacyViewport, Matrix4, RenderState, TransformKind};
    use fixvk_protocol::types::ImageState;

    const OPTIONS: KeyOptions = KeyOptions {
        dynamic_viewport: true,
        fill_mode_non_solid: true,
    };

    fn target(depth: bool) -> RenderPassDesc {
        RenderPassDesc {
            color_format: vk::Format::B8G8R8A8_SRGB,
            color_final: ImageState::Present,
            depth_format: depth.then_some(vk::Format::D32_SFLOAT),
        }
    }

    fn key(state: &StateVector, primitive: PrimitiveType, options: KeyOptions) -> PipelineKey {
        PipelineKey::derive(
            state,
            primitive,
            state.stream_stride(),
            false,
            target(true),
            Extent2D::new(640, 480),
            options,
        )
    }

    #[test]
    fn test_transforms_do_not_reach_the_key() {
        let a = StateVector::default();
        let mut b = StateVector::default();
        b.set_transform(TransformKind::World, Matrix4::translation(5.0, 0.0, 0.0));
        b.set_transform(TransformKind::Projection, Matrix4::scale(0.5, 0.5, 1.0));
        assert_eq!(
            key(&a, PrimitiveType::TriangleList, OPTIONS),
            key(&b, PrimitiveType::TriangleList, OPTIONS)
        );
        assert_ne!(
            key(&a, PrimitiveType::TriangleList, OPTIONS),
            key(&a, PrimitiveType::TriangleStrip, OPTIONS)
        );
    }

    #[test]
    fn test_disabled_blend_is_normalized() {
        let a = StateVector::default();
        let mut b = StateVector::default();
        b.apply_render_state(RenderState::SrcBlend(Blend::SrcAlpha));
        assert_eq!(
            key(&a, PrimitiveType::TriangleList, OPTIONS),
            key(&b, PrimitiveType::TriangleList, OPTIONS)
        );
        b.apply_render_state(RenderState::AlphaBlendEnable(true));
        assert_ne!(
            key(&a, PrimitiveType::TriangleList, OPTIONS),
            key(&b, PrimitiveType::TriangleList, OPTIONS)
        );
    }

    #[test]
    fn test_depth_off_without_attachment() {
        let mut state = StateVector::default();
        state.apply_render_state(RenderState::ZFunc(CmpFunc::Greater));
        let key = PipelineKey::derive(
            &state,
            PrimitiveType::TriangleList,
            20,
            false,
            target(false),
            Extent2D::new(640, 480),
            OPTIONS,
        );
        assert_eq!(key.depth, DepthKey::OFF);
    }

    #[test]
    fn test_non_solid_fill_needs_device_support() {
        let mut state = StateVector::default();
        state.apply_render_state(RenderState::FillMode(FillMode::Wireframe));
        let supported = key(&state, PrimitiveType::TriangleList, OPTIONS);
        assert_eq!(supported.fill, FillMode::Wireframe);
        let unsupported = key(
            &state,
            PrimitiveType::TriangleList,
            KeyOptions {
                fill_mode_non_solid: false,
                ..OPTIONS
            },
        );
        assert_eq!(unsupported.fill, FillMode::Solid);
    }

    #[test]
    fn test_fixed_viewport_is_embedded() {
        let fixed = KeyOptions {
            dynamic_viewport: false,
            ..OPTIONS
        };
        let mut state = StateVector::default();
        let full = key(&state, PrimitiveType::TriangleList, fixed);
        state.viewport = Some(LegacyViewport {
            x: 0,
            y: 0,
            width: 320,
            height: 240,
            min_z: 0.0,
            max_z: 1.0,
        });
        let half = key(&state, PrimitiveType::TriangleList, fixed);
        assert_ne!(full, half);
        match half.viewport.state() {
            ViewportState::Fixed { viewport, scissor } => {
                assert_eq!(viewport.width, 320.0);
                assert_eq!(scissor, Rect2D::new(0, 0, 320, 240));
            }
            other => panic!("expected a fixed viewport, got {:?}", other),
        }
        assert_eq!(key(&state, PrimitiveType::TriangleList, OPTIONS).viewport, ViewportKey::Dynamic);
    }

    #[test]
    fn test_attribute_offsets_skip_unused_components() {
        let fvf = Fvf::XYZ | Fvf::NORMAL | Fvf::DIFFUSE | Fvf::SPECULAR | Fvf::TEX1;
        let attrs = vertex_attributes(
            fvf,
            ShaderVariant {
                colored: true,
                textured: true,
            },
        );
        assert_eq!(attrs.len(), 3);
        assert_eq!(attrs[0].offset, 0);
        assert_eq!(attrs[1].location, COLOR_LOCATION);
        assert_eq!(attrs[1].offset, 24);
        assert_eq!(attrs[2].location, TEXCOORD_LOCATION);
        assert_eq!(attrs[2].offset, 32);

        let untextured = vertex_attributes(
            Fvf::XYZ | Fvf::TEX1,
            ShaderVariant {
                colored: false,
                textured: false,
            },
        );
        assert_eq!(untextured.len(), 1);
    }

    #[test]
    fn test_raster_mappings() {
        assert_eq!(cull_mode(CullMode::Cw), vk::CullModeFlags::FRONT);
        assert_eq!(cull_mode(CullMode::Ccw), vk::CullModeFlags::BACK);
        assert_eq!(polygon_mode(FillMode::Wireframe), vk::PolygonMode::LINE);
        assert_eq!(compare_op(CmpFunc::LessEqual), vk::CompareOp::LESS_OR_EQUAL);
        assert_eq!(
            blend_factor(Blend::InvSrcAlpha),
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
    }
}
