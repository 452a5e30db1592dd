//! The legacy-visible rendering state, mutated only by the façade setters.

use fixvk_protocol::types::Rect2D;

use crate::legacy::{
    Blend, CmpFunc, CullMode, FillMode, Fvf, LegacyViewport, Matrix4, RenderState, TransformKind,
};
use crate::translator::{BufferId, ImageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexStream {
    pub buffer: BufferId,
    /// Zero means the natural stride of the current vertex format
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBinding {
    pub buffer: BufferId,
    /// Added to every index, as `SetIndices` does
    pub base_vertex: i32,
}

/// Fixed-function raster, blend and depth state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterState {
    pub cull: CullMode,
    pub fill: FillMode,
    pub blend_enable: bool,
    pub src_blend: Blend,
    pub dest_blend: Blend,
    pub z_enable: bool,
    pub z_write: bool,
    pub z_func: CmpFunc,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            cull: CullMode::Ccw,
            fill: FillMode::Solid,
            blend_enable: false,
            src_blend: Blend::One,
            dest_blend: Blend::Zero,
            z_enable: true,
            z_write: true,
            z_func: CmpFunc::LessEqual,
        }
    }
}

/// Values the next render-pass begin clears to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    pub stencil: u32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.0, 0.0, 0.0, 1.0],
            depth: 1.0,
            stencil: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateVector {
    pub stream: Option<VertexStream>,
    pub indices: Option<IndexBinding>,
    pub fvf: Fvf,
    /// `None` renders into the back buffer
    pub render_target: Option<ImageId>,
    /// `None` uses the automatic depth buffer when there is one
    pub depth_stencil: Option<ImageId>,
    /// `None` covers the whole render target
    pub viewport: Option<LegacyViewport>,
    pub scissor: Option<Rect2D>,
    pub world: Matrix4,
    pub view: Matrix4,
    pub projection: Matrix4,
    pub raster: RasterState,
    /// Stage 0 texture
    pub texture: Option<ImageId>,
    pub clear: ClearValues,
}

impl StateVector {
    pub fn set_transform(&mut self, kind: TransformKind, matrix: Matrix4) {
        match kind {
            TransformKind::World => self.world = matrix,
            TransformKind::View => self.view = matrix,
            TransformKind::Projection => self.projection = matrix,
        }
    }

    /// Combined world·view·projection as pushed to the vertex shader.
    pub fn wvp(&self) -> Matrix4 {
        self.world.mul(&self.view).mul(&self.projection)
    }

    pub fn apply_render_state(&mut self, state: RenderState) {
        let raster = &mut self.raster;
        match state {
            RenderState::CullMode(mode) => raster.cull = mode,
            RenderState::FillMode(mode) => raster.fill = mode,
            RenderState::AlphaBlendEnable(on) => raster.blend_enable = on,
            RenderState::SrcBlend(blend) => raster.src_blend = blend,
            RenderState::DestBlend(blend) => raster.dest_blend = blend,
            RenderState::ZEnable(on) => raster.z_enable = on,
            RenderState::ZWriteEnable(on) => raster.z_write = on,
            RenderState::ZFunc(func) => raster.z_func = func,
        }
    }

    /// Stride to use for the bound stream.
    pub fn stream_stride(&self) -> u32 {
        match self.stream {
            Some(stream) if stream.stride > 0 => stream.stride,
            _ => self.fvf.natural_stride(),
        }
    }

    /// Drop every reference to a buffer that is being released.
    pub fn forget_buffer(&mut self, id: BufferId) {
        self.stream.take_if(|s| s.buffer == id);
        self.indices.take_if(|i| i.buffer == id);
    }

    pub fn forget_image(&mut self, id: ImageId) {
        self.render_target.take_if(|i| *i == id);
        self.depth_stencil.take_if(|i| *i == id);
        self.texture.take_if(|i| *i == id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixvk_core::ArenaId;

    #[test]
    fn test_defaults_match_legacy_device() {
        let state = StateVector::default();
        assert_eq!(state.raster.cull, CullMode::Ccw);
        assert!(state.raster.z_enable);
        assert_eq!(state.raster.z_func, CmpFunc::LessEqual);
        assert_eq!(state.wvp(), Matrix4::IDENTITY);
        assert_eq!(state.fvf, Fvf::XYZ | Fvf::TEX1);
        assert_eq!(state.clear.depth, 1.0);
    }

    #[test]
    fn test_wvp_order() {
        let mut state = StateVector::default();
        state.set_transform(TransformKind::World, Matrix4::translation(1.0, 0.0, 0.0));
        state.set_transform(TransformKind::View, Matrix4::scale(2.0, 2.0, 2.0));
        assert_eq!(state.wvp().m[3], [2.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_render_states() {
        let mut state = StateVector::default();
        state.apply_render_state(RenderState::AlphaBlendEnable(true));
        state.apply_render_state(RenderState::SrcBlend(Blend::SrcAlpha));
        state.apply_render_state(RenderState::DestBlend(Blend::InvSrcAlpha));
        state.apply_render_state(RenderState::CullMode(CullMode::None));
        assert!(state.raster.blend_enable);
        assert_eq!(state.raster.src_blend, Blend::SrcAlpha);
        assert_eq!(state.raster.dest_blend, Blend::InvSrcAlpha);
        assert_eq!(state.raster.cull, CullMode::None);
    }

    #[test]
    fn test_stride_falls_back_to_fvf() {
        let mut state = StateVector::default();
        let buffer = BufferId(ArenaId::from_raw(0, 1));
        state.stream = Some(VertexStream { buffer, stride: 0 });
        assert_eq!(state.stream_stride(), 20);
        state.stream = Some(VertexStream { buffer, stride: 32 });
        assert_eq!(state.stream_stride(), 32);
    }

    #[test]
    fn test_forget_released_resources() {
        let mut state = StateVector::default();
        let a = BufferId(ArenaId::from_raw(0, 1));
        let b = BufferId(ArenaId::from_raw(1, 1));
        state.stream = Some(VertexStream { buffer: a, stride: 0 });
        state.indices = Some(IndexBinding {
            buffer: b,
            base_vertex: 0,
        });
        state.forget_buffer(a);
        assert!(state.stream.is_none());
        assert!(state.indices.is_some());
    }
}
