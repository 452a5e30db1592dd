//! Direct3D 8 call-surface vocabulary.
//!
//! Enum discriminants are the raw `D3D*` constants so hosts forwarding real
//! calls can convert with `from_raw`.

use ash::vk;
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use fixvk_protocol::types::{Rect2D, Viewport};

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

/// `D3DFORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LegacyFormat {
    R8G8B8 = 20,
    A8R8G8B8 = 21,
    X8R8G8B8 = 22,
    R5G6B5 = 23,
    X1R5G5B5 = 24,
    A1R5G5B5 = 25,
    A4R4G4B4 = 26,
    A8 = 28,
    P8 = 41,
    L8 = 50,
    A8L8 = 51,
    D32 = 71,
    D24S8 = 75,
    D24X8 = 77,
    D16 = 80,
    Index16 = 101,
    Index32 = 102,
    Dxt1 = fourcc(b"DXT1"),
    Dxt3 = fourcc(b"DXT3"),
    Dxt5 = fourcc(b"DXT5"),
}

impl LegacyFormat {
    const ALL: [LegacyFormat; 20] = [
        LegacyFormat::R8G8B8,
        LegacyFormat::A8R8G8B8,
        LegacyFormat::X8R8G8B8,
        LegacyFormat::R5G6B5,
        LegacyFormat::X1R5G5B5,
        LegacyFormat::A1R5G5B5,
        LegacyFormat::A4R4G4B4,
        LegacyFormat::A8,
        LegacyFormat::P8,
        LegacyFormat::L8,
        LegacyFormat::A8L8,
        LegacyFormat::D32,
        LegacyFormat::D24S8,
        LegacyFormat::D24X8,
        LegacyFormat::D16,
        LegacyFormat::Index16,
        LegacyFormat::Index32,
        LegacyFormat::Dxt1,
        LegacyFormat::Dxt3,
        LegacyFormat::Dxt5,
    ];

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| *f as u32 == raw)
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            LegacyFormat::D16 | LegacyFormat::D24S8 | LegacyFormat::D24X8 | LegacyFormat::D32
        )
    }

    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            LegacyFormat::Dxt1 | LegacyFormat::Dxt3 | LegacyFormat::Dxt5
        )
    }
}

/// `D3DPRIMITIVETYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PrimitiveType {
    PointList = 1,
    LineList = 2,
    LineStrip = 3,
    TriangleList = 4,
    TriangleStrip = 5,
    TriangleFan = 6,
}

impl PrimitiveType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => PrimitiveType::PointList,
            2 => PrimitiveType::LineList,
            3 => PrimitiveType::LineStrip,
            4 => PrimitiveType::TriangleList,
            5 => PrimitiveType::TriangleStrip,
            6 => PrimitiveType::TriangleFan,
            _ => return None,
        })
    }

    /// Fans are drawn natively; Vulkan keeps the same vertex order.
    pub fn topology(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveType::PointList => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveType::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveType::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveType::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveType::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            PrimitiveType::TriangleFan => vk::PrimitiveTopology::TRIANGLE_FAN,
        }
    }

    /// Vertices (or indices) consumed by `primitive_count` primitives.
    pub fn vertex_count(self, primitive_count: u32) -> u32 {
        if primitive_count == 0 {
            return 0;
        }
        match self {
            PrimitiveType::PointList => primitive_count,
            PrimitiveType::LineList => primitive_count.saturating_mul(2),
            PrimitiveType::LineStrip => primitive_count.saturating_add(1),
            PrimitiveType::TriangleList => primitive_count.saturating_mul(3),
            PrimitiveType::TriangleStrip | PrimitiveType::TriangleFan => {
                primitive_count.saturating_add(2)
            }
        }
    }
}

bitflags! {
    /// `D3DFVF_*` flexible vertex format bits understood by the bridge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Fvf: u32 {
        const XYZ = 0x002;
        const NORMAL = 0x010;
        const DIFFUSE = 0x040;
        const SPECULAR = 0x080;
        const TEX1 = 0x100;
        const TEX2 = 0x200;
        const TEX3 = 0x300;
        const TEX4 = 0x400;
        const TEX5 = 0x500;
        const TEX6 = 0x600;
        const TEX7 = 0x700;
        const TEX8 = 0x800;
    }
}

impl Fvf {
    const TEXCOUNT_MASK: u32 = 0xf00;
    const TEXCOUNT_SHIFT: u32 = 8;

    pub fn tex_count(self) -> u32 {
        (self.bits() & Self::TEXCOUNT_MASK) >> Self::TEXCOUNT_SHIFT
    }

    /// Bytes per vertex when every component is packed in FVF order.
    pub fn natural_stride(self) -> u32 {
        let mut stride = 0;
        if self.contains(Fvf::XYZ) {
            stride += 12;
        }
        if self.contains(Fvf::NORMAL) {
            stride += 12;
        }
        if self.contains(Fvf::DIFFUSE) {
            stride += 4;
        }
        if self.contains(Fvf::SPECULAR) {
            stride += 4;
        }
        stride + 8 * self.tex_count()
    }
}

impl Default for Fvf {
    fn default() -> Self {
        Fvf::XYZ | Fvf::TEX1
    }
}

bitflags! {
    /// `D3DUSAGE_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Usage: u32 {
        const RENDERTARGET = 0x0001;
        const DEPTHSTENCIL = 0x0002;
        const WRITEONLY = 0x0008;
        const DYNAMIC = 0x0200;
    }
}

bitflags! {
    /// `D3DCLEAR_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const TARGET = 0x1;
        const ZBUFFER = 0x2;
        const STENCIL = 0x4;
    }
}

/// Row-major 4×4 matrix with the row-vector convention (`D3DMATRIX`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Matrix4 {
    pub m: [[f32; 4]; 4],
}

impl Matrix4 {
    pub const IDENTITY: Matrix4 = Matrix4 {
        m: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    pub fn translation(x: f32, y: f32, z: f32) -> Self {
        let mut out = Self::IDENTITY;
        out.m[3] = [x, y, z, 1.0];
        out
    }

    pub fn scale(x: f32, y: f32, z: f32) -> Self {
        let mut out = Self::IDENTITY;
        out.m[0][0] = x;
        out.m[1][1] = y;
        out.m[2][2] = z;
        out
    }

    /// `self` applied first, then `rhs`.
    pub fn mul(&self, rhs: &Matrix4) -> Matrix4 {
        let mut out = [[0.0f32; 4]; 4];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..4).map(|k| self.m[i][k] * rhs.m[k][j]).sum();
            }
        }
        Matrix4 { m: out }
    }
}

impl Default for Matrix4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// `D3DTRANSFORMSTATETYPE`, limited to the fixed-function trio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    World,
    View,
    Projection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CullMode {
    None = 1,
    Cw = 2,
    Ccw = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FillMode {
    Point = 1,
    Wireframe = 2,
    Solid = 3,
}

/// `D3DBLEND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Blend {
    Zero = 1,
    One = 2,
    SrcColor = 3,
    InvSrcColor = 4,
    SrcAlpha = 5,
    InvSrcAlpha = 6,
    DestAlpha = 7,
    InvDestAlpha = 8,
    DestColor = 9,
    InvDestColor = 10,
    SrcAlphaSat = 11,
}

/// `D3DCMPFUNC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CmpFunc {
    Never = 1,
    Less = 2,
    Equal = 3,
    LessEqual = 4,
    Greater = 5,
    NotEqual = 6,
    GreaterEqual = 7,
    Always = 8,
}

/// One `SetRenderState` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    CullMode(CullMode),
    FillMode(FillMode),
    AlphaBlendEnable(bool),
    SrcBlend(Blend),
    DestBlend(Blend),
    ZEnable(bool),
    ZWriteEnable(bool),
    ZFunc(CmpFunc),
}

/// `D3DCOLOR`: packed 0xAARRGGBB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct D3dColor(pub u32);

impl D3dColor {
    pub const fn argb(a: u8, r: u8, g: u8, b: u8) -> Self {
        Self((a as u32) << 24 | (r as u32) << 16 | (g as u32) << 8 | b as u32)
    }

    pub fn to_rgba(self) -> [f32; 4] {
        let channel = |shift: u32| ((self.0 >> shift) & 0xff) as f32 / 255.0;
        [channel(16), channel(8), channel(0), channel(24)]
    }
}

/// `D3DRECT`: corners, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct D3dRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl D3dRect {
    pub fn to_rect(self) -> Option<Rect2D> {
        if self.x2 <= self.x1 || self.y2 <= self.y1 {
            return None;
        }
        Some(Rect2D::new(
            self.x1,
            self.y1,
            (self.x2 - self.x1) as u32,
            (self.y2 - self.y1) as u32,
        ))
    }
}

/// `D3DVIEWPORT8`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegacyViewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub min_z: f32,
    pub max_z: f32,
}

impl LegacyViewport {
    pub fn to_viewport(self) -> Viewport {
        Viewport {
            x: self.x as f32,
            y: self.y as f32,
            width: self.width as f32,
            height: self.height as f32,
            min_depth: self.min_z,
            max_depth: self.max_z,
        }
    }

    pub fn rect(self) -> Rect2D {
        Rect2D::new(self.x as i32, self.y as i32, self.width, self.height)
    }
}

/// Index data handed to `DrawIndexedPrimitiveUP`.
#[derive(Debug, Clone, Copy)]
pub enum IndexData<'a> {
    U16(&'a [u16]),
    U32(&'a [u32]),
}

impl IndexData<'_> {
    pub fn len(&self) -> usize {
        match self {
            IndexData::U16(i) => i.len(),
            IndexData::U32(i) => i.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index_type(&self) -> vk::IndexType {
        match self {
            IndexData::U16(_) => vk::IndexType::UINT16,
            IndexData::U32(_) => vk::IndexType::UINT32,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            IndexData::U16(i) => bytemuck::cast_slice(i),
            IndexData::U32(i) => bytemuck::cast_slice(i),
        }
    }

    /// First `count` indices only.
    pub fn truncated(&self, count: usize) -> Option<Self> {
        match self {
            IndexData::U16(i) => i.get(..count).map(IndexData::U16),
            IndexData::U32(i) => i.get(..count).map(IndexData::U32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_counts() {
        assert_eq!(PrimitiveType::TriangleList.vertex_count(1), 3);
        assert_eq!(PrimitiveType::TriangleStrip.vertex_count(2), 4);
        assert_eq!(PrimitiveType::TriangleFan.vertex_count(4), 6);
        assert_eq!(PrimitiveType::LineList.vertex_count(3), 6);
        assert_eq!(PrimitiveType::LineStrip.vertex_count(3), 4);
        assert_eq!(PrimitiveType::PointList.vertex_count(7), 7);
        assert_eq!(PrimitiveType::TriangleStrip.vertex_count(0), 0);
    }

    #[test]
    fn test_fvf_stride() {
        assert_eq!(Fvf::default().natural_stride(), 20);
        assert_eq!((Fvf::XYZ | Fvf::DIFFUSE).natural_stride(), 16);
        let full = Fvf::XYZ | Fvf::NORMAL | Fvf::DIFFUSE | Fvf::SPECULAR | Fvf::TEX2;
        assert_eq!(full.tex_count(), 2);
        assert_eq!(full.natural_stride(), 12 + 12 + 4 + 4 + 16);
    }

    #[test]
    fn test_unknown_fvf_bits_rejected() {
        // D3DFVF_XYZRHW
        assert!(Fvf::from_bits(0x004).is_none());
    }

    #[test]
    fn test_format_codes() {
        assert_eq!(LegacyFormat::from_raw(21), Some(LegacyFormat::A8R8G8B8));
        assert_eq!(LegacyFormat::from_raw(0x3154_5844), Some(LegacyFormat::Dxt1));
        assert_eq!(LegacyFormat::from_raw(0), None);
    }

    #[test]
    fn test_matrix_order() {
        let t = Matrix4::translation(1.0, 2.0, 3.0);
        let s = Matrix4::scale(2.0, 2.0, 2.0);
        // Scale first, then translate: the translation row is unscaled.
        assert_eq!(s.mul(&t).m[3], [1.0, 2.0, 3.0, 1.0]);
        // Translate first, then scale: the translation is scaled too.
        assert_eq!(t.mul(&s).m[3], [2.0, 4.0, 6.0, 1.0]);
        assert_eq!(Matrix4::IDENTITY.mul(&t), t);
    }

    #[test]
    fn test_color_unpack() {
        let c = D3dColor::argb(255, 255, 0, 51);
        assert_eq!(c.to_rgba(), [1.0, 0.0, 0.2, 1.0]);
    }

    #[test]
    fn test_rect_conversion() {
        let r = D3dRect {
            x1: 10,
            y1: 20,
            x2: 30,
            y2: 60,
        };
        assert_eq!(r.to_rect(), Some(Rect2D::new(10, 20, 20, 40)));
        let empty = D3dRect {
            x1: 5,
            y1: 5,
            x2: 5,
            y2: 9,
        };
        assert_eq!(empty.to_rect(), None);
    }
}
