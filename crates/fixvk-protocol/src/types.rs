#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_extent(extent: Extent2D) -> Self {
        Self::new(0, 0, extent.width, extent.height)
    }

    /// Overlap of two rectangles, `None` when they do not touch.
    pub fn intersect(&self, other: &Rect2D) -> Option<Rect2D> {
        let x0 = i64::from(self.x).max(i64::from(other.x));
        let y0 = i64::from(self.y).max(i64::from(other.y));
        let x1 = (i64::from(self.x) + i64::from(self.width))
            .min(i64::from(other.x) + i64::from(other.width));
        let y1 = (i64::from(self.y) + i64::from(self.height))
            .min(i64::from(other.y) + i64::from(other.height));
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect2D::new(x0 as i32, y0 as i32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-target viewport with the `[0, 1]` depth range.
    pub fn covering(extent: Extent2D) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// Layout/access state an image is moved between by a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageState {
    Undefined,
    TransferSrc,
    TransferDst,
    ShaderRead,
    ColorAttachment,
    DepthAttachment,
    Present,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// GPU-only memory; filled through staging copies
    DeviceLocal,
    /// Host-visible, coherent and persistently mapped
    HostVisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_intersection() {
        let a = Rect2D::new(0, 0, 100, 100);
        let b = Rect2D::new(50, 80, 100, 100);
        assert_eq!(a.intersect(&b), Some(Rect2D::new(50, 80, 50, 20)));
        assert_eq!(a.intersect(&Rect2D::new(200, 0, 10, 10)), None);
        assert_eq!(a.intersect(&Rect2D::new(100, 0, 10, 10)), None);
    }

    #[test]
    fn test_negative_origin_is_clipped() {
        let target = Rect2D::new(0, 0, 64, 64);
        let rect = Rect2D::new(-10, -10, 20, 20);
        assert_eq!(target.intersect(&rect), Some(Rect2D::new(0, 0, 10, 10)));
    }
}
