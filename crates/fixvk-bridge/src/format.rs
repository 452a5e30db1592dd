//! Format tables and swap-surface selection policies.

use ash::vk;

use fixvk_protocol::descriptors::{SurfaceCapabilities, SurfaceFormat, Swizzle};
use fixvk_protocol::types::Extent2D;

use crate::error::{BridgeError, Result};
use crate::legacy::LegacyFormat;

/// Format of the depth image created alongside the swap surface.
pub const AUTO_DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// How a legacy surface format is represented on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub legacy: LegacyFormat,
    pub format: vk::Format,
    pub swizzle: Swizzle,
    pub aspect: vk::ImageAspectFlags,
    /// Bytes per texel block
    pub block_bytes: u32,
    /// Width and height of a texel block; 1 for uncompressed formats
    pub block_dim: u32,
}

impl FormatInfo {
    pub fn is_depth(&self) -> bool {
        self.aspect.contains(vk::ImageAspectFlags::DEPTH)
    }

    pub fn has_stencil(&self) -> bool {
        self.aspect.contains(vk::ImageAspectFlags::STENCIL)
    }

    /// Tightly packed byte size of one mip level.
    pub fn image_size(&self, extent: Extent2D) -> u64 {
        let blocks_wide = u64::from(extent.width.div_ceil(self.block_dim));
        let blocks_high = u64::from(extent.height.div_ceil(self.block_dim));
        blocks_wide * blocks_high * u64::from(self.block_bytes)
    }
}

const fn swizzle(
    r: vk::ComponentSwizzle,
    g: vk::ComponentSwizzle,
    b: vk::ComponentSwizzle,
    a: vk::ComponentSwizzle,
) -> Swizzle {
    Swizzle { r, g, b, a }
}

/// Map a legacy format onto a device format, or fail with `UnsupportedFormat`.
pub fn translate_format(legacy: LegacyFormat) -> Result<FormatInfo> {
    use vk::ComponentSwizzle as C;

    let color = vk::ImageAspectFlags::COLOR;
    let (format, swz, aspect, block_bytes, block_dim) = match legacy {
        LegacyFormat::A8R8G8B8 => (vk::Format::B8G8R8A8_UNORM, Swizzle::IDENTITY, color, 4, 1),
        LegacyFormat::X8R8G8B8 => (
            vk::Format::B8G8R8A8_UNORM,
            swizzle(C::IDENTITY, C::IDENTITY, C::IDENTITY, C::ONE),
            color,
            4,
            1,
        ),
        LegacyFormat::R5G6B5 => (vk::Format::R5G6B5_UNORM_PACK16, Swizzle::IDENTITY, color, 2, 1),
        LegacyFormat::A1R5G5B5 => (
            vk::Format::A1R5G5B5_UNORM_PACK16,
            Swizzle::IDENTITY,
            color,
            2,
            1,
        ),
        LegacyFormat::L8 => (
            vk::Format::R8_UNORM,
            swizzle(C::R, C::R, C::R, C::ONE),
            color,
            1,
            1,
        ),
        LegacyFormat::A8 => (
            vk::Format::R8_UNORM,
            swizzle(C::ZERO, C::ZERO, C::ZERO, C::R),
            color,
            1,
            1,
        ),
        LegacyFormat::A8L8 => (
            vk::Format::R8G8_UNORM,
            swizzle(C::R, C::R, C::R, C::G),
            color,
            2,
            1,
        ),
        LegacyFormat::Dxt1 => (vk::Format::BC1_RGBA_UNORM_BLOCK, Swizzle::IDENTITY, color, 8, 4),
        LegacyFormat::Dxt3 => (vk::Format::BC2_UNORM_BLOCK, Swizzle::IDENTITY, color, 16, 4),
        LegacyFormat::Dxt5 => (vk::Format::BC3_UNORM_BLOCK, Swizzle::IDENTITY, color, 16, 4),
        LegacyFormat::D16 => (
            vk::Format::D16_UNORM,
            Swizzle::IDENTITY,
            vk::ImageAspectFlags::DEPTH,
            2,
            1,
        ),
        LegacyFormat::D24S8 => (
            vk::Format::D24_UNORM_S8_UINT,
            Swizzle::IDENTITY,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            4,
            1,
        ),
        LegacyFormat::D24X8 => (
            vk::Format::X8_D24_UNORM_PACK32,
            Swizzle::IDENTITY,
            vk::ImageAspectFlags::DEPTH,
            4,
            1,
        ),
        LegacyFormat::D32 => (
            vk::Format::D32_SFLOAT,
            Swizzle::IDENTITY,
            vk::ImageAspectFlags::DEPTH,
            4,
            1,
        ),
        other => return Err(BridgeError::UnsupportedFormat(other)),
    };
    Ok(FormatInfo {
        legacy,
        format,
        swizzle: swz,
        aspect,
        block_bytes,
        block_dim,
    })
}

pub fn index_type(legacy: LegacyFormat) -> Result<vk::IndexType> {
    match legacy {
        LegacyFormat::Index16 => Ok(vk::IndexType::UINT16),
        LegacyFormat::Index32 => Ok(vk::IndexType::UINT32),
        other => Err(BridgeError::UnsupportedFormat(other)),
    }
}

pub fn index_size(index_type: vk::IndexType) -> u64 {
    if index_type == vk::IndexType::UINT32 {
        4
    } else {
        2
    }
}

fn is_preferred(format: &SurfaceFormat) -> bool {
    matches!(
        format.format,
        vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB
    ) && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
}

/// Prefer an sRGB 4x8-bit format, else whatever the surface lists first.
pub fn choose_surface_format(formats: &[SurfaceFormat]) -> Option<SurfaceFormat> {
    // A lone UNDEFINED entry means the surface accepts any format.
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(SurfaceFormat {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            });
        }
    }
    formats
        .iter()
        .find(|f| is_preferred(f))
        .or_else(|| formats.first())
        .copied()
}

/// FIFO under vsync, otherwise IMMEDIATE when the surface offers it.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(
    caps: &SurfaceCapabilities,
    requested: Extent2D,
    fullscreen: bool,
) -> Extent2D {
    if let Some(current) = caps.current_extent {
        return current;
    }
    if fullscreen {
        return caps.max_image_extent;
    }
    Extent2D::new(
        requested
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        requested
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    )
}

pub fn choose_image_count(caps: &SurfaceCapabilities) -> u32 {
    let wanted = caps.min_image_count.saturating_add(1);
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> SurfaceCapabilities {
        SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: None,
            min_image_extent: Extent2D::new(16, 16),
            max_image_extent: Extent2D::new(4096, 2160),
            formats: Vec::new(),
            present_modes: Vec::new(),
        }
    }

    fn surface_format(format: vk::Format) -> SurfaceFormat {
        SurfaceFormat {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn test_format_table() {
        let x8 = translate_format(LegacyFormat::X8R8G8B8).unwrap();
        assert_eq!(x8.format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(x8.swizzle.a, vk::ComponentSwizzle::ONE);

        let a8 = translate_format(LegacyFormat::A8).unwrap();
        assert_eq!(a8.format, vk::Format::R8_UNORM);
        assert_eq!(a8.swizzle.r, vk::ComponentSwizzle::ZERO);
        assert_eq!(a8.swizzle.a, vk::ComponentSwizzle::R);

        let d24s8 = translate_format(LegacyFormat::D24S8).unwrap();
        assert!(d24s8.is_depth());
        assert!(d24s8.has_stencil());
        assert_eq!(
            translate_format(LegacyFormat::Dxt5).unwrap().format,
            vk::Format::BC3_UNORM_BLOCK
        );
    }

    #[test]
    fn test_unsupported_formats() {
        for format in [
            LegacyFormat::R8G8B8,
            LegacyFormat::A4R4G4B4,
            LegacyFormat::P8,
            LegacyFormat::X1R5G5B5,
            LegacyFormat::Index16,
        ] {
            assert_eq!(
                translate_format(format),
                Err(BridgeError::UnsupportedFormat(format))
            );
        }
        assert_eq!(
            index_type(LegacyFormat::A8R8G8B8),
            Err(BridgeError::UnsupportedFormat(LegacyFormat::A8R8G8B8))
        );
        assert_eq!(index_type(LegacyFormat::Index32), Ok(vk::IndexType::UINT32));
    }

    #[test]
    fn test_block_compressed_sizes() {
        let dxt1 = translate_format(LegacyFormat::Dxt1).unwrap();
        assert_eq!(dxt1.image_size(Extent2D::new(64, 64)), 16 * 16 * 8);
        // Partial blocks round up.
        assert_eq!(dxt1.image_size(Extent2D::new(2, 2)), 8);
        let argb = translate_format(LegacyFormat::A8R8G8B8).unwrap();
        assert_eq!(argb.image_size(Extent2D::new(3, 5)), 60);
    }

    #[test]
    fn test_surface_format_prefers_srgb() {
        let formats = [
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::R8G8B8A8_SRGB),
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_SRGB)
        );
    }

    #[test]
    fn test_surface_format_fallback_is_first() {
        let formats = [
            surface_format(vk::Format::A2B10G10R10_UNORM_PACK32),
            surface_format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::A2B10G10R10_UNORM_PACK32)
        );
        assert_eq!(choose_surface_format(&[]), None);
        assert_eq!(
            choose_surface_format(&[surface_format(vk::Format::UNDEFINED)]).map(|f| f.format),
            Some(vk::Format::B8G8R8A8_SRGB)
        );
    }

    #[test]
    fn test_present_mode_policy() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
        ];
        assert_eq!(choose_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::IMMEDIATE);
        let fifo_only = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&fifo_only, false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_extent_policy() {
        let mut c = caps();
        assert_eq!(
            choose_extent(&c, Extent2D::new(1920, 1080), false),
            Extent2D::new(1920, 1080)
        );
        assert_eq!(
            choose_extent(&c, Extent2D::new(8000, 4), false),
            Extent2D::new(4096, 16)
        );
        assert_eq!(
            choose_extent(&c, Extent2D::new(640, 480), true),
            Extent2D::new(4096, 2160)
        );
        c.current_extent = Some(Extent2D::new(800, 600));
        assert_eq!(
            choose_extent(&c, Extent2D::new(1920, 1080), true),
            Extent2D::new(800, 600)
        );
    }

    #[test]
    fn test_image_count_policy() {
        let mut c = caps();
        assert_eq!(choose_image_count(&c), 3);
        c.min_image_count = 3;
        assert_eq!(choose_image_count(&c), 3);
        c.max_image_count = 0;
        assert_eq!(choose_image_count(&c), 4);
    }
}
