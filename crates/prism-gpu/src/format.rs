//! Pixel format helpers shared by the copy paths, layout tracking, and
//! mipmap generation.

use ash::vk;

/// Check whether a format has a depth component.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Check whether a format carries a stencil component.
pub fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Check whether a format is depth and/or stencil.
pub fn is_depth_stencil_format(format: vk::Format) -> bool {
    is_depth_format(format) || has_stencil(format)
}

/// Derive the aspect mask for barriers and copies.
///
/// Depth-stencil formats report `DEPTH | STENCIL` when the format carries
/// stencil, plain `DEPTH` otherwise; everything else is `COLOR`.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_stencil_format(format) {
        if has_stencil(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Check whether a format is block-compressed.
pub fn is_compressed(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::BC1_RGB_UNORM_BLOCK
            | vk::Format::BC1_RGB_SRGB_BLOCK
            | vk::Format::BC1_RGBA_UNORM_BLOCK
            | vk::Format::BC1_RGBA_SRGB_BLOCK
            | vk::Format::BC2_UNORM_BLOCK
            | vk::Format::BC2_SRGB_BLOCK
            | vk::Format::BC3_UNORM_BLOCK
            | vk::Format::BC3_SRGB_BLOCK
    )
}

/// Block edge length in texels: 4 for compressed formats, 1 otherwise.
pub fn block_dimension(format: vk::Format) -> u32 {
    if is_compressed(format) {
        4
    } else {
        1
    }
}

/// Size in bytes of one block (compressed) or one texel (uncompressed).
pub fn block_size_bytes(format: vk::Format) -> u32 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::D32_SFLOAT_S8_UINT
        | vk::Format::BC1_RGB_UNORM_BLOCK
        | vk::Format::BC1_RGB_SRGB_BLOCK
        | vk::Format::BC1_RGBA_UNORM_BLOCK
        | vk::Format::BC1_RGBA_SRGB_BLOCK => 8,
        vk::Format::R32G32B32A32_SFLOAT
        | vk::Format::BC2_UNORM_BLOCK
        | vk::Format::BC2_SRGB_BLOCK
        | vk::Format::BC3_UNORM_BLOCK
        | vk::Format::BC3_SRGB_BLOCK => 16,
        // Unknown formats are treated as 4-byte texels
        _ => 4,
    }
}

/// Dimension of a mip level, clamped to 1.
pub fn mip_dimension(base: u32, level: u32) -> u32 {
    (base >> level).max(1)
}

/// Extent of a mip level, clamped to 1 per axis.
pub fn mip_extent(base: vk::Extent3D, level: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: mip_dimension(base.width, level),
        height: mip_dimension(base.height, level),
        depth: mip_dimension(base.depth, level),
    }
}

/// Round `value` up to a multiple of `granularity`.
///
/// `granularity` must be a power of two.
pub fn align_up(value: u64, granularity: u64) -> u64 {
    debug_assert!(granularity.is_power_of_two());
    (value + granularity - 1) & !(granularity - 1)
}

/// Number of blocks covering `dimension` texels.
pub fn blocks_covering(dimension: u32, format: vk::Format) -> u32 {
    let block = block_dimension(format);
    dimension.div_ceil(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_report_depth_aspect() {
        assert_eq!(
            aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn compressed_block_math() {
        assert_eq!(block_dimension(vk::Format::BC1_RGBA_UNORM_BLOCK), 4);
        assert_eq!(block_dimension(vk::Format::R8G8B8A8_UNORM), 1);
        assert_eq!(block_size_bytes(vk::Format::BC1_RGBA_UNORM_BLOCK), 8);
        assert_eq!(block_size_bytes(vk::Format::BC3_UNORM_BLOCK), 16);
        // 10 texels of a 4x4 block format need 3 blocks
        assert_eq!(blocks_covering(10, vk::Format::BC3_UNORM_BLOCK), 3);
        assert_eq!(blocks_covering(10, vk::Format::R8G8B8A8_UNORM), 10);
    }

    #[test]
    fn mip_dimensions_clamp_to_one() {
        assert_eq!(mip_dimension(8, 0), 8);
        assert_eq!(mip_dimension(8, 1), 4);
        assert_eq!(mip_dimension(8, 3), 1);
        assert_eq!(mip_dimension(8, 7), 1);
    }

    #[test]
    fn align_up_rounds_to_granularity() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }
}
