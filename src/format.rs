// Pixel format classification
//
// Decides, per incoming Vulkan format, which sampling path the render
// pipeline needs: plain sampler, YCbCr conversion sampler, or a compute
// conversion pass in front of the render pass.

use ash::vk;

use crate::image::ImageDescription;

/// Formats the demo source and config files can name.
const KNOWN_FORMATS: &[vk::Format] = &[
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::R8G8B8A8_SRGB,
    vk::Format::B8G8R8A8_UNORM,
    vk::Format::B8G8R8A8_SRGB,
    vk::Format::A2B10G10R10_UNORM_PACK32,
    vk::Format::R16G16B16A16_UNORM,
    vk::Format::R16G16B16A16_SFLOAT,
    vk::Format::G8B8G8R8_422_UNORM,
    vk::Format::B8G8R8G8_422_UNORM,
    vk::Format::G8_B8R8_2PLANE_420_UNORM,
    vk::Format::G8_B8_R8_3PLANE_420_UNORM,
    vk::Format::G16B16G16R16_422_UNORM,
];

/// Chroma-subsampled formats that need a sampler YCbCr conversion.
pub fn is_ycbcr_format(format: vk::Format) -> bool {
    let first = vk::Format::G8B8G8R8_422_UNORM.as_raw();
    let last = vk::Format::G16_B16_R16_3PLANE_444_UNORM.as_raw();
    (first..=last).contains(&format.as_raw())
}

/// Multi-planar formats keep their planes in separate memory ranges.
pub fn is_multi_planar(format: vk::Format) -> bool {
    is_ycbcr_format(format)
        && !matches!(
            format,
            vk::Format::G8B8G8R8_422_UNORM
                | vk::Format::B8G8R8G8_422_UNORM
                | vk::Format::G16B16G16R16_422_UNORM
                | vk::Format::B16G16R16G16_422_UNORM
                | vk::Format::R10X6G10X6B10X6A10X6_UNORM_4PACK16
                | vk::Format::G10X6B10X6G10X6R10X6_422_UNORM_4PACK16
                | vk::Format::B10X6G10X6R10X6G10X6_422_UNORM_4PACK16
                | vk::Format::R12X4G12X4B12X4A12X4_UNORM_4PACK16
                | vk::Format::G12X4B12X4G12X4R12X4_422_UNORM_4PACK16
                | vk::Format::B12X4G12X4R12X4G12X4_422_UNORM_4PACK16
                | vk::Format::R10X6_UNORM_PACK16
                | vk::Format::R10X6G10X6_UNORM_2PACK16
                | vk::Format::R12X4_UNORM_PACK16
                | vk::Format::R12X4G12X4_UNORM_2PACK16
        )
}

/// A linear-tiled image that can be read but not filtered goes through the
/// compute pass first, which copies it into a filterable optimal-tiled image.
pub fn needs_conversion_pass(format: vk::Format, linear_features: vk::FormatFeatureFlags) -> bool {
    !is_ycbcr_format(format)
        && linear_features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE)
        && !linear_features.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
}

/// Bytes in one tightly packed row, for single-plane formats with a known
/// texel block. `None` means the caller has to supply pitched data itself.
pub fn packed_row_bytes(format: vk::Format, width: u32) -> Option<usize> {
    let width = width as usize;
    let bytes = match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::A2R10G10B10_UNORM_PACK32 => width * 4,
        vk::Format::R16G16B16A16_UNORM | vk::Format::R16G16B16A16_SFLOAT => width * 8,
        // 2x1 texel blocks
        vk::Format::G8B8G8R8_422_UNORM | vk::Format::B8G8R8G8_422_UNORM => width.div_ceil(2) * 4,
        vk::Format::G16B16G16R16_422_UNORM | vk::Format::B16G16R16G16_422_UNORM => {
            width.div_ceil(2) * 8
        }
        _ => return None,
    };
    Some(bytes)
}

/// Whether `description` fits the device's image extent limit for its format.
pub fn fits_extent(description: ImageDescription, max: vk::Extent3D) -> bool {
    description.width <= max.width && description.height <= max.height
}

/// Parse a Vulkan format name such as `"R8G8B8A8_UNORM"` (case-insensitive).
pub fn parse_format(name: &str) -> Option<vk::Format> {
    let name = name.trim();
    KNOWN_FORMATS
        .iter()
        .copied()
        .find(|format| format!("{format:?}").eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ycbcr_range_bounds() {
        assert!(is_ycbcr_format(vk::Format::G8B8G8R8_422_UNORM));
        assert!(is_ycbcr_format(vk::Format::G8_B8R8_2PLANE_420_UNORM));
        assert!(is_ycbcr_format(vk::Format::G16_B16_R16_3PLANE_444_UNORM));
        assert!(!is_ycbcr_format(vk::Format::R8G8B8A8_UNORM));
        assert!(!is_ycbcr_format(vk::Format::B8G8R8A8_SRGB));
        assert!(!is_ycbcr_format(vk::Format::UNDEFINED));
    }

    #[test]
    fn multi_planar_only_for_planar_layouts() {
        assert!(is_multi_planar(vk::Format::G8_B8R8_2PLANE_420_UNORM));
        assert!(is_multi_planar(vk::Format::G8_B8_R8_3PLANE_420_UNORM));
        assert!(!is_multi_planar(vk::Format::G8B8G8R8_422_UNORM));
        assert!(!is_multi_planar(vk::Format::R8G8B8A8_UNORM));
    }

    #[test]
    fn conversion_pass_for_unfilterable_linear_images() {
        let sampled_only = vk::FormatFeatureFlags::SAMPLED_IMAGE;
        let filterable =
            vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR;

        assert!(needs_conversion_pass(vk::Format::R16G16B16A16_UNORM, sampled_only));
        assert!(!needs_conversion_pass(vk::Format::R8G8B8A8_UNORM, filterable));
        // Not sampleable at all: nothing the compute pass could read either.
        assert!(!needs_conversion_pass(vk::Format::R8G8B8A8_UNORM, vk::FormatFeatureFlags::empty()));
        // YCbCr goes through the conversion sampler instead.
        assert!(!needs_conversion_pass(vk::Format::G8B8G8R8_422_UNORM, sampled_only));
    }

    #[test]
    fn packed_rows() {
        assert_eq!(packed_row_bytes(vk::Format::R8G8B8A8_UNORM, 640), Some(2560));
        assert_eq!(packed_row_bytes(vk::Format::G8B8G8R8_422_UNORM, 641), Some(1284));
        assert_eq!(packed_row_bytes(vk::Format::R16G16B16A16_SFLOAT, 2), Some(16));
        assert_eq!(packed_row_bytes(vk::Format::G8_B8R8_2PLANE_420_UNORM, 640), None);
    }

    #[test]
    fn extent_limit_is_inclusive() {
        let max = vk::Extent3D { width: 4096, height: 2160, depth: 1 };
        let at = |width, height| fits_extent(ImageDescription::new(width, height, vk::Format::R8G8B8A8_UNORM), max);

        assert!(at(4095, 2160));
        assert!(at(4096, 2160));
        assert!(!at(4097, 2160));

        assert!(at(4096, 2159));
        assert!(!at(4096, 2161));
        assert!(!at(4097, 2161));
    }

    #[test]
    fn format_names_round_trip_case_insensitively() {
        assert_eq!(parse_format("R8G8B8A8_UNORM"), Some(vk::Format::R8G8B8A8_UNORM));
        assert_eq!(parse_format(" g8b8g8r8_422_unorm "), Some(vk::Format::G8B8G8R8_422_UNORM));
        assert_eq!(parse_format("NV12"), None);
    }
}
