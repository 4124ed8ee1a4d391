// Error types for the presentation core
//
// Capability errors and fatal presentation failures get their own variants so
// drivers can tell "skip this format" apart from "stop the render loop".
// Everything coming out of the Vulkan backend arrives as `Backend`.

use ash::vk;
use thiserror::Error;

use crate::image::ImageDescription;

pub type Result<T, E = DisplayError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("invalid image description {0}")]
    InvalidDescription(ImageDescription),

    #[error("pixel format {format:?} is not supported: {reason}")]
    UnsupportedFormat { format: vk::Format, reason: String },

    #[error("frame of {actual} bytes does not match image {description} (expected {expected} bytes)")]
    FrameSize {
        description: ImageDescription,
        expected: usize,
        actual: usize,
    },

    #[error("swapchain image could not be acquired after {attempts} recreation attempts")]
    SwapchainUnavailable { attempts: u32 },

    #[error("presenting swapchain image failed: {0}")]
    Present(vk::Result),

    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl DisplayError {
    /// Capability errors leave the pipeline usable; callers may pick another format.
    pub fn is_capability_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidDescription(_) | Self::UnsupportedFormat { .. } | Self::FrameSize { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_names_the_format() {
        let err = DisplayError::UnsupportedFormat {
            format: vk::Format::G8_B8R8_2PLANE_420_UNORM,
            reason: "requires Vulkan 1.1".into(),
        };
        let text = err.to_string();
        assert!(text.contains("G8_B8R8_2PLANE_420_UNORM"), "{text}");
        assert!(text.contains("Vulkan 1.1"));
        assert!(err.is_capability_error());
    }

    #[test]
    fn fatal_errors_are_not_capability_errors() {
        assert!(!DisplayError::SwapchainUnavailable { attempts: 3 }.is_capability_error());
        assert!(!DisplayError::Present(vk::Result::ERROR_DEVICE_LOST).is_capability_error());
    }
}
