// Aspect-correct placement of the video inside the window

use ash::vk;
use bytemuck::{Pod, Zeroable};

/// Sub-rectangle of the window the image is drawn into.
///
/// `repr(C)` because it is pushed verbatim to the fragment shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct RenderArea {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl RenderArea {
    /// Fit `image` into `window` keeping its aspect ratio, centred.
    pub fn fit(window: vk::Extent2D, image: vk::Extent2D) -> Self {
        if window.width == 0 || window.height == 0 || image.width == 0 || image.height == 0 {
            return Self::default();
        }

        let window_aspect = window.width as f64 / window.height as f64;
        let image_aspect = image.width as f64 / image.height as f64;

        if window_aspect > image_aspect {
            // Pillarbox
            let width = ((window.height as f64 * image_aspect).round() as u32).min(window.width);
            Self {
                x: (window.width - width) / 2,
                y: 0,
                width,
                height: window.height,
            }
        } else {
            // Letterbox
            let height = ((window.width as f64 / image_aspect).round() as u32).min(window.height);
            Self {
                x: 0,
                y: (window.height - height) / 2,
                width: window.width,
                height,
            }
        }
    }

    pub fn viewport(&self) -> vk::Viewport {
        vk::Viewport {
            x: self.x as f32,
            y: self.y as f32,
            width: self.width as f32,
            height: self.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub fn scissor(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: self.x as i32, y: self.y as i32 },
            extent: vk::Extent2D { width: self.width, height: self.height },
        }
    }

    /// Push-constant bytes, matching the fragment shader's `uvec4 area`.
    pub fn push_constants(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn four_by_three_into_sixteen_by_nine() {
        let area = RenderArea::fit(extent(1920, 1080), extent(640, 480));
        assert_eq!(area, RenderArea { x: 240, y: 0, width: 1440, height: 1080 });
    }

    #[test]
    fn wide_image_in_square_window_is_letterboxed() {
        let area = RenderArea::fit(extent(1000, 1000), extent(2000, 1000));
        assert_eq!(area, RenderArea { x: 0, y: 250, width: 1000, height: 500 });
    }

    #[test]
    fn matching_aspect_fills_window() {
        let area = RenderArea::fit(extent(1280, 720), extent(1920, 1080));
        assert_eq!(area, RenderArea { x: 0, y: 0, width: 1280, height: 720 });
    }

    #[test]
    fn degenerate_sizes_give_empty_area() {
        assert_eq!(RenderArea::fit(extent(0, 720), extent(640, 480)), RenderArea::default());
        assert_eq!(RenderArea::fit(extent(1280, 720), extent(0, 0)), RenderArea::default());
    }

    #[test]
    fn viewport_scissor_and_push_constants_agree() {
        let area = RenderArea { x: 240, y: 0, width: 1440, height: 1080 };
        assert_eq!(area.viewport().x, 240.0);
        assert_eq!(area.viewport().height, 1080.0);
        assert_eq!(area.scissor().offset.x, 240);
        assert_eq!(area.scissor().extent.width, 1440);

        let bytes = area.push_constants();
        assert_eq!(bytes.len(), 16);
        let words: &[u32] = bytemuck::cast_slice(bytes);
        assert_eq!(words, &[240, 0, 1440, 1080]);
    }
}
