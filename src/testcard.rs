// Moving colour-bar test pattern for the demo producer
//
// Packed formats only: the producer writes through one row pitch, which
// multi-planar layouts do not have.

use anyhow::{bail, Result};
use ash::vk;
use video_presenter::format::packed_row_bytes;
use video_presenter::{ImageDescription, PixelsMut};

/// 75% colour bars: white, yellow, cyan, green, magenta, red, blue, black.
const BARS: [[f32; 3]; 8] = [
    [0.75, 0.75, 0.75],
    [0.75, 0.75, 0.0],
    [0.0, 0.75, 0.75],
    [0.0, 0.75, 0.0],
    [0.75, 0.0, 0.75],
    [0.75, 0.0, 0.0],
    [0.0, 0.0, 0.75],
    [0.0, 0.0, 0.0],
];

/// Pixels the pattern moves per frame.
const SCROLL_STEP: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Rgba,
    Bgra,
    /// G8B8G8R8_422: Y0 Cb Y1 Cr
    Yuyv,
    /// B8G8R8G8_422: Cb Y0 Cr Y1
    Uyvy,
}

pub struct TestCard {
    description: ImageDescription,
    layout: Layout,
    frame: u32,
}

impl TestCard {
    pub fn new(description: ImageDescription) -> Result<Self> {
        let layout = match description.format {
            vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => Layout::Rgba,
            vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => Layout::Bgra,
            vk::Format::G8B8G8R8_422_UNORM => Layout::Yuyv,
            vk::Format::B8G8R8G8_422_UNORM => Layout::Uyvy,
            other => bail!("Test pattern cannot be generated in {:?}", other),
        };
        Ok(Self {
            description,
            layout,
            frame: 0,
        })
    }

    /// Draw the next frame into `pixels`, laid out with `row_pitch`.
    pub fn render(&mut self, pixels: &mut [u8], row_pitch: usize) {
        let width = self.description.width;
        let offset = self.frame.wrapping_mul(SCROLL_STEP);
        let Some(row_bytes) = packed_row_bytes(self.description.format, width) else {
            return;
        };

        // Every row is identical; draw one and copy it down.
        let mut row = vec![0u8; row_bytes];
        match self.layout {
            Layout::Rgba | Layout::Bgra => {
                for (x, texel) in row.chunks_exact_mut(4).enumerate() {
                    let [r, g, b] = to_bytes(bar_color(x as u32, width, offset));
                    let rgba = if self.layout == Layout::Rgba { [r, g, b, 255] } else { [b, g, r, 255] };
                    texel.copy_from_slice(&rgba);
                }
            }
            Layout::Yuyv | Layout::Uyvy => {
                for (pair, block) in row.chunks_exact_mut(4).enumerate() {
                    let x = pair as u32 * 2;
                    let left = rgb_to_ycbcr(bar_color(x, width, offset));
                    let right = rgb_to_ycbcr(bar_color(x + 1, width, offset));
                    let cb = ((left[1] as u16 + right[1] as u16 + 1) / 2) as u8;
                    let cr = ((left[2] as u16 + right[2] as u16 + 1) / 2) as u8;
                    let bytes = if self.layout == Layout::Yuyv {
                        [left[0], cb, right[0], cr]
                    } else {
                        [cb, left[0], cr, right[0]]
                    };
                    block.copy_from_slice(&bytes);
                }
            }
        }

        for line in pixels.chunks_mut(row_pitch).take(self.description.height as usize) {
            let len = row_bytes.min(line.len());
            line[..len].copy_from_slice(&row[..len]);
        }
        self.frame = self.frame.wrapping_add(1);
    }
}

/// Line-blend deinterlace: each line becomes the average of itself and the next.
pub fn deinterlace(pixels: &mut PixelsMut<'_>) {
    let description = pixels.description;
    let row_pitch = pixels.row_pitch;
    let row_bytes = packed_row_bytes(description.format, description.width).unwrap_or(row_pitch);
    let height = description.height as usize;
    if row_pitch == 0 || height < 2 {
        return;
    }

    for y in 0..height - 1 {
        let (upper, lower) = pixels.data.split_at_mut((y + 1) * row_pitch);
        let current = &mut upper[y * row_pitch..y * row_pitch + row_bytes];
        for (a, &b) in current.iter_mut().zip(&lower[..row_bytes]) {
            *a = ((*a as u16 + b as u16 + 1) / 2) as u8;
        }
    }
}

fn bar_color(x: u32, width: u32, offset: u32) -> [f32; 3] {
    let bar_width = (width / BARS.len() as u32).max(1);
    let position = x.wrapping_add(offset) % (bar_width * BARS.len() as u32);
    BARS[(position / bar_width) as usize % BARS.len()]
}

fn to_bytes(rgb: [f32; 3]) -> [u8; 3] {
    rgb.map(|c| (c * 255.0).round() as u8)
}

/// BT.709, narrow range.
fn rgb_to_ycbcr([r, g, b]: [f32; 3]) -> [u8; 3] {
    let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
    let cb = (b - y) / 1.8556;
    let cr = (r - y) / 1.5748;
    [
        (16.0 + 219.0 * y).round() as u8,
        (128.0 + 224.0 * cb).round() as u8,
        (128.0 + 224.0 * cr).round() as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ycbcr_of_grey_is_neutral() {
        assert_eq!(rgb_to_ycbcr([0.0, 0.0, 0.0]), [16, 128, 128]);
        assert_eq!(rgb_to_ycbcr([1.0, 1.0, 1.0]), [235, 128, 128]);
    }

    #[test]
    fn first_bar_is_white_then_yellow() {
        let description = ImageDescription::new(16, 2, vk::Format::R8G8B8A8_UNORM);
        let mut card = TestCard::new(description).unwrap();
        let mut pixels = vec![0u8; 16 * 4 * 2];
        card.render(&mut pixels, 16 * 4);

        assert_eq!(&pixels[..4], &[191, 191, 191, 255]);
        assert_eq!(&pixels[8..12], &[191, 191, 0, 255]);
        // Second row matches the first.
        assert_eq!(&pixels[64..68], &pixels[..4]);
    }

    #[test]
    fn bgra_swaps_red_and_blue() {
        let description = ImageDescription::new(16, 1, vk::Format::B8G8R8A8_UNORM);
        let mut card = TestCard::new(description).unwrap();
        let mut pixels = vec![0u8; 64];
        card.render(&mut pixels, 64);
        // Yellow bar: no blue, so the first byte is zero.
        assert_eq!(&pixels[8..12], &[0, 191, 191, 255]);
    }

    #[test]
    fn pattern_scrolls_between_frames() {
        let description = ImageDescription::new(64, 1, vk::Format::R8G8B8A8_UNORM);
        let mut card = TestCard::new(description).unwrap();
        let mut first = vec![0u8; 256];
        let mut second = vec![0u8; 256];
        card.render(&mut first, 256);
        card.render(&mut second, 256);
        assert_ne!(first, second);
        assert_eq!(&second[..4 * 4], &first[4 * 4..8 * 4]);
    }

    #[test]
    fn rows_respect_pitch() {
        let description = ImageDescription::new(2, 2, vk::Format::G8B8G8R8_422_UNORM);
        let mut card = TestCard::new(description).unwrap();
        let mut pixels = vec![0xEEu8; 32];
        card.render(&mut pixels, 16);

        assert_eq!(pixels[4], 0xEE);
        assert_eq!(&pixels[16..20], &pixels[..4]);
    }

    #[test]
    fn planar_formats_are_refused() {
        let description = ImageDescription::new(64, 64, vk::Format::G8_B8R8_2PLANE_420_UNORM);
        assert!(TestCard::new(description).is_err());
    }

    #[test]
    fn deinterlace_blends_adjacent_lines() {
        let description = ImageDescription::new(1, 3, vk::Format::R8G8B8A8_UNORM);
        let mut data = vec![
            0, 0, 0, 0, 9, 9, //
            100, 100, 100, 100, 9, 9, //
            200, 200, 200, 200, 9, 9,
        ];
        let mut pixels = PixelsMut {
            data: &mut data,
            row_pitch: 6,
            description,
        };
        deinterlace(&mut pixels);

        assert_eq!(&data[..4], &[50, 50, 50, 50]);
        assert_eq!(&data[6..10], &[150, 150, 150, 150]);
        assert_eq!(&data[12..16], &[200, 200, 200, 200]);
        // Padding is left alone.
        assert_eq!(&data[4..6], &[9, 9]);
    }
}
