//! Optional touch-ups and companion artifacts for colorized output.

use image::{
    DynamicImage, Rgb, RgbImage,
    imageops::{self, FilterType},
};

const CONTRAST_GAIN: f32 = 1.2;
const BRIGHTNESS_OFFSET: f32 = 0.1 * 255.0;
const SHARPEN_KERNEL: [[f32; 3]; 3] = [[-1.0, -1.0, -1.0], [-1.0, 9.0, -1.0], [-1.0, -1.0, -1.0]];

/// Longest side of the original image in a comparison sheet.
pub const COMPARISON_MAX_SIDE: u32 = 512;

/// Linear contrast stretch (`1.2 * v + 0.1 * 255`) followed by a 3x3
/// sharpening pass. Borders sample the nearest edge pixel.
pub fn enhance(image: &RgbImage) -> RgbImage {
    let mut stretched = image.clone();
    for pixel in stretched.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = (f32::from(*channel) * CONTRAST_GAIN + BRIGHTNESS_OFFSET).clamp(0.0, 255.0)
                as u8;
        }
    }
    sharpen(&stretched)
}

fn sharpen(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let mut acc = [0.0f32; 3];
        for (dy, row) in SHARPEN_KERNEL.iter().enumerate() {
            for (dx, weight) in row.iter().enumerate() {
                let sx = (x + dx as u32).saturating_sub(1).min(width - 1);
                let sy = (y + dy as u32).saturating_sub(1).min(height - 1);
                let sample = image.get_pixel(sx, sy).0;
                for (sum, value) in acc.iter_mut().zip(sample) {
                    *sum += weight * f32::from(value);
                }
            }
        }
        Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
    })
}

/// Downscale so the longer side is at most `max_side`, keeping the aspect
/// ratio. Smaller images are returned unchanged.
pub fn fit_within(image: &RgbImage, max_side: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if longest <= max_side {
        return image.clone();
    }
    let scale = f64::from(max_side) / f64::from(longest);
    let new_width = ((f64::from(width) * scale) as u32).max(1);
    let new_height = ((f64::from(height) * scale) as u32).max(1);
    imageops::resize(image, new_width, new_height, FilterType::Triangle)
}

/// Original on the left, colorized result stretched to the same size on
/// the right.
pub fn side_by_side(original: &DynamicImage, colorized: &RgbImage) -> RgbImage {
    let left = fit_within(&original.to_rgb8(), COMPARISON_MAX_SIDE);
    let (width, height) = left.dimensions();
    let right = imageops::resize(colorized, width, height, FilterType::Triangle);

    let mut sheet = RgbImage::new(width * 2, height);
    imageops::replace(&mut sheet, &left, 0, 0);
    imageops::replace(&mut sheet, &right, i64::from(width), 0);
    sheet
}
