use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, RgbImage, imageops, imageops::FilterType};
use ndarray::Array3;

/// Load an image from disk into memory.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
    let path_ref = path.as_ref();
    image::open(path_ref).with_context(|| format!("failed to open image {}", path_ref.display()))
}

/// Stretch an image to exactly `width` x `height`.
pub fn resize_image(image: &DynamicImage, width: u32, height: u32, filter: FilterType) -> RgbImage {
    image.resize_exact(width, height, filter).to_rgb8()
}

/// Scale so the image covers the target on both axes, then crop the centre.
///
/// Images already at the target size are returned unchanged.
pub fn resize_center_crop(image: &RgbImage, width: u32, height: u32, filter: FilterType) -> RgbImage {
    let (src_w, src_h) = image.dimensions();
    if (src_w, src_h) == (width, height) {
        return image.clone();
    }
    let factor = (width as f32 / src_w as f32).max(height as f32 / src_h as f32);
    let scaled_w = ((src_w as f32 * factor).round() as u32).max(width);
    let scaled_h = ((src_h as f32 * factor).round() as u32).max(height);
    let scaled = imageops::resize(image, scaled_w, scaled_h, filter);
    let x = (scaled_w - width) / 2;
    let y = (scaled_h - height) / 2;
    imageops::crop_imm(&scaled, x, y, width, height).to_image()
}

/// Placement of a letterboxed image inside the network input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Source pixels to network pixels.
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    /// Map a point in network coordinates back onto the source image.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Aspect-preserving resize onto a black `width` x `height` canvas with symmetric padding.
pub fn letterbox_image(
    image: &RgbImage,
    width: u32,
    height: u32,
    filter: FilterType,
) -> (RgbImage, Letterbox) {
    let (src_w, src_h) = image.dimensions();
    let scale = (width as f32 / src_w as f32).min(height as f32 / src_h as f32);
    let scaled_w = ((src_w as f32 * scale).round() as u32).clamp(1, width);
    let scaled_h = ((src_h as f32 * scale).round() as u32).clamp(1, height);
    let scaled = imageops::resize(image, scaled_w, scaled_h, filter);

    let pad_x = (width - scaled_w) / 2;
    let pad_y = (height - scaled_h) / 2;
    let mut canvas = RgbImage::new(width, height);
    imageops::replace(&mut canvas, &scaled, pad_x as i64, pad_y as i64);
    (
        canvas,
        Letterbox {
            scale,
            pad_x,
            pad_y,
        },
    )
}

/// Affine pixel normalization: `(value - offsets[c]) * scale_factor`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub scale_factor: f32,
    /// Per-channel offsets in RGB order.
    pub offsets: [f32; 3],
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            scale_factor: 1.0 / 255.0,
            offsets: [0.0; 3],
        }
    }
}

/// Convert an RGB image into a normalized planar `[3, H, W]` array in RGB order.
pub fn rgb_to_planar(image: &RgbImage, norm: &Normalization) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut array = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        let (xi, yi) = (x as usize, y as usize);
        for c in 0..3 {
            array[(c, yi, xi)] = (pixel[c] as f32 - norm.offsets[c]) * norm.scale_factor;
        }
    }
    array
}

/// Single-channel variant of [`rgb_to_planar`] using the first offset.
pub fn luma_to_planar(image: &GrayImage, norm: &Normalization) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut array = Array3::<f32>::zeros((1, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        array[(0, y as usize, x as usize)] = (pixel[0] as f32 - norm.offsets[0]) * norm.scale_factor;
    }
    array
}

/// Scale factors that reproject stretched network coordinates onto the original image.
pub fn compute_resize_scales(original: (u32, u32), target: (u32, u32)) -> Result<(f32, f32)> {
    let (orig_w, orig_h) = original;
    let (target_w, target_h) = target;
    anyhow::ensure!(
        target_w > 0 && target_h > 0,
        "target dimensions must be non-zero"
    );
    anyhow::ensure!(
        orig_w > 0 && orig_h > 0,
        "original dimensions must be non-zero"
    );
    Ok((
        orig_w as f32 / target_w as f32,
        orig_h as f32 / target_h as f32,
    ))
}
