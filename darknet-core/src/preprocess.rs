//! Preprocessing utilities for feeding images to a compiled network.
//!
//! Images are resized to the `[net]` input size, normalized and laid out as a
//! planar `[B, C, H, W]` batch. Every image also yields a [`CoordinateMap`] so
//! boxes in network pixels can be projected back onto the source image.

use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView, imageops::FilterType};
use log::Level;
use ndarray::{Array4, s};

use crate::config::NetParams;
use darknet_utils::{
    Normalization, letterbox_image, load_image, luma_to_planar, resize_center_crop, resize_image,
    rgb_to_planar, timing_guard,
};

/// Network input resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl InputSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for InputSize {
    fn default() -> Self {
        Self {
            width: 416,
            height: 416,
        }
    }
}

/// How a source image is fitted into the network input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
    /// Resize both axes independently.
    #[default]
    Stretch,
    /// Keep the aspect ratio and pad with black.
    Letterbox,
    /// Keep the aspect ratio, cover the input and crop the centre.
    CenterCrop,
}

/// Configuration for preprocessing an image before inference.
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    pub input_size: InputSize,
    /// 1 (grayscale) or 3 (RGB).
    pub channels: usize,
    pub normalization: Normalization,
    pub resize: ResizeMode,
    pub filter: FilterType,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            input_size: InputSize::default(),
            channels: 3,
            normalization: Normalization::default(),
            resize: ResizeMode::Stretch,
            filter: FilterType::Triangle,
        }
    }
}

impl PreprocessConfig {
    /// Input geometry taken from the `[net]` block; `letter_box=1` selects letterboxing.
    pub fn from_net(net: &NetParams) -> Self {
        Self {
            input_size: InputSize::new(net.width as u32, net.height as u32),
            channels: net.channels,
            resize: if net.letterbox {
                ResizeMode::Letterbox
            } else {
                ResizeMode::Stretch
            },
            ..Self::default()
        }
    }
}

/// Affine map from network pixels to source pixels: `src = net * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateMap {
    pub scale_x: f32,
    pub scale_y: f32,
    pub offset_x: f32,
    pub offset_y: f32,
    /// Source image dimensions.
    pub original_size: (u32, u32),
}

impl CoordinateMap {
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            x * self.scale_x + self.offset_x,
            y * self.scale_y + self.offset_y,
        )
    }
}

/// Output of preprocessing: the batch tensor plus one map per image.
#[derive(Debug, Clone)]
pub struct PreprocessOutput {
    pub tensor: Array4<f32>,
    pub maps: Vec<CoordinateMap>,
}

/// Preprocess a single image file into a `[1, C, H, W]` tensor.
pub fn preprocess_image<P: AsRef<Path>>(
    path: P,
    config: &PreprocessConfig,
) -> Result<PreprocessOutput> {
    let path = path.as_ref();
    let image = load_image(path)
        .with_context(|| format!("failed to load image from {}", path.display()))?;
    preprocess_batch(std::slice::from_ref(&image), 1, config)
}

/// Preprocess an in-memory image into a `[1, C, H, W]` tensor.
pub fn preprocess_dynamic_image(
    image: &DynamicImage,
    config: &PreprocessConfig,
) -> Result<PreprocessOutput> {
    preprocess_batch(std::slice::from_ref(image), 1, config)
}

/// Preprocess up to `batch` images; unused batch slots stay zero.
pub fn preprocess_batch(
    images: &[DynamicImage],
    batch: usize,
    config: &PreprocessConfig,
) -> Result<PreprocessOutput> {
    let _guard = timing_guard("darknet_core::preprocess", Level::Debug);
    anyhow::ensure!(
        !images.is_empty() && images.len() <= batch,
        "expected between 1 and {batch} images, got {}",
        images.len()
    );
    anyhow::ensure!(
        matches!(config.channels, 1 | 3),
        "unsupported input channel count {}",
        config.channels
    );
    let InputSize { width, height } = config.input_size;
    anyhow::ensure!(width > 0 && height > 0, "input size must be non-zero");

    let mut tensor = Array4::<f32>::zeros((
        batch,
        config.channels,
        height as usize,
        width as usize,
    ));
    let mut maps = Vec::with_capacity(images.len());
    for (slot, image) in images.iter().enumerate() {
        let (planar, map) = prepare_one(image, config)?;
        tensor.slice_mut(s![slot, .., .., ..]).assign(&planar);
        maps.push(map);
    }
    Ok(PreprocessOutput { tensor, maps })
}

fn prepare_one(
    image: &DynamicImage,
    config: &PreprocessConfig,
) -> Result<(ndarray::Array3<f32>, CoordinateMap)> {
    let (src_w, src_h) = image.dimensions();
    anyhow::ensure!(src_w > 0 && src_h > 0, "image has zero size");
    let InputSize { width, height } = config.input_size;
    let (tw, th) = (width as f32, height as f32);
    let (sw, sh) = (src_w as f32, src_h as f32);

    let (resized, map) = match config.resize {
        ResizeMode::Stretch => (
            resize_image(image, width, height, config.filter),
            CoordinateMap {
                scale_x: sw / tw,
                scale_y: sh / th,
                offset_x: 0.0,
                offset_y: 0.0,
                original_size: (src_w, src_h),
            },
        ),
        ResizeMode::Letterbox => {
            let (canvas, placement) = letterbox_image(&image.to_rgb8(), width, height, config.filter);
            let inv = 1.0 / placement.scale;
            (
                canvas,
                CoordinateMap {
                    scale_x: inv,
                    scale_y: inv,
                    offset_x: -(placement.pad_x as f32) * inv,
                    offset_y: -(placement.pad_y as f32) * inv,
                    original_size: (src_w, src_h),
                },
            )
        }
        ResizeMode::CenterCrop => {
            let factor = (tw / sw).max(th / sh);
            let scaled_w = ((sw * factor).round() as u32).max(width);
            let scaled_h = ((sh * factor).round() as u32).max(height);
            let scale_x = sw / scaled_w as f32;
            let scale_y = sh / scaled_h as f32;
            (
                resize_center_crop(&image.to_rgb8(), width, height, config.filter),
                CoordinateMap {
                    scale_x,
                    scale_y,
                    offset_x: ((scaled_w - width) / 2) as f32 * scale_x,
                    offset_y: ((scaled_h - height) / 2) as f32 * scale_y,
                    original_size: (src_w, src_h),
                },
            )
        }
    };

    let planar = if config.channels == 1 {
        let gray = DynamicImage::ImageRgb8(resized).to_luma8();
        luma_to_planar(&gray, &config.normalization)
    } else {
        rgb_to_planar(&resized, &config.normalization)
    };
    Ok((planar, map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value, value, value])))
    }

    #[test]
    fn stretch_maps_back_with_axis_scales() {
        let config = PreprocessConfig {
            input_size: InputSize::new(32, 16),
            ..Default::default()
        };
        let out = preprocess_dynamic_image(&solid(64, 64, 255), &config).expect("preprocess");
        assert_eq!(out.tensor.shape(), &[1, 3, 16, 32]);
        assert!((out.tensor[[0, 1, 5, 5]] - 1.0).abs() < 1e-2);
        let (x, y) = out.maps[0].to_source(16.0, 8.0);
        assert!((x - 32.0).abs() < 1e-4 && (y - 32.0).abs() < 1e-4);
    }

    #[test]
    fn letterbox_offsets_account_for_padding() {
        let config = PreprocessConfig {
            input_size: InputSize::new(32, 32),
            resize: ResizeMode::Letterbox,
            ..Default::default()
        };
        let out = preprocess_dynamic_image(&solid(64, 32, 200), &config).expect("preprocess");
        let map = out.maps[0];
        // 64x32 -> 32x16 placed at y = 8
        let (x, y) = map.to_source(0.0, 8.0);
        assert!(x.abs() < 1e-4 && y.abs() < 1e-4);
        let (x, y) = map.to_source(32.0, 24.0);
        assert!((x - 64.0).abs() < 1e-4 && (y - 32.0).abs() < 1e-4);
        assert_eq!(out.tensor[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn center_crop_maps_into_cropped_window() {
        let config = PreprocessConfig {
            input_size: InputSize::new(16, 16),
            resize: ResizeMode::CenterCrop,
            ..Default::default()
        };
        let out = preprocess_dynamic_image(&solid(64, 32, 10), &config).expect("preprocess");
        // 64x32 -> 32x16, crop x = 8
        let (x, y) = out.maps[0].to_source(0.0, 0.0);
        assert!((x - 16.0).abs() < 1e-4 && y.abs() < 1e-4);
    }

    #[test]
    fn batch_pads_unused_slots_and_supports_grayscale() {
        let config = PreprocessConfig {
            input_size: InputSize::new(8, 8),
            channels: 1,
            ..Default::default()
        };
        let out = preprocess_batch(&[solid(8, 8, 255)], 2, &config).expect("preprocess");
        assert_eq!(out.tensor.shape(), &[2, 1, 8, 8]);
        assert!((out.tensor[[0, 0, 3, 3]] - 1.0).abs() < 1e-2);
        assert_eq!(out.tensor[[1, 0, 3, 3]], 0.0);
        assert!(preprocess_batch(&[], 2, &config).is_err());
    }
}
