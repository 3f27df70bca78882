//! Image annotation functionality for drawing detections.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use darknet_core::DetectionCandidate;
use image::Rgba;
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

/// Fixed palette cycled by class id.
const PALETTE: [[u8; 3]; 6] = [
    [255, 0, 0],
    [0, 200, 0],
    [0, 96, 255],
    [255, 180, 0],
    [200, 0, 200],
    [0, 200, 200],
];

/// Draw detections on an image and save it to a directory.
pub fn annotate_image(
    image_path: &Path,
    detections: &[DetectionCandidate],
    output_dir: &Path,
) -> Result<PathBuf> {
    let mut image = image::open(image_path)
        .with_context(|| format!("failed to open image {}", image_path.display()))?
        .to_rgba8();
    let (img_w, img_h) = image.dimensions();

    if img_w == 0 || img_h == 0 {
        anyhow::bail!(
            "cannot annotate image with zero dimensions: {}",
            image_path.display()
        );
    }

    for detection in detections {
        let [r, g, b] = PALETTE[detection.class_id % PALETTE.len()];
        let rect = rect_from_candidate(detection, img_w, img_h);
        draw_hollow_rect_mut(&mut image, rect, Rgba([r, g, b, 255]));
    }

    let file_name = image_path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("frame.png"));
    let output_path = output_dir.join(file_name);

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    image
        .save(&output_path)
        .with_context(|| format!("failed to save annotated image {}", output_path.display()))?;

    Ok(output_path)
}

fn rect_from_candidate(candidate: &DetectionCandidate, img_w: u32, img_h: u32) -> Rect {
    let max_x = (img_w - 1) as f32;
    let max_y = (img_h - 1) as f32;

    let x1 = candidate.left.clamp(0.0, max_x);
    let y1 = candidate.top.clamp(0.0, max_y);
    let x2 = (candidate.left + candidate.width).clamp(0.0, max_x);
    let y2 = (candidate.top + candidate.height).clamp(0.0, max_y);

    let width = (x2 - x1).max(1.0).round() as u32;
    let height = (y2 - y1).max(1.0).round() as u32;

    Rect::at(x1.round() as i32, y1.round() as i32).of_size(width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_is_clamped_to_the_image() {
        let candidate = DetectionCandidate {
            left: 90.0,
            top: -5.0,
            width: 40.0,
            height: 20.0,
            class_id: 0,
            confidence: 0.9,
        };
        let rect = rect_from_candidate(&candidate, 100, 50);
        assert_eq!((rect.left(), rect.top()), (90, 0));
        assert_eq!((rect.width(), rect.height()), (9, 15));
    }
}
