use std::path::Path;

use anyhow::Result;
use image::DynamicImage;
use log::Level;
use serde::Serialize;

use crate::{
    builder::OUTPUT_BLOB_NAMES,
    model::DarknetModel,
    postprocess::{ClassThresholds, DetectionCandidate, RawDetections, decode_detections},
    preprocess::{CoordinateMap, PreprocessConfig, PreprocessOutput, preprocess_batch},
};
use darknet_utils::{config::BoxFormat, load_image, timing_guard};

/// Detections for one image, in both network and source coordinates.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionOutput {
    /// Candidates in network pixels.
    pub candidates: Vec<DetectionCandidate>,
    /// The same candidates projected onto the source image.
    pub detections: Vec<DetectionCandidate>,
    pub original_size: (u32, u32),
}

/// Couples a compiled model with preprocessing and decoding settings.
#[derive(Debug, Clone)]
pub struct DarknetDetector {
    model: DarknetModel,
    preprocess: PreprocessConfig,
    thresholds: ClassThresholds,
    box_format: BoxFormat,
}

impl DarknetDetector {
    /// Preprocessing follows the `[net]` block unless overridden with [`Self::with_preprocess`].
    pub fn new(model: DarknetModel, thresholds: ClassThresholds, box_format: BoxFormat) -> Self {
        let preprocess = PreprocessConfig::from_net(&model.config().net);
        Self {
            model,
            preprocess,
            thresholds,
            box_format,
        }
    }

    pub fn with_preprocess(mut self, preprocess: PreprocessConfig) -> Self {
        self.preprocess = preprocess;
        self
    }

    pub fn model(&self) -> &DarknetModel {
        &self.model
    }

    pub fn thresholds(&self) -> &ClassThresholds {
        &self.thresholds
    }

    pub fn preprocess_config(&self) -> &PreprocessConfig {
        &self.preprocess
    }

    /// Run detection on an image file path.
    pub fn detect_path<P: AsRef<Path>>(&self, path: P) -> Result<DetectionOutput> {
        let image = load_image(path)?;
        self.detect_image(&image)
    }

    /// Run detection on one in-memory image.
    pub fn detect_image(&self, image: &DynamicImage) -> Result<DetectionOutput> {
        let mut outputs = self.detect_images(std::slice::from_ref(image))?;
        outputs
            .pop()
            .ok_or_else(|| anyhow::anyhow!("detector produced no output"))
    }

    /// Run detection over any number of images, one network batch at a time.
    pub fn detect_images(&self, images: &[DynamicImage]) -> Result<Vec<DetectionOutput>> {
        anyhow::ensure!(
            self.model.built().decode_outputs().is_some(),
            "model '{}' has no [yolo] or [region] block to decode",
            self.model.config().model_name
        );
        let _guard = timing_guard("darknet_core::detect_images", Level::Debug);
        let batch = self.model.config().net.batch;
        let mut results = Vec::with_capacity(images.len());
        for chunk in images.chunks(batch) {
            let prep = preprocess_batch(chunk, batch, &self.preprocess)?;
            results.extend(self.run_preprocessed(prep)?);
        }
        Ok(results)
    }

    fn run_preprocessed(&self, prep: PreprocessOutput) -> Result<Vec<DetectionOutput>> {
        let outputs = self.model.run(prep.tensor)?;
        let [boxes, scores, classes] = OUTPUT_BLOB_NAMES;
        let (boxes, scores, classes) = (
            outputs.require(boxes)?,
            outputs.require(scores)?,
            outputs.require(classes)?,
        );

        let _guard = timing_guard("darknet_core::postprocess", Level::Debug);
        prep.maps
            .iter()
            .enumerate()
            .map(|(index, map)| {
                let raw = RawDetections::from_outputs(boxes, scores, classes, index)?;
                let candidates = decode_detections(
                    &raw,
                    &self.thresholds,
                    self.preprocess.input_size,
                    self.box_format,
                );
                let detections = candidates.iter().map(|c| project(c, map)).collect();
                Ok(DetectionOutput {
                    candidates,
                    detections,
                    original_size: map.original_size,
                })
            })
            .collect()
    }
}

/// Map a network-space candidate onto the source image, clamped to its bounds.
fn project(candidate: &DetectionCandidate, map: &CoordinateMap) -> DetectionCandidate {
    let (w, h) = (map.original_size.0 as f32, map.original_size.1 as f32);
    let (x1, y1) = map.to_source(candidate.left, candidate.top);
    let (x2, y2) = map.to_source(
        candidate.left + candidate.width,
        candidate.top + candidate.height,
    );
    let (x1, y1) = (x1.clamp(0.0, w), y1.clamp(0.0, h));
    let (x2, y2) = (x2.clamp(0.0, w), y2.clamp(0.0, h));
    DetectionCandidate {
        left: x1,
        top: y1,
        width: (x2 - x1).max(0.0),
        height: (y2 - y1).max(0.0),
        ..*candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_undoes_letterbox_padding() {
        let map = CoordinateMap {
            scale_x: 2.0,
            scale_y: 2.0,
            offset_x: 0.0,
            offset_y: -16.0,
            original_size: (64, 32),
        };
        let candidate = DetectionCandidate {
            left: 4.0,
            top: 4.0,
            width: 10.0,
            height: 10.0,
            class_id: 3,
            confidence: 0.8,
        };
        let projected = project(&candidate, &map);
        assert_eq!(projected.left, 8.0);
        // top falls into the padding band and is clamped to the image
        assert_eq!(projected.top, 0.0);
        assert_eq!(projected.height, 12.0);
        assert_eq!(projected.width, 20.0);
        assert_eq!(projected.class_id, 3);
    }
}
