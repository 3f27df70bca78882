//! Turns the `boxes` / `scores` / `classes` outputs into detection candidates.
//!
//! No sorting, non-maximum suppression or clustering happens here; that is left
//! to the consumer.

use anyhow::Result;
use ndarray::{ArrayD, ArrayView2, Ix2};
use serde::Serialize;

use crate::preprocess::InputSize;
use darknet_utils::config::{BoxFormat, DetectionSettings};

/// One surviving row, in network pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DetectionCandidate {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    pub class_id: usize,
    pub confidence: f32,
}

/// Per-class confidence thresholds with a fallback for classes outside the table.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassThresholds {
    pub default: f32,
    pub per_class: Vec<f32>,
}

impl ClassThresholds {
    pub fn uniform(threshold: f32) -> Self {
        Self {
            default: threshold,
            per_class: Vec::new(),
        }
    }

    pub fn threshold(&self, class_id: usize) -> f32 {
        self.per_class
            .get(class_id)
            .copied()
            .unwrap_or(self.default)
    }
}

impl Default for ClassThresholds {
    fn default() -> Self {
        Self::uniform(0.25)
    }
}

impl From<&DetectionSettings> for ClassThresholds {
    fn from(settings: &DetectionSettings) -> Self {
        Self {
            default: settings.score_threshold,
            per_class: settings.class_thresholds.clone(),
        }
    }
}

impl From<DetectionSettings> for ClassThresholds {
    fn from(settings: DetectionSettings) -> Self {
        (&settings).into()
    }
}

/// Borrowed view of one image's rows: `boxes [N, 4]`, `scores [N]`, `classes [N]`.
#[derive(Debug, Clone, Copy)]
pub struct RawDetections<'a> {
    pub boxes: ArrayView2<'a, f32>,
    pub scores: ArrayView2<'a, f32>,
    pub classes: ArrayView2<'a, f32>,
}

impl<'a> RawDetections<'a> {
    /// Select batch item `index` from the `[B, N, 4]`, `[B, N, 1]`, `[B, N, 1]` outputs.
    pub fn from_outputs(
        boxes: &'a ArrayD<f32>,
        scores: &'a ArrayD<f32>,
        classes: &'a ArrayD<f32>,
        index: usize,
    ) -> Result<Self> {
        let pick = |array: &'a ArrayD<f32>, width: usize, name: &str| -> Result<ArrayView2<'a, f32>> {
            let shape = array.shape();
            anyhow::ensure!(
                shape.len() == 3 && shape[2] == width && index < shape[0],
                "output '{name}' has shape {shape:?}; expected [B > {index}, N, {width}]"
            );
            Ok(array
                .index_axis(ndarray::Axis(0), index)
                .into_dimensionality::<Ix2>()?)
        };
        let raw = Self {
            boxes: pick(boxes, 4, "boxes")?,
            scores: pick(scores, 1, "scores")?,
            classes: pick(classes, 1, "classes")?,
        };
        anyhow::ensure!(
            raw.scores.nrows() == raw.boxes.nrows() && raw.classes.nrows() == raw.boxes.nrows(),
            "output row counts differ (boxes {}, scores {}, classes {})",
            raw.boxes.nrows(),
            raw.scores.nrows(),
            raw.classes.nrows()
        );
        Ok(raw)
    }

    pub fn len(&self) -> usize {
        self.boxes.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Filter rows by threshold, convert to corners and clamp to the input extent.
pub fn decode_detections(
    raw: &RawDetections<'_>,
    thresholds: &ClassThresholds,
    input: InputSize,
    format: BoxFormat,
) -> Vec<DetectionCandidate> {
    let extent_w = input.width as f32;
    let extent_h = input.height as f32;
    let mut out = Vec::new();

    for row in 0..raw.len() {
        let class = raw.classes[[row, 0]];
        if !class.is_finite() || class < 0.0 {
            continue;
        }
        let class_id = class.trunc() as usize;
        let confidence = raw.scores[[row, 0]];
        if !confidence.is_finite() || confidence < thresholds.threshold(class_id) {
            continue;
        }

        let b = raw.boxes.row(row);
        let (x1, y1, x2, y2) = match format {
            BoxFormat::Center => (
                b[0] - b[2] / 2.0,
                b[1] - b[3] / 2.0,
                b[0] + b[2] / 2.0,
                b[1] + b[3] / 2.0,
            ),
            BoxFormat::Corner => (b[0], b[1], b[2], b[3]),
        };
        let x1 = x1.clamp(0.0, extent_w);
        let y1 = y1.clamp(0.0, extent_h);
        let x2 = x2.clamp(0.0, extent_w);
        let y2 = y2.clamp(0.0, extent_h);
        let (width, height) = (x2 - x1, y2 - y1);
        // NaN coordinates fail both comparisons and are dropped too
        if !(width >= 1.0 && height >= 1.0) {
            continue;
        }

        out.push(DetectionCandidate {
            left: x1,
            top: y1,
            width,
            height,
            class_id,
            confidence,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array3};

    fn rows(data: &[([f32; 4], f32, f32)]) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let n = data.len();
        let boxes = Array2::from_shape_fn((n, 4), |(r, c)| data[r].0[c]);
        let scores = Array2::from_shape_fn((n, 1), |(r, _)| data[r].1);
        let classes = Array2::from_shape_fn((n, 1), |(r, _)| data[r].2);
        (boxes, scores, classes)
    }

    fn decode(
        data: &[([f32; 4], f32, f32)],
        thresholds: &ClassThresholds,
        format: BoxFormat,
    ) -> Vec<DetectionCandidate> {
        let (boxes, scores, classes) = rows(data);
        let raw = RawDetections {
            boxes: boxes.view(),
            scores: scores.view(),
            classes: classes.view(),
        };
        decode_detections(&raw, thresholds, InputSize::new(100, 80), format)
    }

    #[test]
    fn converts_centre_boxes_to_corners() {
        let out = decode(
            &[([50.0, 40.0, 20.0, 10.0], 0.9, 2.0)],
            &ClassThresholds::uniform(0.5),
            BoxFormat::Center,
        );
        assert_eq!(
            out,
            vec![DetectionCandidate {
                left: 40.0,
                top: 35.0,
                width: 20.0,
                height: 10.0,
                class_id: 2,
                confidence: 0.9,
            }]
        );
    }

    #[test]
    fn applies_per_class_thresholds_with_default_fallback() {
        let thresholds = ClassThresholds {
            default: 0.5,
            per_class: vec![0.1, 0.95],
        };
        let data = [
            ([10.0, 10.0, 5.0, 5.0], 0.2, 0.0),
            ([10.0, 10.0, 5.0, 5.0], 0.9, 1.0),
            ([10.0, 10.0, 5.0, 5.0], 0.6, 7.0),
            ([10.0, 10.0, 5.0, 5.0], 0.4, 7.9),
            ([10.0, 10.0, 5.0, 5.0], 0.99, -1.0),
        ];
        let out = decode(&data, &thresholds, BoxFormat::Center);
        let kept: Vec<_> = out.iter().map(|d| d.class_id).collect();
        assert_eq!(kept, vec![0, 7]);
    }

    #[test]
    fn clamps_to_extent_and_drops_degenerate_boxes() {
        let data = [
            ([0.0, 0.0, 40.0, 40.0], 0.9, 0.0),
            ([120.0, 40.0, 30.0, 10.0], 0.9, 0.0),
            ([10.0, 10.0, 0.5, 8.0], 0.9, 0.0),
            ([95.0, 75.0, 60.0, 60.0], 0.9, 0.0),
        ];
        let out = decode(&data, &ClassThresholds::uniform(0.1), BoxFormat::Center);
        assert_eq!(out.len(), 2);
        assert_eq!((out[0].left, out[0].top, out[0].width, out[0].height), (0.0, 0.0, 20.0, 20.0));
        assert_eq!((out[1].left, out[1].top), (65.0, 45.0));
        assert_eq!((out[1].width, out[1].height), (35.0, 35.0));
        for det in &out {
            assert!(det.left >= 0.0 && det.top >= 0.0);
            assert!(det.left + det.width <= 100.0 && det.top + det.height <= 80.0);
        }
    }

    #[test]
    fn corner_format_passes_through() {
        let out = decode(
            &[([10.0, 20.0, 30.0, 50.0], 0.9, 1.0)],
            &ClassThresholds::uniform(0.5),
            BoxFormat::Corner,
        );
        assert_eq!(out[0].width, 20.0);
        assert_eq!(out[0].height, 30.0);
    }

    #[test]
    fn selects_batch_item_from_runtime_outputs() {
        let boxes = Array3::from_shape_fn((2, 3, 4), |(b, r, _)| (b * 10 + r) as f32).into_dyn();
        let scores = Array3::<f32>::zeros((2, 3, 1)).into_dyn();
        let classes = Array3::<f32>::zeros((2, 3, 1)).into_dyn();
        let raw = RawDetections::from_outputs(&boxes, &scores, &classes, 1).expect("view");
        assert_eq!(raw.len(), 3);
        assert_eq!(raw.boxes[[2, 0]], 12.0);
        assert!(RawDetections::from_outputs(&boxes, &scores, &classes, 2).is_err());
        assert!(RawDetections::from_outputs(&scores, &scores, &classes, 0).is_err());
    }

    #[test]
    fn thresholds_follow_detection_settings() {
        let settings = DetectionSettings {
            score_threshold: 0.4,
            class_thresholds: vec![0.7],
            ..Default::default()
        };
        let thresholds = ClassThresholds::from(&settings);
        assert_eq!(thresholds.threshold(0), 0.7);
        assert_eq!(thresholds.threshold(5), 0.4);
    }
}
