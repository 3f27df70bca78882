//! Serializable output records.

use darknet_core::{DetectionCandidate, LayerSummary};
use serde::Serialize;

/// One detection in source-image pixels.
#[derive(Debug, Serialize)]
pub struct DetectionRecord {
    pub class_id: usize,
    pub confidence: f32,
    /// `[left, top, width, height]`.
    pub bbox: [f32; 4],
}

/// All detections for a single image.
#[derive(Debug, Serialize)]
pub struct ImageDetections {
    pub image: String,
    pub detections: Vec<DetectionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated: Option<String>,
}

/// `inspect --json` payload.
#[derive(Debug, Serialize)]
pub struct NetworkReport<'a> {
    pub model: &'a str,
    pub input: [usize; 4],
    pub nodes: usize,
    pub parameters: usize,
    pub weights: usize,
    pub output_rows: usize,
    pub layers: &'a [LayerSummary],
}

impl From<&DetectionCandidate> for DetectionRecord {
    fn from(candidate: &DetectionCandidate) -> Self {
        Self {
            class_id: candidate.class_id,
            confidence: candidate.confidence,
            bbox: [
                candidate.left,
                candidate.top,
                candidate.width,
                candidate.height,
            ],
        }
    }
}
