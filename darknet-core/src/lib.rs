//! Core Darknet compilation primitives.
//!
//! This crate parses Darknet `.cfg` files and weight blobs, emits the network
//! into any [`NetworkDefinition`] backend, and decodes the YOLO outputs into
//! detection candidates. [`NetworkGraph`] and [`CpuRuntime`] are the in-process
//! backend used for inspection and CPU inference.

/// Single-pass network builder.
pub mod builder;
/// INT8 calibration batch feeder.
pub mod calibrator;
/// Raw `.cfg` block parser.
pub mod cfg;
/// Typed network description.
pub mod config;
/// High-level detection runner.
pub mod detector;
/// Structural and data errors raised while compiling.
pub mod error;
/// In-memory graph recorder with shape inference.
pub mod graph;
/// Per-block-type emitters.
pub mod layers;
/// Compiled model wrapper.
pub mod model;
/// Executor interface and node descriptors.
pub mod network;
/// Append-only arena of per-layer output tensors.
pub mod outputs;
/// Detection decoding (threshold, corner conversion, clamping).
pub mod postprocess;
/// Image pre-processing (resizing, tensor conversion).
pub mod preprocess;
/// CPU evaluator for [`NetworkGraph`].
pub mod runtime;
/// Weight blob loading and the consuming cursor.
pub mod weights;
/// The YOLO decode node.
pub mod yolo;

pub use builder::{BuiltNetwork, DecodeOutputs, LayerSummary, NetworkOutputs, build_network};
pub use calibrator::{
    ActivationRanges, CalibrationInput, CalibrationReport, DeviceBuffer, EntropyCalibrator,
    HostBuffer, Int8Calibrator, calibrate_model,
};
pub use cfg::{ConfigBlock, parse_cfg, parse_cfg_str};
pub use config::{Activation, DarknetConfig, HeadKind, LayerKind, YoloTensorInfo};
pub use detector::{DarknetDetector, DetectionOutput};
pub use error::BuildError;
pub use graph::NetworkGraph;
pub use model::DarknetModel;
pub use network::{NetworkDefinition, TensorId, TensorShape};
pub use postprocess::{ClassThresholds, DetectionCandidate, RawDetections, decode_detections};
pub use preprocess::{
    CoordinateMap, InputSize, PreprocessConfig, PreprocessOutput, ResizeMode, preprocess_batch,
    preprocess_dynamic_image, preprocess_image,
};
pub use runtime::{CpuRuntime, RuntimeOutputs};
pub use weights::{WeightBuffer, WeightCursor, load_weights};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
