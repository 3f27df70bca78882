//! Common helpers shared across the darknet crates.

/// Persisted settings (model, detection, calibration, telemetry).
pub mod config;
/// Image loading, resizing and planar tensor conversion.
pub mod image_utils;
/// Instrumentation helpers for optional performance tracing.
pub mod telemetry;

use std::path::{Path, PathBuf};

use anyhow::Result;
use log::LevelFilter;

pub use config::{
    AppSettings, BoxFormat, CalibrationSettings, DetectionSettings, ModelSettings,
    TelemetrySettings,
};
pub use image_utils::{
    Letterbox, Normalization, compute_resize_scales, letterbox_image, load_image, luma_to_planar,
    resize_center_crop, resize_image, rgb_to_planar,
};
pub use telemetry::{
    TimingGuard, configure as configure_telemetry, telemetry_allows, telemetry_enabled,
    telemetry_level, timing_guard, timing_guard_if,
};

/// Initialize logging once.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies. Telemetry records
/// are always let through so [`configure_telemetry`] alone decides whether they appear.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(telemetry::TELEMETRY_TARGET, LevelFilter::Trace);

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}
