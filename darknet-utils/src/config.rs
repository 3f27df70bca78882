//! Persisted settings shared by the darknet crates.
//!
//! Settings are grouped into sections (model, detection, calibration, telemetry)
//! that serialize to JSON. Every section uses `#[serde(default)]`, so partial
//! files only override the keys they mention.

use anyhow::{Context, Result, anyhow};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Environment variable naming the calibration image list.
pub const CALIB_IMAGE_LIST_ENV: &str = "INT8_CALIB_IMG_PATH";
/// Environment variable overriding the calibration batch size.
pub const CALIB_BATCH_SIZE_ENV: &str = "INT8_CALIB_BATCH_SIZE";

/// How raw box coordinates are laid out in the `boxes` output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum BoxFormat {
    /// `[cx, cy, w, h]`, produced by the YOLO decode node.
    #[default]
    Center,
    /// `[x1, y1, x2, y2]`.
    Corner,
}

impl fmt::Display for BoxFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BoxFormat::Center => "center",
            BoxFormat::Corner => "corner",
        })
    }
}

impl FromStr for BoxFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "center" | "centre" => Ok(BoxFormat::Center),
            "corner" | "corners" => Ok(BoxFormat::Corner),
            other => Err(format!(
                "invalid box format '{other}'; expected 'center' or 'corner'"
            )),
        }
    }
}

/// Location of the network description and its weights.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    /// Darknet `.cfg` file.
    pub cfg_path: Option<String>,
    /// Binary `.weights` or text `.wts` file.
    pub weights_path: Option<String>,
    /// Overrides the `[net]` batch size when set.
    pub batch_size: Option<usize>,
}

/// Thresholds applied when decoding raw detections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionSettings {
    /// Threshold for classes without an entry in `class_thresholds`.
    pub score_threshold: f32,
    /// Per-class thresholds indexed by class id.
    pub class_thresholds: Vec<f32>,
    pub box_format: BoxFormat,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            score_threshold: 0.25,
            class_thresholds: Vec::new(),
            box_format: BoxFormat::Center,
        }
    }
}

/// INT8 calibration inputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Text file listing one calibration image per line.
    pub image_list: Option<String>,
    pub cache_path: String,
    pub batch_size: usize,
    /// Multiplier applied after offset subtraction.
    pub scale_factor: f32,
    /// Per-channel offsets in RGB order.
    pub offsets: [f32; 3],
    /// Reuse an existing cache file instead of feeding images.
    pub use_cache: bool,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            image_list: None,
            cache_path: "calib.table".to_string(),
            batch_size: 1,
            scale_factor: 1.0 / 255.0,
            offsets: [0.0; 3],
            use_cache: true,
        }
    }
}

impl CalibrationSettings {
    /// Apply `INT8_CALIB_IMG_PATH` and `INT8_CALIB_BATCH_SIZE` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(list) = lookup(CALIB_IMAGE_LIST_ENV) {
            let list = list.trim();
            if !list.is_empty() {
                self.image_list = Some(list.to_string());
            }
        }
        if let Some(raw) = lookup(CALIB_BATCH_SIZE_ENV) {
            let batch = raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("{CALIB_BATCH_SIZE_ENV} is not an integer: '{raw}'"))?;
            if batch == 0 {
                return Err(anyhow!("{CALIB_BATCH_SIZE_ENV} must be positive"));
            }
            self.batch_size = batch;
        }
        Ok(())
    }
}

/// Telemetry preferences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    /// One of off, error, warn, info, debug, trace.
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string into a `LevelFilter`.
    pub fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(self.level.trim()).unwrap_or(LevelFilter::Debug)
    }

    pub fn set_level(&mut self, level: LevelFilter) {
        self.level = level.as_str().to_ascii_lowercase();
    }
}

/// Settings file consumed by the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub model: ModelSettings,
    pub detection: DetectionSettings,
    pub calibration: CalibrationSettings,
    pub telemetry: TelemetrySettings,
}

impl AppSettings {
    /// Load settings from a JSON file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON, overwriting any existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }
}

/// Returns the default settings location (`config/darknet.json` under the working directory).
pub fn default_settings_path() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join("config/darknet.json"))
        .unwrap_or_else(|_| PathBuf::from("config/darknet.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[test]
    fn default_settings_round_trip() {
        let file = NamedTempFile::new().expect("tempfile");
        let mut settings = AppSettings::default();
        settings.model.cfg_path = Some("yolov4-tiny.cfg".into());
        settings.detection.class_thresholds = vec![0.5, 0.3];
        settings.save_to_path(file.path()).expect("save");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let file = NamedTempFile::new().expect("tempfile");
        let json = r#"{
            "detection": { "score_threshold": 0.4, "box_format": "corner" },
            "calibration": { "batch_size": 8 }
        }"#;
        fs::write(file.path(), json).expect("write custom settings");

        let loaded = AppSettings::load_from_path(file.path()).expect("load");
        assert_eq!(loaded.detection.score_threshold, 0.4);
        assert_eq!(loaded.detection.box_format, BoxFormat::Corner);
        assert!(loaded.detection.class_thresholds.is_empty());
        assert_eq!(loaded.calibration.batch_size, 8);
        assert_eq!(loaded.calibration.cache_path, "calib.table");
        assert_eq!(loaded.model.batch_size, None);
        assert_eq!(loaded.telemetry.level_filter(), LevelFilter::Debug);
    }

    #[test]
    fn calibration_overrides_from_environment_lookup() {
        let vars: HashMap<&str, &str> = [
            (CALIB_IMAGE_LIST_ENV, "calibration.txt"),
            (CALIB_BATCH_SIZE_ENV, " 4 "),
        ]
        .into_iter()
        .collect();
        let mut calibration = CalibrationSettings::default();
        calibration
            .apply_overrides_from(|key| vars.get(key).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(calibration.image_list.as_deref(), Some("calibration.txt"));
        assert_eq!(calibration.batch_size, 4);

        let err = calibration
            .apply_overrides_from(|key| (key == CALIB_BATCH_SIZE_ENV).then(|| "four".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(CALIB_BATCH_SIZE_ENV));
        assert!(
            calibration
                .apply_overrides_from(|key| (key == CALIB_BATCH_SIZE_ENV).then(|| "0".to_string()))
                .is_err()
        );
    }

    #[test]
    fn enum_labels_parse() {
        assert_eq!("Centre".parse::<BoxFormat>(), Ok(BoxFormat::Center));
        assert!("diagonal".parse::<BoxFormat>().is_err());
        assert_eq!(BoxFormat::Corner.to_string(), "corner");
    }

    #[test]
    fn telemetry_level_parses_variants() {
        let mut telemetry = TelemetrySettings {
            level: "TRACE".into(),
            ..TelemetrySettings::default()
        };
        assert_eq!(telemetry.level_filter(), LevelFilter::Trace);

        telemetry.level = "bogus".into();
        assert_eq!(telemetry.level_filter(), LevelFilter::Debug);

        telemetry.set_level(LevelFilter::Warn);
        assert_eq!(telemetry.level, "warn");
    }
}
