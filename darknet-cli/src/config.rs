//! Configuration loading and CLI override logic.

use std::path::PathBuf;

use anyhow::{Context, Result};
use darknet_utils::{
    config::{AppSettings, default_settings_path},
    normalize_path,
};
use log::info;

use crate::args::{CalibrateArgs, Cli, DetectArgs, ModelArgs};

/// Load application settings from a file or use defaults.
pub fn load_settings(config_path: Option<&PathBuf>) -> Result<AppSettings> {
    if let Some(path) = config_path {
        let resolved = normalize_path(path)?;
        let settings = AppSettings::load_from_path(&resolved)?;
        info!("Loaded settings from {}", resolved.display());
        Ok(settings)
    } else {
        let default_path = default_settings_path();
        if default_path.exists() {
            let settings = AppSettings::load_from_path(&default_path).with_context(|| {
                format!(
                    "failed to load default settings from {}",
                    default_path.display()
                )
            })?;
            info!("Loaded settings from {}", default_path.display());
            Ok(settings)
        } else {
            Ok(AppSettings::default())
        }
    }
}

/// Apply the global telemetry flags.
pub fn apply_global_overrides(settings: &mut AppSettings, cli: &Cli) {
    if cli.telemetry {
        settings.telemetry.enabled = true;
    }
    if let Some(level) = cli.telemetry_level.as_ref() {
        let normalized = level.trim();
        if !normalized.is_empty() {
            let lower = normalized.to_ascii_lowercase();
            if lower == "off" {
                settings.telemetry.enabled = false;
            }
            settings.telemetry.level = lower;
        }
    }
}

/// Apply model path overrides.
pub fn apply_model_overrides(settings: &mut AppSettings, args: &ModelArgs) {
    if let Some(cfg) = args.cfg.as_ref() {
        settings.model.cfg_path = Some(cfg.display().to_string());
    }
    if let Some(weights) = args.weights.as_ref() {
        settings.model.weights_path = Some(weights.display().to_string());
    }
    if let Some(batch) = args.batch_size {
        settings.model.batch_size = Some(batch);
    }
}

/// Apply `detect` overrides.
pub fn apply_detect_overrides(settings: &mut AppSettings, args: &DetectArgs) {
    apply_model_overrides(settings, &args.model);
    if let Some(score) = args.score_threshold {
        settings.detection.score_threshold = score;
    }
    if let Some(format) = args.box_format {
        settings.detection.box_format = format;
    }
}

/// Apply `calibrate` overrides. Flags win over `INT8_CALIB_*`, which win over the file.
pub fn apply_calibrate_overrides(settings: &mut AppSettings, args: &CalibrateArgs) -> Result<()> {
    apply_model_overrides(settings, &args.model);
    let calibration = &mut settings.calibration;
    calibration.apply_env_overrides()?;
    if let Some(images) = args.images.as_ref() {
        calibration.image_list = Some(images.display().to_string());
    }
    if let Some(cache) = args.cache.as_ref() {
        calibration.cache_path = cache.display().to_string();
    }
    if let Some(batch) = args.model.batch_size {
        anyhow::ensure!(batch > 0, "--batch-size must be positive");
        calibration.batch_size = batch;
    }
    if args.no_cache {
        calibration.use_cache = false;
    }
    Ok(())
}

/// Resolve the cfg and weights paths, failing when either is unset.
pub fn model_paths(settings: &AppSettings) -> Result<(PathBuf, PathBuf)> {
    let cfg = settings
        .model
        .cfg_path
        .as_deref()
        .context("no cfg file given (use --cfg or model.cfg_path in the settings file)")?;
    let weights = settings
        .model
        .weights_path
        .as_deref()
        .context("no weights file given (use --weights or model.weights_path in the settings file)")?;
    Ok((normalize_path(cfg)?, normalize_path(weights)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use darknet_utils::config::BoxFormat;

    use crate::args::Command;

    #[test]
    fn detect_flags_override_settings() {
        let cli = Cli::parse_from([
            "darknet-cli",
            "--telemetry-level",
            "OFF",
            "detect",
            "--cfg",
            "a.cfg",
            "-i",
            "img.png",
            "--score-threshold",
            "0.6",
            "--box-format",
            "corner",
        ]);
        let mut settings = AppSettings::default();
        settings.telemetry.enabled = true;
        apply_global_overrides(&mut settings, &cli);
        assert!(!settings.telemetry.enabled);
        assert_eq!(settings.telemetry.level, "off");

        let Command::Detect(args) = &cli.command else {
            panic!("expected detect");
        };
        apply_detect_overrides(&mut settings, args);
        assert_eq!(settings.model.cfg_path.as_deref(), Some("a.cfg"));
        assert_eq!(settings.model.weights_path, None);
        assert_eq!(settings.detection.score_threshold, 0.6);
        assert_eq!(settings.detection.box_format, BoxFormat::Corner);
        assert!(model_paths(&settings).is_err());
    }

    #[test]
    fn calibrate_flags_override_settings() {
        let cli = Cli::parse_from([
            "darknet-cli",
            "calibrate",
            "--images",
            "list.txt",
            "--cache",
            "out/calib.table",
            "--batch-size",
            "4",
            "--no-cache",
        ]);
        let mut settings = AppSettings::default();
        settings.calibration.image_list = Some("from-file.txt".into());
        let Command::Calibrate(args) = &cli.command else {
            panic!("expected calibrate");
        };
        apply_calibrate_overrides(&mut settings, args).expect("overrides");
        assert_eq!(settings.model.batch_size, Some(4));
        assert_eq!(settings.calibration.batch_size, 4);
        assert_eq!(settings.calibration.image_list.as_deref(), Some("list.txt"));
        assert_eq!(settings.calibration.cache_path, "out/calib.table");
        assert!(!settings.calibration.use_cache);
    }
}
