mod annotate;
mod args;
mod config;
mod input;
mod types;

use std::{
    fs::{self, File},
    path::Path,
};

use anyhow::{Context, Result};
use clap::Parser;
use darknet_core::{
    CalibrationInput, ClassThresholds, DarknetDetector, DarknetModel, EntropyCalibrator,
    PreprocessConfig, calibrate_model,
};
use darknet_utils::{config::AppSettings, configure_telemetry, init_logging, normalize_path};
use log::{info, warn};
use serde::Serialize;

use crate::{
    annotate::annotate_image,
    args::{CalibrateArgs, Cli, Command, DetectArgs, InspectArgs},
    config::{
        apply_calibrate_overrides, apply_detect_overrides, apply_global_overrides,
        apply_model_overrides, load_settings, model_paths,
    },
    input::collect_images,
    types::{DetectionRecord, ImageDetections, NetworkReport},
};

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_ref())?;
    apply_global_overrides(&mut settings, &cli);
    configure_telemetry(
        settings.telemetry.enabled,
        settings.telemetry.level_filter(),
    );

    match &cli.command {
        Command::Inspect(args) => run_inspect(settings, args),
        Command::Detect(args) => run_detect(settings, args),
        Command::Calibrate(args) => run_calibrate(settings, args),
    }
}

fn load_model(settings: &AppSettings) -> Result<DarknetModel> {
    let (cfg_path, weights_path) = model_paths(settings)?;
    info!(
        "Compiling {} with weights {}",
        cfg_path.display(),
        weights_path.display()
    );
    DarknetModel::load_with_batch(&cfg_path, &weights_path, settings.model.batch_size)
}

fn run_inspect(mut settings: AppSettings, args: &InspectArgs) -> Result<()> {
    apply_model_overrides(&mut settings, &args.model);
    let model = load_model(&settings)?;
    let built = model.built();
    let graph = model.graph();

    if args.json {
        let report = NetworkReport {
            model: &model.config().model_name,
            input: model.input_dims(),
            nodes: graph.nodes().len(),
            parameters: graph.parameter_count(),
            weights: built.weights_consumed,
            output_rows: built.output_rows(),
            layers: &built.summary,
        };
        let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        println!("{json}");
        return Ok(());
    }

    println!(
        "{:>4} {:<28} {:>16}    {:<16} {:>10}",
        "#", "layer", "input", "output", "weights"
    );
    for row in &built.summary {
        println!(
            "{:>4} {:<28} {:>16} -> {:<16} {:>10}",
            row.index,
            row.label,
            dims_label(&row.input_shape),
            dims_label(&row.output_shape),
            row.weight_ptr
        );
    }
    for head in &built.heads {
        println!(
            "{}: {} grid {}x{}, {} boxes, {} classes",
            head.blob_name,
            head.kind.as_str(),
            head.grid_width,
            head.grid_height,
            head.num_bboxes,
            head.num_classes
        );
    }
    println!(
        "{} nodes, {} parameters, {} weights consumed, {} output rows",
        graph.nodes().len(),
        graph.parameter_count(),
        built.weights_consumed,
        built.output_rows()
    );
    Ok(())
}

fn run_detect(mut settings: AppSettings, args: &DetectArgs) -> Result<()> {
    apply_detect_overrides(&mut settings, args);
    let input_path = normalize_path(&args.input)?;
    let annotate_dir = if let Some(dir) = args.annotate.as_ref() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create annotation directory {}", dir.display()))?;
        Some(normalize_path(dir)?)
    } else {
        None
    };

    let model = load_model(&settings)?;
    let mut preprocess = PreprocessConfig::from_net(&model.config().net);
    if let Some(resize) = args.resize {
        preprocess.resize = resize.into();
    }
    let detector = DarknetDetector::new(
        model,
        ClassThresholds::from(&settings.detection),
        settings.detection.box_format,
    )
    .with_preprocess(preprocess);

    let images = collect_images(&input_path)?;
    if images.is_empty() {
        anyhow::bail!(
            "no images found at {} (supported extensions: jpg, jpeg, png, bmp, webp)",
            input_path.display()
        );
    }

    info!("Processing {} image(s)...", images.len());
    let mut results = Vec::with_capacity(images.len());
    for image_path in images {
        let output = match detector.detect_path(&image_path) {
            Ok(output) => output,
            Err(err) => {
                warn!("Failed to process {}: {err:#}", image_path.display());
                continue;
            }
        };
        info!(
            "{} -> {} detection(s)",
            image_path.display(),
            output.detections.len()
        );
        let annotated = annotate_dir.as_ref().and_then(|dir| {
            match annotate_image(&image_path, &output.detections, dir) {
                Ok(path) => {
                    info!("Annotated image saved to {}", path.display());
                    Some(path.display().to_string())
                }
                Err(err) => {
                    warn!("Failed to annotate {}: {err}", image_path.display());
                    None
                }
            }
        });
        results.push(ImageDetections {
            image: image_path.display().to_string(),
            detections: output.detections.iter().map(DetectionRecord::from).collect(),
            annotated,
        });
    }

    if results.is_empty() {
        anyhow::bail!("all detections failed; cannot produce output");
    }
    emit_json(&results, args.json.as_deref())
}

fn run_calibrate(mut settings: AppSettings, args: &CalibrateArgs) -> Result<()> {
    apply_calibrate_overrides(&mut settings, args)?;
    // the network batch has to match what the calibrator feeds
    settings.model.batch_size = Some(settings.calibration.batch_size);
    let model = load_model(&settings)?;
    let [_, channels, height, width] = model.input_dims();
    let mut calibrator = EntropyCalibrator::with_host_buffer(
        &settings.calibration,
        CalibrationInput {
            channels,
            height,
            width,
        },
    )?;
    let report = calibrate_model(&model, &mut calibrator)?;
    if report.reused_cache {
        info!(
            "Reused calibration cache {}",
            calibrator.cache_path().display()
        );
    }
    let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
    println!("{json}");
    Ok(())
}

fn emit_json<T: Serialize>(value: &T, path: Option<&Path>) -> Result<()> {
    let Some(json_path) = path else {
        let json = serde_json::to_string_pretty(value).context("failed to serialize detections")?;
        println!("{json}");
        return Ok(());
    };
    if let Some(dir) = json_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
    }
    let file = File::create(json_path)
        .with_context(|| format!("failed to create {}", json_path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("failed to write detection JSON to {}", json_path.display()))?;
    info!("Wrote detections to {}", json_path.display());
    Ok(())
}

fn dims_label(dims: &[usize]) -> String {
    dims.iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join("x")
}
