//! Command-line argument definitions for darknet-cli.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use darknet_core::ResizeMode;
use darknet_utils::config::BoxFormat;

/// Compile Darknet cfg + weights and run YOLO detection on the CPU.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Optional settings JSON. Defaults to `config/darknet.json` when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, global = true, value_name = "LEVEL")]
    pub telemetry_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build the network and print its layer table.
    Inspect(InspectArgs),
    /// Run detection over an image or a directory of images.
    Detect(DetectArgs),
    /// Feed calibration images through the network and write an INT8 scale cache.
    Calibrate(CalibrateArgs),
}

/// Model file locations shared by every subcommand.
#[derive(Debug, Args)]
pub struct ModelArgs {
    /// Darknet `.cfg` file (defaults to the settings file).
    #[arg(long)]
    pub cfg: Option<PathBuf>,

    /// Binary `.weights` or text `.wts` file (defaults to the settings file).
    #[arg(long)]
    pub weights: Option<PathBuf>,

    /// Override the `[net]` batch size.
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Print the layer table as JSON instead of text.
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct DetectArgs {
    #[command(flatten)]
    pub model: ModelArgs,

    /// Path to an image file or a directory containing images.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Override the default score threshold.
    #[arg(long)]
    pub score_threshold: Option<f32>,

    /// Layout of the `boxes` output: `center` or `corner`.
    #[arg(long, value_name = "FORMAT")]
    pub box_format: Option<BoxFormat>,

    /// How images are fitted to the network input (defaults to the cfg's `letter_box`).
    #[arg(long, value_enum)]
    pub resize: Option<ResizeArg>,

    /// Write detections to a JSON file instead of stdout.
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Directory to write annotated images with bounding boxes overlaid.
    #[arg(long)]
    pub annotate: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CalibrateArgs {
    /// `--batch-size` also sets the calibration batch.
    #[command(flatten)]
    pub model: ModelArgs,

    /// Text file listing one calibration image per line.
    #[arg(long, value_name = "LIST")]
    pub images: Option<PathBuf>,

    /// Where the calibration cache is read from and written to.
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Ignore an existing cache and recalibrate.
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResizeArg {
    Stretch,
    Letterbox,
    CenterCrop,
}

impl From<ResizeArg> for ResizeMode {
    fn from(arg: ResizeArg) -> Self {
        match arg {
            ResizeArg::Stretch => ResizeMode::Stretch,
            ResizeArg::Letterbox => ResizeMode::Letterbox,
            ResizeArg::CenterCrop => ResizeMode::CenterCrop,
        }
    }
}
