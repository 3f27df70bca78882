//! INT8 calibration batch feeder with an on-disk cache.
//!
//! The backend pulls batches through [`Int8Calibrator::get_batch`] until it
//! returns `None`, then stores the resulting table through
//! [`Int8Calibrator::write_calibration_cache`]. When a cache file already exists
//! and reuse is enabled, no images are fed at all.
//!
//! [`calibrate_model`] plays the backend's part against the CPU runtime: it
//! records the largest absolute activation of every tensor over the calibration
//! set and stores one scale per tensor in the cache.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use image::{DynamicImage, imageops::FilterType};
use log::{Level, debug, info};
use ndarray::{Array4, ArrayD};
use serde::Serialize;

use crate::{
    builder::INPUT_BLOB_NAME,
    graph::{Node, Op},
    model::DarknetModel,
    network::TensorId,
};

use darknet_utils::{
    Normalization, config::CalibrationSettings, load_image, luma_to_planar, resize_center_crop,
    rgb_to_planar, timing_guard,
};

/// Memory the backend reads calibration input from.
pub trait DeviceBuffer {
    /// Capacity in floats.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Synchronous host-to-device copy of exactly `len()` floats.
    fn upload(&mut self, host: &[f32]) -> Result<()>;
}

/// Device buffer living in process memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostBuffer {
    data: Vec<f32>,
}

impl HostBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

impl DeviceBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn upload(&mut self, host: &[f32]) -> Result<()> {
        anyhow::ensure!(
            host.len() == self.data.len(),
            "upload of {} floats into a buffer of {}",
            host.len(),
            self.data.len()
        );
        self.data.copy_from_slice(host);
        Ok(())
    }
}

/// Interface the acceleration backend drives during INT8 calibration.
pub trait Int8Calibrator {
    type Buffer: DeviceBuffer;

    fn batch_size(&self) -> usize;

    /// Fill and return the binding for `names`, or `None` once calibration is over.
    fn get_batch(&mut self, names: &[&str]) -> Result<Option<&Self::Buffer>>;

    /// Previously written calibration table, if one should be reused.
    fn read_calibration_cache(&mut self) -> Result<Option<&[u8]>>;

    fn write_calibration_cache(&mut self, cache: &[u8]) -> Result<()>;
}

/// Input geometry of the network being calibrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationInput {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl CalibrationInput {
    pub fn volume(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// Entropy calibrator feeding centre-cropped, normalized images.
#[derive(Debug)]
pub struct EntropyCalibrator<D: DeviceBuffer> {
    batch_size: usize,
    input: CalibrationInput,
    normalization: Normalization,
    images: Vec<PathBuf>,
    cursor: usize,
    cache_path: PathBuf,
    use_cache: bool,
    cache: Option<Vec<u8>>,
    host: Vec<f32>,
    device: D,
}

impl EntropyCalibrator<HostBuffer> {
    /// Calibrator over an in-process buffer sized for one batch.
    pub fn with_host_buffer(settings: &CalibrationSettings, input: CalibrationInput) -> Result<Self> {
        let device = HostBuffer::new(settings.batch_size * input.volume());
        Self::new(settings, input, device)
    }
}

impl<D: DeviceBuffer> EntropyCalibrator<D> {
    /// Read the image list named by `settings` and bind `device` as the batch buffer.
    pub fn new(settings: &CalibrationSettings, input: CalibrationInput, device: D) -> Result<Self> {
        anyhow::ensure!(settings.batch_size > 0, "calibration batch size must be positive");
        anyhow::ensure!(
            matches!(input.channels, 1 | 3),
            "calibration supports 1 or 3 input channels, got {}",
            input.channels
        );
        let list = settings
            .image_list
            .as_deref()
            .context("no calibration image list configured")?;
        let images = read_image_list(list)?;

        let volume = settings.batch_size * input.volume();
        anyhow::ensure!(
            device.len() == volume,
            "device buffer holds {} floats but a batch needs {}",
            device.len(),
            volume
        );
        info!(
            "Calibrating with {} images from {} (batch {})",
            images.len(),
            list,
            settings.batch_size
        );
        Ok(Self {
            batch_size: settings.batch_size,
            input,
            normalization: Normalization {
                scale_factor: settings.scale_factor,
                offsets: settings.offsets,
            },
            images,
            cursor: 0,
            cache_path: PathBuf::from(&settings.cache_path),
            use_cache: settings.use_cache,
            cache: None,
            host: vec![0.0; volume],
            device,
        })
    }

    /// Number of images read from the list.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Images consumed so far.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    fn load_into_host(&mut self, slot: usize, path: &Path) -> Result<()> {
        let CalibrationInput {
            channels,
            height,
            width,
        } = self.input;
        let image = load_image(path)?.to_rgb8();
        let image = resize_center_crop(&image, width as u32, height as u32, FilterType::CatmullRom);
        let planar = if channels == 1 {
            let gray = DynamicImage::ImageRgb8(image).to_luma8();
            luma_to_planar(&gray, &self.normalization)
        } else {
            rgb_to_planar(&image, &self.normalization)
        };

        let volume = self.input.volume();
        let target = &mut self.host[slot * volume..(slot + 1) * volume];
        for (dst, src) in target.iter_mut().zip(planar.iter()) {
            *dst = *src;
        }
        Ok(())
    }
}

impl<D: DeviceBuffer> Int8Calibrator for EntropyCalibrator<D> {
    type Buffer = D;

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn get_batch(&mut self, names: &[&str]) -> Result<Option<&D>> {
        anyhow::ensure!(
            names.len() == 1,
            "calibration feeds a single input binding, {} requested",
            names.len()
        );
        if self.cache.is_some() || self.cursor + self.batch_size > self.images.len() {
            return Ok(None);
        }
        let _guard = timing_guard("darknet_core::calibration_batch", Level::Debug);

        let batch: Vec<PathBuf> = self.images[self.cursor..self.cursor + self.batch_size].to_vec();
        for (slot, path) in batch.iter().enumerate() {
            self.load_into_host(slot, path)
                .with_context(|| format!("calibration image {} failed", path.display()))?;
        }
        self.cursor += self.batch_size;
        self.device.upload(&self.host)?;
        debug!(
            "Calibration batch for '{}' ready ({}/{})",
            names[0],
            self.cursor,
            self.images.len()
        );
        Ok(Some(&self.device))
    }

    fn read_calibration_cache(&mut self) -> Result<Option<&[u8]>> {
        if !self.use_cache || !self.cache_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.cache_path).with_context(|| {
            format!(
                "failed to read calibration cache {}",
                self.cache_path.display()
            )
        })?;
        info!(
            "Using calibration cache {} ({} bytes)",
            self.cache_path.display(),
            bytes.len()
        );
        Ok(Some(self.cache.insert(bytes).as_slice()))
    }

    fn write_calibration_cache(&mut self, cache: &[u8]) -> Result<()> {
        fs::write(&self.cache_path, cache).with_context(|| {
            format!(
                "failed to write calibration cache {}",
                self.cache_path.display()
            )
        })?;
        info!("Wrote calibration cache {}", self.cache_path.display());
        Ok(())
    }
}

/// First line of a cache written by [`calibrate_model`].
pub const CACHE_HEADER: &str = "DarknetEntropyCalibration";

/// Summary of one [`calibrate_model`] run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    /// An existing cache was returned and no images were fed.
    pub reused_cache: bool,
    pub batches: usize,
    /// Tensors with a scale in the cache.
    pub tensors: usize,
    pub cache_bytes: usize,
}

/// Largest absolute value seen per tensor, keyed by tensor index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivationRanges {
    ranges: BTreeMap<TensorId, (String, f32)>,
}

impl ActivationRanges {
    /// Decode node outputs are left in float and are not recorded.
    pub fn record(&mut self, node: &Node, tensor: TensorId, value: &ArrayD<f32>) {
        if matches!(node.op, Op::Plugin(_)) {
            return;
        }
        let peak = value.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
        let entry = self
            .ranges
            .entry(tensor)
            .or_insert_with(|| (format!("{}_{}", node.op.name(), tensor.index()), 0.0));
        entry.1 = entry.1.max(peak);
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Peak recorded for the tensor named `name`.
    pub fn peak(&self, name: &str) -> Option<f32> {
        self.ranges
            .values()
            .find(|(label, _)| label == name)
            .map(|(_, peak)| *peak)
    }

    /// Cache text: the header, then `name: scale` with the scale as `f32` bits in hex.
    pub fn to_cache(&self) -> String {
        let mut out = format!("{CACHE_HEADER}\n");
        for (name, peak) in self.ranges.values() {
            let scale = peak / 127.0;
            let _ = writeln!(out, "{name}: {:08x}", scale.to_bits());
        }
        out
    }
}

/// Feed every calibration batch through `model` and write the resulting scales.
///
/// The model's batch size must match the calibrator's. A cache returned by
/// [`Int8Calibrator::read_calibration_cache`] short-circuits the run.
pub fn calibrate_model<C>(model: &DarknetModel, calibrator: &mut C) -> Result<CalibrationReport>
where
    C: Int8Calibrator<Buffer = HostBuffer>,
{
    if let Some(cache) = calibrator.read_calibration_cache()? {
        return Ok(CalibrationReport {
            reused_cache: true,
            batches: 0,
            tensors: 0,
            cache_bytes: cache.len(),
        });
    }
    let dims = model.input_dims();
    anyhow::ensure!(
        dims[0] == calibrator.batch_size(),
        "model batch {} differs from calibration batch {}",
        dims[0],
        calibrator.batch_size()
    );

    let _guard = timing_guard("darknet_core::calibrate_model", Level::Info);
    let mut ranges = ActivationRanges::default();
    let mut batches = 0;
    while let Some(buffer) = calibrator.get_batch(&[INPUT_BLOB_NAME])? {
        let input = Array4::from_shape_vec(dims, buffer.as_slice().to_vec())
            .context("calibration batch does not match the network input")?;
        model.run_observed(input, |node, tensor, value| ranges.record(node, tensor, value))?;
        batches += 1;
    }
    anyhow::ensure!(
        batches > 0,
        "calibration image list is shorter than one batch of {}",
        calibrator.batch_size()
    );

    let table = ranges.to_cache();
    calibrator.write_calibration_cache(table.as_bytes())?;
    info!("Calibrated {} tensors over {batches} batch(es)", ranges.len());
    Ok(CalibrationReport {
        reused_cache: false,
        batches,
        tensors: ranges.len(),
        cache_bytes: table.len(),
    })
}

/// One path per line; surrounding whitespace and blank lines are ignored.
pub fn read_image_list<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read calibration image list {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}
