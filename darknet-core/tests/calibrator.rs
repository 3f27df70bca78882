use std::fs;

use darknet_core::{
    CalibrationInput, DarknetConfig, DarknetModel, DeviceBuffer, EntropyCalibrator,
    Int8Calibrator, WeightBuffer, calibrate_model, calibrator::CACHE_HEADER, parse_cfg_str,
};
use darknet_utils::config::CalibrationSettings;
use image::{Rgb, RgbImage};
use tempfile::tempdir;

const INPUT: CalibrationInput = CalibrationInput {
    channels: 3,
    height: 8,
    width: 8,
};

fn write_images(dir: &std::path::Path, count: usize) -> std::path::PathBuf {
    let mut list = String::new();
    for i in 0..count {
        let path = dir.join(format!("calib_{i:02}.png"));
        // non-square sources exercise the scale-then-crop path
        let shade = (i * 20) as u8;
        RgbImage::from_pixel(16, 12, Rgb([shade, 255 - shade, 128]))
            .save(&path)
            .expect("save image");
        list.push_str(&format!("{}\n", path.display()));
        if i % 3 == 0 {
            list.push('\n');
        }
    }
    let list_path = dir.join("calibration.txt");
    fs::write(&list_path, list).expect("write list");
    list_path
}

#[test]
fn batch_of_four_over_ten_images_yields_two_batches() {
    let dir = tempdir().expect("tempdir");
    let list = write_images(dir.path(), 10);
    let settings = CalibrationSettings {
        image_list: Some(list.to_string_lossy().into_owned()),
        cache_path: dir.path().join("calib.table").to_string_lossy().into_owned(),
        batch_size: 4,
        ..Default::default()
    };
    let mut calibrator = EntropyCalibrator::with_host_buffer(&settings, INPUT).expect("calibrator");
    assert_eq!(calibrator.batch_size(), 4);
    assert_eq!(calibrator.image_count(), 10);
    assert!(calibrator.read_calibration_cache().expect("cache").is_none());

    let first = calibrator
        .get_batch(&["data"])
        .expect("batch")
        .expect("first batch")
        .as_slice()
        .to_vec();
    assert_eq!(first.len(), 4 * INPUT.volume());
    // image 1, red plane, any pixel: 20 / 255
    let plane = INPUT.height * INPUT.width;
    let image_one_red = first[INPUT.volume() + 5];
    assert!((image_one_red - 20.0 / 255.0).abs() < 0.02);
    // blue plane of image 0
    assert!((first[2 * plane] - 128.0 / 255.0).abs() < 0.02);

    let second = calibrator.get_batch(&["data"]).expect("batch");
    assert!(second.is_some_and(|buffer| buffer.len() == 4 * INPUT.volume()));
    assert_eq!(calibrator.position(), 8);

    assert!(calibrator.get_batch(&["data"]).expect("batch").is_none());
    assert!(calibrator.get_batch(&["data"]).expect("batch").is_none());

    calibrator
        .write_calibration_cache(b"entropy-table")
        .expect("write cache");
    assert_eq!(
        fs::read(dir.path().join("calib.table")).expect("read cache"),
        b"entropy-table"
    );
}

#[test]
fn environment_overrides_drive_the_calibrator() {
    let dir = tempdir().expect("tempdir");
    let list = write_images(dir.path(), 3);
    let mut settings = CalibrationSettings {
        cache_path: dir.path().join("calib.table").to_string_lossy().into_owned(),
        ..Default::default()
    };
    let list_value = list.to_string_lossy().into_owned();
    settings
        .apply_overrides_from(|key| match key {
            "INT8_CALIB_IMG_PATH" => Some(list_value.clone()),
            "INT8_CALIB_BATCH_SIZE" => Some("3".into()),
            _ => None,
        })
        .expect("overrides");

    let mut calibrator = EntropyCalibrator::with_host_buffer(&settings, INPUT).expect("calibrator");
    assert_eq!(calibrator.batch_size(), 3);
    assert!(calibrator.get_batch(&["data"]).expect("batch").is_some());
    assert!(calibrator.get_batch(&["data"]).expect("batch").is_none());
}

const FEATURE_NET: &str = "\
[net]
width=8
height=8
channels=3

[convolutional]
filters=1
size=1
stride=1
pad=0
activation=linear
";

/// Head-less 1x1 conv summing the three channels plus a bias of one.
fn feature_model(batch: usize) -> DarknetModel {
    let blocks = parse_cfg_str(FEATURE_NET).expect("parse");
    let mut config = DarknetConfig::from_blocks(&blocks, "features").expect("config");
    config.net.batch = batch;
    DarknetModel::compile(config, &WeightBuffer::from_values(vec![1.0; 4])).expect("build")
}

/// Reads `name: hex` lines back into peak activations.
fn cache_peaks(text: &str) -> Vec<(String, f32)> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let (name, bits) = line.split_once(": ")?;
            let scale = f32::from_bits(u32::from_str_radix(bits, 16).ok()?);
            Some((name.to_string(), scale * 127.0))
        })
        .collect()
}

#[test]
fn calibration_run_writes_per_tensor_scales_then_reuses_them() {
    let dir = tempdir().expect("tempdir");
    let list = write_images(dir.path(), 10);
    let cache_path = dir.path().join("calib.table");
    let settings = CalibrationSettings {
        image_list: Some(list.to_string_lossy().into_owned()),
        cache_path: cache_path.to_string_lossy().into_owned(),
        batch_size: 4,
        ..Default::default()
    };
    let model = feature_model(4);

    let mut calibrator = EntropyCalibrator::with_host_buffer(&settings, INPUT).expect("calibrator");
    let report = calibrate_model(&model, &mut calibrator).expect("calibrate");
    assert!(!report.reused_cache);
    assert_eq!(report.batches, 2);
    assert_eq!(report.tensors, 2);

    let text = fs::read_to_string(&cache_path).expect("read cache");
    assert_eq!(text.lines().next(), Some(CACHE_HEADER));
    assert_eq!(report.cache_bytes, text.len());
    let peaks = cache_peaks(&text);
    assert_eq!(peaks.len(), 2);
    // green channel of image 0 is 255
    assert_eq!(peaks[0].0, "input_0");
    assert!((peaks[0].1 - 1.0).abs() < 0.01);
    // 1 + r + g + b with r + g == 1 and b == 128 / 255
    assert_eq!(peaks[1].0, "convolution_1");
    assert!((peaks[1].1 - (2.0 + 128.0 / 255.0)).abs() < 0.02);

    let mut again = EntropyCalibrator::with_host_buffer(&settings, INPUT).expect("calibrator");
    let reused = calibrate_model(&model, &mut again).expect("reuse");
    assert!(reused.reused_cache);
    assert_eq!(reused.batches, 0);
    assert_eq!(reused.cache_bytes, text.len());
    assert_eq!(again.position(), 0);
}

#[test]
fn calibration_requires_matching_batch_sizes() {
    let dir = tempdir().expect("tempdir");
    let list = write_images(dir.path(), 4);
    let settings = CalibrationSettings {
        image_list: Some(list.to_string_lossy().into_owned()),
        cache_path: dir.path().join("calib.table").to_string_lossy().into_owned(),
        batch_size: 4,
        use_cache: false,
        ..Default::default()
    };
    let mut calibrator = EntropyCalibrator::with_host_buffer(&settings, INPUT).expect("calibrator");
    let err = calibrate_model(&feature_model(1), &mut calibrator).expect_err("batch mismatch");
    assert!(err.to_string().contains("differs from calibration batch 4"));
    assert!(!dir.path().join("calib.table").exists());
}
