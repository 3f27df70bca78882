use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use darknet_core::{DarknetConfig, DarknetModel, WeightBuffer, parse_cfg_str};
use ndarray::Array4;

const TINY_CFG: &str = "\
[net]
width=64
height=64
channels=3

[convolutional]
batch_normalize=1
filters=16
size=3
stride=1
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
batch_normalize=1
filters=32
size=3
stride=1
pad=1
activation=leaky

[maxpool]
size=2
stride=2

[convolutional]
filters=18
size=1
stride=1
pad=0
activation=linear

[yolo]
mask=0,1,2
anchors=10,14,23,27,37,58
classes=1
num=3
";

// bn 16 + conv 16x3x3x3, bn 32 + conv 32x16x3x3, bias 18 + conv 18x32
const TINY_WEIGHTS: usize = 4 * 16 + 432 + 4 * 32 + 4608 + 18 + 576;

fn weights() -> WeightBuffer {
    WeightBuffer::from_values(
        (0..TINY_WEIGHTS)
            .map(|i| if i % 7 == 0 { 1.0 } else { (i % 13) as f32 / 100.0 })
            .collect(),
    )
}

fn bench_graph_build(c: &mut Criterion) {
    let weights = weights();
    c.bench_function("parse_and_build_tiny", |b| {
        b.iter(|| {
            let blocks = parse_cfg_str(black_box(TINY_CFG)).expect("parse");
            let config = DarknetConfig::from_blocks(&blocks, "tiny").expect("config");
            DarknetModel::compile(config, &weights).expect("build")
        })
    });
}

fn bench_cpu_inference(c: &mut Criterion) {
    let blocks = parse_cfg_str(TINY_CFG).expect("parse");
    let config = DarknetConfig::from_blocks(&blocks, "tiny").expect("config");
    let model = DarknetModel::compile(config, &weights()).expect("build");
    let input = Array4::from_shape_fn((1, 3, 64, 64), |(_, c, y, x)| {
        ((c * 31 + y * 7 + x) % 255) as f32 / 255.0
    });
    c.bench_function("cpu_inference_tiny", |b| {
        b.iter(|| model.run(black_box(input.clone())).expect("run"))
    });
}

criterion_group!(benches, bench_graph_build, bench_cpu_inference);
criterion_main!(benches);
