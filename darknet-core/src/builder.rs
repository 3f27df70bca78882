//! Single-pass translation of a [`DarknetConfig`] into executor nodes.
//!
//! Layers are visited in cfg order while threading the previous tensor, the
//! weight cursor and the per-layer output arena. After the pass the cursor must
//! sit exactly at the end of the weights, and every detection head is wired into
//! one decode node whose outputs are marked `boxes`, `scores` and `classes`. A
//! cfg without heads exposes its last tensor as `output` instead.

use anyhow::{Context, Result};
use log::{Level, debug, info};
use serde::Serialize;

use crate::{
    config::{DarknetConfig, LayerKind, YoloTensorInfo},
    error::BuildError,
    layers::{
        ChannelOp, avgpool_layer, batchnorm_layer, channels_layer, convolutional_layer,
        implicit_layer, maxpool_layer, reorg3d_layer, reorg_layer, route_layer, sam_layer,
        shortcut_layer, upsample_layer,
    },
    network::{ConvolutionKind, NetworkDefinition, Plugin, TensorId, TensorShape},
    outputs::TensorOutputs,
    weights::WeightBuffer,
    yolo::YoloDecodeDesc,
};
use darknet_utils::timing_guard;

/// Name of the network input tensor.
pub const INPUT_BLOB_NAME: &str = "data";
/// Names given to the decode node outputs.
pub const OUTPUT_BLOB_NAMES: [&str; 3] = ["boxes", "scores", "classes"];
/// Name of the final tensor of a network without detection heads.
pub const FEATURE_BLOB_NAME: &str = "output";

/// Handles of the decode node outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOutputs {
    pub boxes: TensorId,
    pub scores: TensorId,
    pub classes: TensorId,
}

/// Tensors marked as graph outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkOutputs {
    Decoded(DecodeOutputs),
    /// Last layer of a head-less network, marked as [`FEATURE_BLOB_NAME`].
    Features(TensorId),
}

/// One row of the layer table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerSummary {
    pub index: usize,
    pub label: String,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    /// Weight cursor position after the layer.
    pub weight_ptr: usize,
}

/// Result of [`build_network`].
#[derive(Debug, Clone)]
pub struct BuiltNetwork {
    pub input: TensorId,
    /// Head metadata with grid sizes filled in.
    pub heads: Vec<YoloTensorInfo>,
    pub head_tensors: Vec<TensorId>,
    pub outputs: NetworkOutputs,
    pub summary: Vec<LayerSummary>,
    pub weights_consumed: usize,
}

impl BuiltNetwork {
    /// Total decoded rows `N` across all heads.
    pub fn output_rows(&self) -> usize {
        self.heads.iter().map(YoloTensorInfo::rows).sum()
    }

    /// Decode node outputs, or `None` when the cfg has no `[yolo]`/`[region]` block.
    pub fn decode_outputs(&self) -> Option<DecodeOutputs> {
        match self.outputs {
            NetworkOutputs::Decoded(outputs) => Some(outputs),
            NetworkOutputs::Features(_) => None,
        }
    }
}

/// Emit the whole network described by `config` into `network`.
pub fn build_network<N>(
    config: &DarknetConfig,
    weights: &WeightBuffer,
    network: &mut N,
) -> Result<BuiltNetwork>
where
    N: NetworkDefinition + ?Sized,
{
    let _guard = timing_guard("darknet_core::build_network", Level::Debug);
    let net = &config.net;
    let input = network.add_input(
        INPUT_BLOB_NAME,
        TensorShape::new(vec![net.batch, net.channels, net.height, net.width])?,
    )?;

    let mut cursor = weights.cursor();
    let mut outputs = TensorOutputs::new();
    let mut heads = config.heads.clone();
    let mut head_tensors = Vec::with_capacity(heads.len());
    let mut summary = Vec::with_capacity(config.layers.len());
    let mut previous = input;

    for layer in &config.layers {
        let block = layer.block();
        let input_shape = network.shape(previous)?;
        let (label, output) = match &layer.kind {
            LayerKind::Convolutional(params) | LayerKind::Deconvolutional(params) => {
                let kind = if matches!(layer.kind, LayerKind::Convolutional(_)) {
                    ConvolutionKind::Convolution
                } else {
                    ConvolutionKind::Deconvolution
                };
                let out =
                    convolutional_layer(network, &mut cursor, previous, params, kind, block)?;
                let bn = if params.batch_normalize { "_bn" } else { "" };
                (
                    format!("{}{}_{}", layer.kind.name(), bn, params.activation),
                    out,
                )
            }
            LayerKind::BatchNorm { activation } => (
                format!("batchnorm_{activation}"),
                batchnorm_layer(network, &mut cursor, previous, *activation, block)?,
            ),
            LayerKind::Implicit { filters } => (
                format!("implicit: {filters}"),
                implicit_layer(network, &mut cursor, *filters, block)?,
            ),
            LayerKind::ShiftChannels { from } | LayerKind::ControlChannels { from } => {
                let (index, implicit) = outputs.lookup(*from, block)?;
                let referenced = config.layers.get(index.0).map(|l| &l.kind);
                if !matches!(referenced, Some(LayerKind::Implicit { .. })) {
                    return Err(BuildError::InvalidField {
                        block,
                        block_type: layer.kind.name().into(),
                        field: "from".into(),
                        value: from.to_string(),
                    })
                    .context("the referenced layer must be an implicit block");
                }
                let op = if matches!(layer.kind, LayerKind::ShiftChannels { .. }) {
                    ChannelOp::Shift
                } else {
                    ChannelOp::Control
                };
                (
                    format!("{}: {}", layer.kind.name(), index.0),
                    channels_layer(network, previous, implicit, op)?,
                )
            }
            LayerKind::Shortcut { from, activation } => {
                let (index, source) = outputs.lookup(*from, block)?;
                (
                    format!("shortcut_{activation}: {}", index.0),
                    shortcut_layer(network, previous, source, *activation, block)?,
                )
            }
            LayerKind::Sam { from, activation } => {
                let (index, source) = outputs.lookup(*from, block)?;
                (
                    format!("sam_{activation}: {}", index.0),
                    sam_layer(network, previous, source, *activation)?,
                )
            }
            LayerKind::Route {
                layers,
                axis,
                group,
            } => {
                let mut indices = Vec::with_capacity(layers.len());
                let mut sources = Vec::with_capacity(layers.len());
                for reference in layers {
                    let (index, tensor) = outputs.lookup(*reference, block)?;
                    indices.push(index.0.to_string());
                    sources.push(tensor);
                }
                (
                    format!("route: {}", indices.join(",")),
                    route_layer(network, &sources, *axis, *group, block)?,
                )
            }
            LayerKind::Upsample { stride } => (
                format!("upsample: {stride}"),
                upsample_layer(network, previous, *stride)?,
            ),
            LayerKind::MaxPool { size, stride } => (
                format!("maxpool: {size}x{size}/{stride}"),
                maxpool_layer(network, previous, *size, *stride)?,
            ),
            LayerKind::AvgPool => ("avgpool".to_string(), avgpool_layer(network, previous)?),
            LayerKind::Reorg3d => (
                "reorg3d".to_string(),
                reorg3d_layer(network, previous, block)?,
            ),
            LayerKind::Reorg { stride } => (
                format!("reorg: {stride}"),
                reorg_layer(network, previous, *stride, block)?,
            ),
            LayerKind::Head { kind, head } => {
                let [_, channels, grid_h, grid_w] = input_shape.nchw()?;
                let info = heads
                    .get_mut(*head)
                    .with_context(|| format!("block {block}: missing head template {head}"))?;
                anyhow::ensure!(
                    channels == info.channels(),
                    "block {block}: {} head expects {} channels ({} boxes x (5 + {} classes)) but got {}",
                    kind.as_str(),
                    info.channels(),
                    info.num_bboxes,
                    info.num_classes,
                    channels
                );
                info.grid_height = grid_h;
                info.grid_width = grid_w;
                head_tensors.push(previous);
                outputs.push(previous);
                summary.push(summarize(
                    layer.index,
                    kind.as_str().to_string(),
                    &input_shape,
                    &input_shape,
                    cursor.position(),
                ));
                continue;
            }
            LayerKind::Dropout => ("dropout".to_string(), previous),
        };

        previous = output;
        outputs.push(output);
        let output_shape = network.shape(output)?;
        summary.push(summarize(
            layer.index,
            label,
            &input_shape,
            &output_shape,
            cursor.position(),
        ));
    }

    cursor.finish()?;
    let expected = config.head_block_count();
    if head_tensors.len() != expected {
        return Err(BuildError::HeadCountMismatch {
            expected,
            found: head_tensors.len(),
        }
        .into());
    }
    let outputs = if head_tensors.is_empty() {
        network.mark_output(previous, FEATURE_BLOB_NAME)?;
        NetworkOutputs::Features(previous)
    } else {
        let decode = YoloDecodeDesc::new(
            net.width,
            net.height,
            config.num_classes,
            config.new_coords,
            heads.clone(),
        );
        let produced = network.add_plugin(&head_tensors, Plugin::YoloDecode(decode))?;
        let &[boxes, scores, classes] = produced.as_slice() else {
            anyhow::bail!("decode node returned {} outputs, expected 3", produced.len());
        };
        for (tensor, name) in [boxes, scores, classes].into_iter().zip(OUTPUT_BLOB_NAMES) {
            network.mark_output(tensor, name)?;
        }
        NetworkOutputs::Decoded(DecodeOutputs {
            boxes,
            scores,
            classes,
        })
    };

    info!(
        "Built '{}': {} layers, {} heads, {} weights",
        config.model_name,
        summary.len(),
        heads.len(),
        cursor.position()
    );
    Ok(BuiltNetwork {
        input,
        heads,
        head_tensors,
        outputs,
        summary,
        weights_consumed: cursor.position(),
    })
}

fn summarize(
    index: usize,
    label: String,
    input: &TensorShape,
    output: &TensorShape,
    weight_ptr: usize,
) -> LayerSummary {
    debug!(
        "{:>4} {:<28} {:>16} -> {:<16} {:>10}",
        index,
        label,
        input.to_string(),
        output.to_string(),
        weight_ptr
    );
    LayerSummary {
        index,
        label,
        input_shape: input.dims().to_vec(),
        output_shape: output.dims().to_vec(),
        weight_ptr,
    }
}
