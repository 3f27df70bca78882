use anyhow::Result;
use log::trace;

use crate::{
    config::ConvParams,
    layers::{activation_layer, batchnorm::read_batch_norm},
    network::{ConvolutionDesc, ConvolutionKind, NetworkDefinition, TensorId},
    weights::WeightCursor,
};

/// `[convolutional]` / `[deconvolutional]` with optional folded batch norm.
///
/// Weight order without batch norm: biases (when enabled), kernel. With batch
/// norm: biases, scales, rolling means, rolling variances, optional conv biases,
/// kernel.
pub fn convolutional_layer<N>(
    network: &mut N,
    cursor: &mut WeightCursor<'_>,
    input: TensorId,
    params: &ConvParams,
    kind: ConvolutionKind,
    block: usize,
) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let [_, channels, _, _] = network.shape(input)?.nchw()?;
    anyhow::ensure!(
        channels % params.groups == 0,
        "block {block}: {channels} channels cannot be split into {} groups",
        params.groups
    );
    let kernel_len = params.filters * channels * params.size * params.size / params.groups;
    let start = cursor.position();

    let (bias, batch_norm) = if params.batch_normalize {
        let folded = read_batch_norm(cursor, params.filters, block)?;
        let bias = if params.bias {
            Some(cursor.take_vec(params.filters, block)?)
        } else {
            None
        };
        (bias, Some(folded))
    } else if params.bias {
        (Some(cursor.take_vec(params.filters, block)?), None)
    } else {
        (None, None)
    };
    let weights = cursor.take_vec(kernel_len, block)?;
    trace!(
        "block {block}: {} weights [{start}, {})",
        cursor.position() - start,
        cursor.position()
    );

    let conv = network.add_convolution(
        input,
        ConvolutionDesc {
            kind,
            filters: params.filters,
            kernel: params.size,
            stride: params.stride,
            padding: params.padding,
            groups: params.groups,
            weights,
            bias,
        },
    )?;
    let normalized = match batch_norm {
        Some(scale) => network.add_scale(conv, scale)?,
        None => conv,
    };
    activation_layer(network, normalized, params.activation)
}
