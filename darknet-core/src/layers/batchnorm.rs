use anyhow::Result;

use crate::{
    config::Activation,
    layers::activation_layer,
    network::{ChannelScale, NetworkDefinition, TensorId},
    weights::WeightCursor,
};

const BN_EPSILON: f32 = 1.0e-5;

/// Fold running statistics into a per-channel affine node.
///
/// `y = (x - mean) / sqrt(var + eps) * scale + bias` becomes
/// `y = x * (scale / std) + (bias - mean * scale / std)`.
pub fn fold_batch_norm(
    biases: &[f32],
    scales: &[f32],
    means: &[f32],
    variances: &[f32],
) -> ChannelScale {
    let mut shift = Vec::with_capacity(biases.len());
    let mut scale = Vec::with_capacity(biases.len());
    for (((bias, gamma), mean), var) in biases.iter().zip(scales).zip(means).zip(variances) {
        let std = (var + BN_EPSILON).sqrt();
        shift.push(bias - mean * gamma / std);
        scale.push(gamma / std);
    }
    let power = vec![1.0; shift.len()];
    ChannelScale {
        shift,
        scale,
        power,
    }
}

/// Read `channels` x (biases, scales, means, variances) and fold them.
pub(crate) fn read_batch_norm(
    cursor: &mut WeightCursor<'_>,
    channels: usize,
    block: usize,
) -> Result<ChannelScale> {
    let biases = cursor.take(channels, block)?;
    let scales = cursor.take(channels, block)?;
    let means = cursor.take(channels, block)?;
    let variances = cursor.take(channels, block)?;
    Ok(fold_batch_norm(biases, scales, means, variances))
}

/// Standalone `[batchnorm]` over the current channels.
pub fn batchnorm_layer<N>(
    network: &mut N,
    cursor: &mut WeightCursor<'_>,
    input: TensorId,
    activation: Activation,
    block: usize,
) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let [_, channels, _, _] = network.shape(input)?.nchw()?;
    let scale = read_batch_norm(cursor, channels, block)?;
    let normalized = network.add_scale(input, scale)?;
    activation_layer(network, normalized, activation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{layers::test_support::graph_with_input, weights::WeightBuffer};

    #[test]
    fn folds_statistics_into_shift_and_scale() {
        let folded = fold_batch_norm(&[1.0], &[2.0], &[3.0], &[4.0 - BN_EPSILON]);
        assert!((folded.scale[0] - 1.0).abs() < 1e-6);
        assert!((folded.shift[0] - (1.0 - 3.0)).abs() < 1e-6);
        assert_eq!(folded.power, vec![1.0]);
    }

    #[test]
    fn consumes_four_arrays_per_channel() {
        let (mut graph, data) = graph_with_input(&[1, 2, 3, 3]);
        let buffer = WeightBuffer::from_values(vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
        let mut cursor = buffer.cursor();
        batchnorm_layer(&mut graph, &mut cursor, data, Activation::Relu, 1).expect("bn");
        assert!(cursor.finish().is_ok());
        assert_eq!(graph.count_ops("scale"), 1);
        assert_eq!(graph.count_ops("activation"), 1);
    }
}
