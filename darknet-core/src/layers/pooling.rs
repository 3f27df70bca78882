use anyhow::Result;

use crate::network::{NetworkDefinition, PoolDesc, PoolKind, TensorId};

/// Pre/post padding for a square max pool.
///
/// Symmetric `(size - 1) / 2` except for the `size=2, stride=1` case, which
/// pads only after the data so the output keeps the input size.
pub fn maxpool_padding(size: usize, stride: usize) -> ([usize; 2], [usize; 2]) {
    if size == 2 && stride == 1 {
        ([0, 0], [1, 1])
    } else {
        let pad = (size - 1) / 2;
        ([pad, pad], [pad, pad])
    }
}

/// `[maxpool]`.
pub fn maxpool_layer<N>(
    network: &mut N,
    input: TensorId,
    size: usize,
    stride: usize,
) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let (pre_padding, post_padding) = maxpool_padding(size, stride);
    network.add_pool(
        input,
        PoolDesc {
            kind: PoolKind::Max,
            window: [size, size],
            stride: [stride, stride],
            pre_padding,
            post_padding,
        },
    )
}

/// `[avgpool]`: global average over the current spatial extent.
pub fn avgpool_layer<N>(network: &mut N, input: TensorId) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let [_, _, h, w] = network.shape(input)?.nchw()?;
    network.add_pool(
        input,
        PoolDesc {
            kind: PoolKind::Average,
            window: [h, w],
            stride: [1, 1],
            pre_padding: [0, 0],
            post_padding: [0, 0],
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::test_support::{dims, graph_with_input};

    #[test]
    fn size_two_stride_one_pads_after() {
        assert_eq!(maxpool_padding(2, 1), ([0, 0], [1, 1]));
        assert_eq!(maxpool_padding(2, 2), ([0, 0], [0, 0]));
        assert_eq!(maxpool_padding(5, 1), ([2, 2], [2, 2]));

        let (mut graph, data) = graph_with_input(&[1, 3, 13, 13]);
        let same = maxpool_layer(&mut graph, data, 2, 1).expect("pool");
        assert_eq!(dims(&graph, same), vec![1, 3, 13, 13]);
        let half = maxpool_layer(&mut graph, data, 2, 2).expect("pool");
        assert_eq!(dims(&graph, half), vec![1, 3, 6, 6]);
    }

    #[test]
    fn global_average_collapses_spatial_dims() {
        let (mut graph, data) = graph_with_input(&[1, 5, 7, 9]);
        let out = avgpool_layer(&mut graph, data).expect("avg");
        assert_eq!(dims(&graph, out), vec![1, 5, 1, 1]);
    }
}
