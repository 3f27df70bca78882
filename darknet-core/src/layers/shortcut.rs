use anyhow::Result;
use log::debug;

use crate::{
    config::Activation,
    layers::activation_layer,
    network::{ElementwiseOp, NetworkDefinition, SliceDesc, TensorId},
};

/// `[shortcut]`: residual sum with the tensor at `from`.
///
/// When the two shapes differ the source is cropped to the current shape with a
/// unit-stride slice starting at the origin.
pub fn shortcut_layer<N>(
    network: &mut N,
    input: TensorId,
    from: TensorId,
    activation: Activation,
    block: usize,
) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let current = network.shape(input)?;
    let source = network.shape(from)?;
    let shortcut = if current != source {
        debug!("block {block}: slicing shortcut source {source} to {current}");
        let rank = current.rank();
        network.add_slice(
            from,
            SliceDesc {
                start: vec![0; rank],
                size: current.dims().to_vec(),
                stride: vec![1; rank],
            },
        )?
    } else {
        from
    };
    let sum = network.add_elementwise(shortcut, input, ElementwiseOp::Sum)?;
    activation_layer(network, sum, activation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::Op,
        layers::test_support::{dims, graph_with_input},
        network::{ActivationKind, TensorShape},
    };

    #[test]
    fn equal_shapes_need_no_slice() {
        let (mut graph, data) = graph_with_input(&[1, 4, 4, 4]);
        let relu = graph.add_activation(data, ActivationKind::Relu).unwrap();
        shortcut_layer(&mut graph, relu, data, Activation::Linear, 3).expect("shortcut");
        assert_eq!(graph.count_ops("slice"), 0);
        assert_eq!(graph.count_ops("elementwise"), 1);
    }

    #[test]
    fn mismatched_source_is_sliced_with_unit_stride() {
        let (mut graph, data) = graph_with_input(&[1, 2, 4, 4]);
        let wide = graph
            .add_constant(TensorShape::new(vec![1, 4, 4, 4]).unwrap(), vec![0.0; 64])
            .unwrap();
        let out = shortcut_layer(&mut graph, data, wide, Activation::Linear, 3).expect("shortcut");
        assert_eq!(dims(&graph, out), vec![1, 2, 4, 4]);
        let slice = graph
            .nodes()
            .iter()
            .find_map(|node| match &node.op {
                Op::Slice(desc) => Some(desc.clone()),
                _ => None,
            })
            .expect("slice node");
        assert_eq!(slice.stride, vec![1, 1, 1, 1]);
        assert_eq!(slice.start, vec![0, 0, 0, 0]);
        assert_eq!(slice.size, vec![1, 2, 4, 4]);
    }
}
