use anyhow::Result;

use crate::network::{ElementwiseOp, NetworkDefinition, TensorId};

/// Which implicit-knowledge merge a block performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOp {
    /// `[shift_channels]`: add the implicit tensor.
    Shift,
    /// `[control_channels]`: multiply by the implicit tensor.
    Control,
}

/// Broadcast-merge `implicit` (`[1, C, 1, 1]`) into `input`.
///
/// The caller resolves `from` and checks that it names an implicit layer.
pub fn channels_layer<N>(
    network: &mut N,
    input: TensorId,
    implicit: TensorId,
    op: ChannelOp,
) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let elementwise = match op {
        ChannelOp::Shift => ElementwiseOp::Sum,
        ChannelOp::Control => ElementwiseOp::Prod,
    };
    network.add_elementwise(input, implicit, elementwise)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::Op,
        layers::test_support::{dims, graph_with_input},
        network::TensorShape,
    };

    #[test]
    fn merges_with_broadcast() {
        let (mut graph, data) = graph_with_input(&[1, 3, 4, 4]);
        let implicit = graph
            .add_constant(TensorShape::new(vec![1, 3, 1, 1]).unwrap(), vec![1.0; 3])
            .unwrap();
        let out = channels_layer(&mut graph, data, implicit, ChannelOp::Control).expect("control");
        assert_eq!(dims(&graph, out), vec![1, 3, 4, 4]);
        assert_eq!(
            graph.producer(out).map(|n| &n.op),
            Some(&Op::Elementwise(ElementwiseOp::Prod))
        );
    }
}
