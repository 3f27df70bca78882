use anyhow::Result;

use crate::{
    config::Activation,
    network::{ActivationKind, ElementwiseOp, NetworkDefinition, TensorId},
};

const LEAKY_SLOPE: f32 = 0.1;
const HARD_SIGMOID_ALPHA: f32 = 1.0 / 6.0;
const HARD_SIGMOID_BETA: f32 = 0.5;

/// Apply `activation` to `input`. `linear` adds nothing and returns `input`.
///
/// Mish, SiLU and hard-swish have no primitive node and are composed as
/// `x * f(x)` with an elementwise product.
pub fn activation_layer<N>(
    network: &mut N,
    input: TensorId,
    activation: Activation,
) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    match activation {
        Activation::Linear => Ok(input),
        Activation::Relu => network.add_activation(input, ActivationKind::Relu),
        Activation::Logistic => network.add_activation(input, ActivationKind::Sigmoid),
        Activation::Tanh => network.add_activation(input, ActivationKind::Tanh),
        Activation::Softplus => network.add_activation(input, ActivationKind::Softplus),
        Activation::Leaky => network.add_activation(
            input,
            ActivationKind::LeakyRelu { alpha: LEAKY_SLOPE },
        ),
        Activation::HardSigmoid => network.add_activation(input, hard_sigmoid()),
        Activation::Mish => {
            let softplus = network.add_activation(input, ActivationKind::Softplus)?;
            let tanh = network.add_activation(softplus, ActivationKind::Tanh)?;
            network.add_elementwise(input, tanh, ElementwiseOp::Prod)
        }
        Activation::Silu => {
            let gate = network.add_activation(input, ActivationKind::Sigmoid)?;
            network.add_elementwise(input, gate, ElementwiseOp::Prod)
        }
        Activation::HardSwish => {
            let gate = network.add_activation(input, hard_sigmoid())?;
            network.add_elementwise(input, gate, ElementwiseOp::Prod)
        }
    }
}

fn hard_sigmoid() -> ActivationKind {
    ActivationKind::HardSigmoid {
        alpha: HARD_SIGMOID_ALPHA,
        beta: HARD_SIGMOID_BETA,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::test_support::graph_with_input;

    #[test]
    fn linear_adds_no_nodes() {
        let (mut graph, data) = graph_with_input(&[1, 2, 4, 4]);
        let out = activation_layer(&mut graph, data, Activation::Linear).expect("linear");
        assert_eq!(out, data);
        assert_eq!(graph.nodes().len(), 1);
    }

    #[test]
    fn composite_activations_end_in_products() {
        for (activation, nodes) in [
            (Activation::Mish, 3),
            (Activation::Silu, 2),
            (Activation::HardSwish, 2),
            (Activation::Leaky, 1),
        ] {
            let (mut graph, data) = graph_with_input(&[1, 2, 4, 4]);
            activation_layer(&mut graph, data, activation).expect("activation");
            assert_eq!(graph.nodes().len() - 1, nodes, "{activation}");
        }
    }
}
