use anyhow::Result;

use crate::{
    config::Activation,
    layers::activation_layer,
    network::{ElementwiseOp, NetworkDefinition, TensorId},
};

/// `[sam]`: spatial attention, `input * attention`, then the block's activation.
pub fn sam_layer<N>(
    network: &mut N,
    input: TensorId,
    attention: TensorId,
    activation: Activation,
) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let product = network.add_elementwise(input, attention, ElementwiseOp::Prod)?;
    activation_layer(network, product, activation)
}
