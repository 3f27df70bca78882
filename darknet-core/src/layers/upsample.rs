use anyhow::Result;

use crate::network::{NetworkDefinition, ResizeMode, TensorId};

/// `[upsample]`: nearest-neighbour resize by `stride` on both spatial axes.
pub fn upsample_layer<N>(network: &mut N, input: TensorId, stride: usize) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let factor = stride as f32;
    network.add_resize(input, ResizeMode::Nearest, vec![1.0, 1.0, factor, factor])
}
