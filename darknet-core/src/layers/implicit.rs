use anyhow::Result;

use crate::{
    network::{NetworkDefinition, TensorId, TensorShape},
    weights::WeightCursor,
};

/// `[implicit*]`: a learned `[1, filters, 1, 1]` constant.
pub fn implicit_layer<N>(
    network: &mut N,
    cursor: &mut WeightCursor<'_>,
    filters: usize,
    block: usize,
) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let values = cursor.take_vec(filters, block)?;
    network.add_constant(TensorShape::new(vec![1, filters, 1, 1])?, values)
}
