use anyhow::Result;

use crate::{
    config::RouteGroup,
    network::{NetworkDefinition, SliceDesc, TensorId},
};

/// `[route]` over already-resolved source tensors.
///
/// One source is passed through untouched. Several are concatenated on
/// `axis + 1` (the batch axis is implicit in cfg axes); negative axes count
/// from the end of the tensor rank. A `groups` split then keeps channel slice
/// `group_id` of `groups`.
pub fn route_layer<N>(
    network: &mut N,
    sources: &[TensorId],
    axis: i64,
    group: Option<RouteGroup>,
    block: usize,
) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let Some(&first) = sources.first() else {
        anyhow::bail!("block {block}: route has no sources");
    };
    let routed = if sources.len() == 1 {
        first
    } else {
        let rank = network.shape(first)?.rank();
        network.add_concat(sources, concat_axis(axis, rank, block)?)?
    };

    let Some(RouteGroup { groups, group_id }) = group else {
        return Ok(routed);
    };
    let [n, c, h, w] = network.shape(routed)?.nchw()?;
    anyhow::ensure!(
        c % groups == 0,
        "block {block}: {c} routed channels cannot be split into {groups} groups"
    );
    let size = c / groups;
    network.add_slice(
        routed,
        SliceDesc {
            start: vec![0, group_id * size, 0, 0],
            size: vec![n, size, h, w],
            stride: vec![1, 1, 1, 1],
        },
    )
}

fn concat_axis(axis: i64, rank: usize, block: usize) -> Result<usize> {
    let resolved = if axis < 0 {
        rank as i64 + axis
    } else {
        axis + 1
    };
    anyhow::ensure!(
        (1..rank as i64).contains(&resolved),
        "block {block}: route axis {axis} is out of range for rank {rank}"
    );
    Ok(resolved as usize)
}
