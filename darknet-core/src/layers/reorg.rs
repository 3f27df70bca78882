use anyhow::Result;

use crate::network::{NetworkDefinition, SliceDesc, TensorId};

/// `[reorg3d]`: space-to-depth by 2 as four strided slices concatenated on channels.
///
/// Phases are taken in `(row, col)` order `(0,0)`, `(1,0)`, `(0,1)`, `(1,1)`.
pub fn reorg3d_layer<N>(network: &mut N, input: TensorId, block: usize) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let [n, c, h, w] = network.shape(input)?.nchw()?;
    anyhow::ensure!(
        h % 2 == 0 && w % 2 == 0,
        "block {block}: reorg3d needs even spatial dims (got {h}x{w})"
    );
    let mut phases = Vec::with_capacity(4);
    for (dy, dx) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
        phases.push(network.add_slice(
            input,
            SliceDesc {
                start: vec![0, 0, dy, dx],
                size: vec![n, c, h / 2, w / 2],
                stride: vec![1, 1, 2, 2],
            },
        )?);
    }
    network.add_concat(&phases, 1)
}

/// `[reorg]`: Darknet's space-to-depth with factor `stride`.
///
/// Darknet reads the input buffer as `[C / s², H·s, W·s]` and writes the result in
/// `[C, H, W]` order, which a reshape, a transpose and a final reshape reproduce.
pub fn reorg_layer<N>(
    network: &mut N,
    input: TensorId,
    stride: usize,
    block: usize,
) -> Result<TensorId>
where
    N: NetworkDefinition + ?Sized,
{
    let [n, c, h, w] = network.shape(input)?.nchw()?;
    let s = stride;
    anyhow::ensure!(
        c % (s * s) == 0 && h % s == 0 && w % s == 0,
        "block {block}: reorg stride {s} does not divide {c}x{h}x{w}"
    );
    let oc = c / (s * s);
    let viewed = network.add_reshape(input, vec![n, oc, h, s, w, s])?;
    let moved = network.add_transpose(viewed, vec![0, 3, 5, 1, 2, 4])?;
    network.add_reshape(moved, vec![n, c * s * s, h / s, w / s])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::Op,
        layers::test_support::{dims, graph_with_input},
    };

    #[test]
    fn reorg3d_slices_four_phases() {
        let (mut graph, data) = graph_with_input(&[1, 3, 8, 8]);
        let out = reorg3d_layer(&mut graph, data, 5).expect("reorg3d");
        assert_eq!(dims(&graph, out), vec![1, 12, 4, 4]);
        let starts: Vec<Vec<usize>> = graph
            .nodes()
            .iter()
            .filter_map(|node| match &node.op {
                Op::Slice(desc) => Some(desc.start.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            starts,
            vec![
                vec![0, 0, 0, 0],
                vec![0, 0, 1, 0],
                vec![0, 0, 0, 1],
                vec![0, 0, 1, 1],
            ]
        );
    }

    #[test]
    fn reorg_moves_space_into_channels() {
        let (mut graph, data) = graph_with_input(&[1, 64, 26, 26]);
        let out = reorg_layer(&mut graph, data, 2, 5).expect("reorg");
        assert_eq!(dims(&graph, out), vec![1, 256, 13, 13]);

        let (mut graph, data) = graph_with_input(&[1, 3, 26, 26]);
        assert!(reorg_layer(&mut graph, data, 2, 5).is_err());
    }
}
