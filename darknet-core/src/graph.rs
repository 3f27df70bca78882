//! In-memory [`NetworkDefinition`] that records nodes and infers shapes.
//!
//! `NetworkGraph` is what the builder targets when no accelerator is attached:
//! it validates every node the way a backend would, answers shape queries and
//! keeps the node list around for inspection and for [`crate::runtime::CpuRuntime`].

use anyhow::{Context, Result, anyhow};
use log::trace;

use crate::network::{
    ActivationKind, ChannelScale, ConvolutionDesc, ConvolutionKind, ElementwiseOp,
    NetworkDefinition, Plugin, PoolDesc, ResizeMode, SliceDesc, TensorId, TensorShape,
};

/// Operation carried by a [`Node`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Input { name: String },
    Convolution(ConvolutionDesc),
    Scale(ChannelScale),
    Elementwise(ElementwiseOp),
    Activation(ActivationKind),
    Constant { values: Vec<f32> },
    Concat { axis: usize },
    Slice(SliceDesc),
    Resize { mode: ResizeMode, scales: Vec<f32> },
    Pool(PoolDesc),
    Reshape { dims: Vec<usize> },
    Transpose { perm: Vec<usize> },
    Plugin(Plugin),
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Convolution(desc) => match desc.kind {
                ConvolutionKind::Convolution => "convolution",
                ConvolutionKind::Deconvolution => "deconvolution",
            },
            Op::Scale(_) => "scale",
            Op::Elementwise(_) => "elementwise",
            Op::Activation(_) => "activation",
            Op::Constant { .. } => "constant",
            Op::Concat { .. } => "concat",
            Op::Slice(_) => "slice",
            Op::Resize { .. } => "resize",
            Op::Pool(_) => "pool",
            Op::Reshape { .. } => "reshape",
            Op::Transpose { .. } => "transpose",
            Op::Plugin(plugin) => plugin.name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub op: Op,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
}

#[derive(Debug, Clone, PartialEq)]
struct TensorEntry {
    shape: TensorShape,
    producer: usize,
}

/// Recorded network: nodes in insertion order (always topological) plus tensor shapes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkGraph {
    nodes: Vec<Node>,
    tensors: Vec<TensorEntry>,
    inputs: Vec<(String, TensorId)>,
    outputs: Vec<(String, TensorId)>,
}

impl NetworkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn inputs(&self) -> &[(String, TensorId)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[(String, TensorId)] {
        &self.outputs
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Node that produced `tensor`.
    pub fn producer(&self, tensor: TensorId) -> Option<&Node> {
        self.tensors
            .get(tensor.index())
            .and_then(|entry| self.nodes.get(entry.producer))
    }

    /// Number of nodes whose [`Op::name`] equals `name`.
    pub fn count_ops(&self, name: &str) -> usize {
        self.nodes.iter().filter(|node| node.op.name() == name).count()
    }

    /// Sum of all weight, bias, scale and constant values held by the graph.
    pub fn parameter_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| match &node.op {
                Op::Convolution(desc) => {
                    desc.weights.len() + desc.bias.as_ref().map_or(0, Vec::len)
                }
                Op::Scale(scale) => scale.shift.len() + scale.scale.len(),
                Op::Constant { values } => values.len(),
                _ => 0,
            })
            .sum()
    }

    fn entry(&self, tensor: TensorId) -> Result<&TensorEntry> {
        self.tensors
            .get(tensor.index())
            .ok_or_else(|| anyhow!("unknown tensor {tensor}"))
    }

    fn push(&mut self, op: Op, inputs: Vec<TensorId>, shapes: Vec<TensorShape>) -> Vec<TensorId> {
        let producer = self.nodes.len();
        let outputs: Vec<TensorId> = shapes
            .into_iter()
            .map(|shape| {
                self.tensors.push(TensorEntry { shape, producer });
                TensorId::new(self.tensors.len() - 1)
            })
            .collect();
        trace!("node {} {} -> {:?}", producer, op.name(), outputs);
        self.nodes.push(Node {
            op,
            inputs,
            outputs: outputs.clone(),
        });
        outputs
    }

    fn push_single(&mut self, op: Op, inputs: Vec<TensorId>, shape: TensorShape) -> TensorId {
        self.push(op, inputs, vec![shape])[0]
    }
}

/// Output extent of a sliding window; `None` when the window does not fit.
pub(crate) fn window_output(input: usize, padding: usize, window: usize, stride: usize) -> Option<usize> {
    (input + padding)
        .checked_sub(window)
        .map(|span| span / stride + 1)
}

impl NetworkDefinition for NetworkGraph {
    fn add_input(&mut self, name: &str, shape: TensorShape) -> Result<TensorId> {
        anyhow::ensure!(
            !self.inputs.iter().any(|(existing, _)| existing == name),
            "duplicate input '{name}'"
        );
        let id = self.push_single(
            Op::Input {
                name: name.to_string(),
            },
            Vec::new(),
            shape,
        );
        self.inputs.push((name.to_string(), id));
        Ok(id)
    }

    fn add_convolution(&mut self, input: TensorId, desc: ConvolutionDesc) -> Result<TensorId> {
        let [n, c, h, w] = self.entry(input)?.shape.nchw()?;
        let (k, s, p, g) = (desc.kernel, desc.stride, desc.padding, desc.groups);
        anyhow::ensure!(
            k > 0 && s > 0 && g > 0 && desc.filters > 0,
            "convolution kernel, stride, groups and filters must be positive"
        );
        anyhow::ensure!(
            c % g == 0 && desc.filters % g == 0,
            "{c} input channels and {} filters are not divisible into {g} groups",
            desc.filters
        );
        let expected = desc.filters * (c / g) * k * k;
        anyhow::ensure!(
            desc.weights.len() == expected,
            "convolution expects {expected} kernel weights (got {})",
            desc.weights.len()
        );
        if let Some(bias) = &desc.bias {
            anyhow::ensure!(
                bias.len() == desc.filters,
                "convolution expects {} biases (got {})",
                desc.filters,
                bias.len()
            );
        }
        let (out_h, out_w) = match desc.kind {
            ConvolutionKind::Convolution => (
                window_output(h, 2 * p, k, s),
                window_output(w, 2 * p, k, s),
            ),
            ConvolutionKind::Deconvolution => (
                ((h - 1) * s + k).checked_sub(2 * p),
                ((w - 1) * s + k).checked_sub(2 * p),
            ),
        };
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            anyhow::bail!("{k}x{k} kernel does not fit a {h}x{w} input with padding {p}");
        };
        let shape = TensorShape::new(vec![n, desc.filters, out_h, out_w])?;
        Ok(self.push_single(Op::Convolution(desc), vec![input], shape))
    }

    fn add_scale(&mut self, input: TensorId, scale: ChannelScale) -> Result<TensorId> {
        let shape = self.entry(input)?.shape.clone();
        let [_, c, _, _] = shape.nchw()?;
        for (label, values) in [
            ("shift", &scale.shift),
            ("scale", &scale.scale),
            ("power", &scale.power),
        ] {
            anyhow::ensure!(
                values.is_empty() || values.len() == c,
                "channel {label} has {} values for {c} channels",
                values.len()
            );
        }
        Ok(self.push_single(Op::Scale(scale), vec![input], shape))
    }

    fn add_elementwise(
        &mut self,
        lhs: TensorId,
        rhs: TensorId,
        op: ElementwiseOp,
    ) -> Result<TensorId> {
        let a = self.entry(lhs)?.shape.dims().to_vec();
        let b = self.entry(rhs)?.shape.dims().to_vec();
        anyhow::ensure!(
            a.len() == b.len(),
            "elementwise operands differ in rank ({a:?} vs {b:?})"
        );
        let dims = a
            .iter()
            .zip(&b)
            .map(|(&x, &y)| match (x, y) {
                _ if x == y => Ok(x),
                (1, other) | (other, 1) => Ok(other),
                _ => Err(anyhow!("elementwise operands do not broadcast ({a:?} vs {b:?})")),
            })
            .collect::<Result<Vec<_>>>()?;
        let shape = TensorShape::new(dims)?;
        Ok(self.push_single(Op::Elementwise(op), vec![lhs, rhs], shape))
    }

    fn add_activation(&mut self, input: TensorId, kind: ActivationKind) -> Result<TensorId> {
        let shape = self.entry(input)?.shape.clone();
        Ok(self.push_single(Op::Activation(kind), vec![input], shape))
    }

    fn add_constant(&mut self, shape: TensorShape, values: Vec<f32>) -> Result<TensorId> {
        anyhow::ensure!(
            values.len() == shape.elements(),
            "constant of shape {shape} needs {} values (got {})",
            shape.elements(),
            values.len()
        );
        Ok(self.push_single(Op::Constant { values }, Vec::new(), shape))
    }

    fn add_concat(&mut self, inputs: &[TensorId], axis: usize) -> Result<TensorId> {
        let first = inputs
            .first()
            .ok_or_else(|| anyhow!("concat needs at least one input"))?;
        let mut dims = self.entry(*first)?.shape.dims().to_vec();
        anyhow::ensure!(
            axis < dims.len(),
            "concat axis {axis} out of range for rank {}",
            dims.len()
        );
        for tensor in &inputs[1..] {
            let other = self.entry(*tensor)?.shape.dims();
            let compatible = other.len() == dims.len()
                && other
                    .iter()
                    .zip(&dims)
                    .enumerate()
                    .all(|(i, (x, y))| i == axis || x == y);
            anyhow::ensure!(
                compatible,
                "cannot concatenate {other:?} with {dims:?} on axis {axis}"
            );
            dims[axis] += other[axis];
        }
        let shape = TensorShape::new(dims)?;
        Ok(self.push_single(Op::Concat { axis }, inputs.to_vec(), shape))
    }

    fn add_slice(&mut self, input: TensorId, desc: SliceDesc) -> Result<TensorId> {
        let dims = self.entry(input)?.shape.dims().to_vec();
        anyhow::ensure!(
            desc.start.len() == dims.len()
                && desc.size.len() == dims.len()
                && desc.stride.len() == dims.len(),
            "slice rank does not match input {dims:?}"
        );
        for axis in 0..dims.len() {
            let (start, size, stride) = (desc.start[axis], desc.size[axis], desc.stride[axis]);
            anyhow::ensure!(size > 0 && stride > 0, "slice size and stride must be positive");
            let last = start + (size - 1) * stride;
            anyhow::ensure!(
                last < dims[axis],
                "slice reaches index {last} on axis {axis} of {dims:?}"
            );
        }
        let shape = TensorShape::new(desc.size.clone())?;
        Ok(self.push_single(Op::Slice(desc), vec![input], shape))
    }

    fn add_resize(
        &mut self,
        input: TensorId,
        mode: ResizeMode,
        scales: Vec<f32>,
    ) -> Result<TensorId> {
        let dims = self.entry(input)?.shape.dims().to_vec();
        anyhow::ensure!(
            scales.len() == dims.len(),
            "resize needs one scale per axis of {dims:?}"
        );
        let out: Vec<usize> = dims
            .iter()
            .zip(&scales)
            .map(|(&d, &s)| (d as f32 * s).floor() as usize)
            .collect();
        let shape = TensorShape::new(out).context("resize produced an empty tensor")?;
        Ok(self.push_single(Op::Resize { mode, scales }, vec![input], shape))
    }

    fn add_pool(&mut self, input: TensorId, desc: PoolDesc) -> Result<TensorId> {
        let [n, c, h, w] = self.entry(input)?.shape.nchw()?;
        anyhow::ensure!(
            desc.window.iter().chain(&desc.stride).all(|&v| v > 0),
            "pool window and stride must be positive"
        );
        let out_h = window_output(
            h,
            desc.pre_padding[0] + desc.post_padding[0],
            desc.window[0],
            desc.stride[0],
        );
        let out_w = window_output(
            w,
            desc.pre_padding[1] + desc.post_padding[1],
            desc.window[1],
            desc.stride[1],
        );
        let (Some(out_h), Some(out_w)) = (out_h, out_w) else {
            anyhow::bail!(
                "{:?} pool window does not fit a {h}x{w} input",
                desc.window
            );
        };
        let shape = TensorShape::new(vec![n, c, out_h, out_w])?;
        Ok(self.push_single(Op::Pool(desc), vec![input], shape))
    }

    fn add_reshape(&mut self, input: TensorId, dims: Vec<usize>) -> Result<TensorId> {
        let from = self.entry(input)?.shape.clone();
        let shape = TensorShape::new(dims.clone())?;
        anyhow::ensure!(
            shape.elements() == from.elements(),
            "cannot reshape {from} into {shape}"
        );
        Ok(self.push_single(Op::Reshape { dims }, vec![input], shape))
    }

    fn add_transpose(&mut self, input: TensorId, perm: Vec<usize>) -> Result<TensorId> {
        let dims = self.entry(input)?.shape.dims().to_vec();
        let mut seen = vec![false; dims.len()];
        anyhow::ensure!(perm.len() == dims.len(), "permutation {perm:?} has the wrong rank");
        for &axis in &perm {
            anyhow::ensure!(
                axis < dims.len() && !seen[axis],
                "{perm:?} is not a permutation"
            );
            seen[axis] = true;
        }
        let shape = TensorShape::new(perm.iter().map(|&axis| dims[axis]).collect::<Vec<_>>())?;
        Ok(self.push_single(Op::Transpose { perm }, vec![input], shape))
    }

    fn add_plugin(&mut self, inputs: &[TensorId], plugin: Plugin) -> Result<Vec<TensorId>> {
        let shapes = inputs
            .iter()
            .map(|tensor| self.entry(*tensor).map(|entry| entry.shape.clone()))
            .collect::<Result<Vec<_>>>()?;
        let outputs = match &plugin {
            Plugin::YoloDecode(desc) => desc.output_shapes(&shapes)?.to_vec(),
        };
        Ok(self.push(Op::Plugin(plugin), inputs.to_vec(), outputs))
    }

    fn mark_output(&mut self, tensor: TensorId, name: &str) -> Result<()> {
        self.entry(tensor)?;
        anyhow::ensure!(
            !self.outputs.iter().any(|(existing, _)| existing == name),
            "duplicate output '{name}'"
        );
        self.outputs.push((name.to_string(), tensor));
        Ok(())
    }

    fn shape(&self, tensor: TensorId) -> Result<TensorShape> {
        Ok(self.entry(tensor)?.shape.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::PoolKind;

    fn shape(dims: &[usize]) -> TensorShape {
        TensorShape::new(dims.to_vec()).expect("shape")
    }

    fn input(graph: &mut NetworkGraph, dims: &[usize]) -> TensorId {
        graph.add_input("data", shape(dims)).expect("input")
    }

    #[test]
    fn convolution_shapes_follow_padding_and_stride() {
        let mut graph = NetworkGraph::new();
        let data = input(&mut graph, &[1, 3, 8, 8]);
        let conv = graph
            .add_convolution(
                data,
                ConvolutionDesc {
                    kind: ConvolutionKind::Convolution,
                    filters: 4,
                    kernel: 3,
                    stride: 2,
                    padding: 1,
                    groups: 1,
                    weights: vec![0.0; 4 * 3 * 9],
                    bias: Some(vec![0.0; 4]),
                },
            )
            .expect("conv");
        assert_eq!(graph.shape(conv).unwrap().dims(), &[1, 4, 4, 4]);

        let deconv = graph
            .add_convolution(
                conv,
                ConvolutionDesc {
                    kind: ConvolutionKind::Deconvolution,
                    filters: 2,
                    kernel: 2,
                    stride: 2,
                    padding: 0,
                    groups: 1,
                    weights: vec![0.0; 4 * 2 * 4],
                    bias: None,
                },
            )
            .expect("deconv");
        assert_eq!(graph.shape(deconv).unwrap().dims(), &[1, 2, 8, 8]);
        assert_eq!(graph.parameter_count(), 108 + 4 + 32);
    }

    #[test]
    fn convolution_rejects_wrong_weight_count() {
        let mut graph = NetworkGraph::new();
        let data = input(&mut graph, &[1, 3, 8, 8]);
        let err = graph
            .add_convolution(
                data,
                ConvolutionDesc {
                    kind: ConvolutionKind::Convolution,
                    filters: 4,
                    kernel: 3,
                    stride: 1,
                    padding: 1,
                    groups: 1,
                    weights: vec![0.0; 10],
                    bias: None,
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("kernel weights"));
    }

    #[test]
    fn elementwise_broadcasts_unit_dims() {
        let mut graph = NetworkGraph::new();
        let data = input(&mut graph, &[1, 4, 5, 5]);
        let bias = graph
            .add_constant(shape(&[1, 4, 1, 1]), vec![1.0; 4])
            .expect("constant");
        let sum = graph
            .add_elementwise(data, bias, ElementwiseOp::Sum)
            .expect("sum");
        assert_eq!(graph.shape(sum).unwrap().dims(), &[1, 4, 5, 5]);

        let other = graph
            .add_constant(shape(&[1, 3, 1, 1]), vec![1.0; 3])
            .expect("constant");
        assert!(graph.add_elementwise(data, other, ElementwiseOp::Prod).is_err());
    }

    #[test]
    fn concat_slice_and_pool_shapes() {
        let mut graph = NetworkGraph::new();
        let data = input(&mut graph, &[1, 4, 6, 6]);
        let cat = graph.add_concat(&[data, data], 1).expect("concat");
        assert_eq!(graph.shape(cat).unwrap().dims(), &[1, 8, 6, 6]);

        let half = graph
            .add_slice(
                cat,
                SliceDesc {
                    start: vec![0, 0, 1, 0],
                    size: vec![1, 8, 3, 3],
                    stride: vec![1, 1, 2, 2],
                },
            )
            .expect("slice");
        assert_eq!(graph.shape(half).unwrap().dims(), &[1, 8, 3, 3]);
        assert!(
            graph
                .add_slice(
                    cat,
                    SliceDesc {
                        start: vec![0, 0, 1, 0],
                        size: vec![1, 8, 4, 3],
                        stride: vec![1, 1, 2, 2],
                    },
                )
                .is_err()
        );

        let pooled = graph
            .add_pool(
                data,
                PoolDesc {
                    kind: PoolKind::Max,
                    window: [2, 2],
                    stride: [1, 1],
                    pre_padding: [0, 0],
                    post_padding: [1, 1],
                },
            )
            .expect("pool");
        assert_eq!(graph.shape(pooled).unwrap().dims(), &[1, 4, 6, 6]);
        assert_eq!(graph.count_ops("pool"), 1);
        assert_eq!(graph.producer(pooled).map(|n| n.op.name()), Some("pool"));
    }

    #[test]
    fn reshape_transpose_and_resize() {
        let mut graph = NetworkGraph::new();
        let data = input(&mut graph, &[1, 2, 4, 6]);
        let reshaped = graph.add_reshape(data, vec![1, 2, 2, 2, 3, 2]).expect("reshape");
        let moved = graph
            .add_transpose(reshaped, vec![0, 3, 5, 1, 2, 4])
            .expect("transpose");
        assert_eq!(graph.shape(moved).unwrap().dims(), &[1, 2, 2, 2, 2, 3]);
        assert!(graph.add_transpose(reshaped, vec![0, 0, 1, 2, 3, 4]).is_err());
        assert!(graph.add_reshape(data, vec![1, 5]).is_err());

        let up = graph
            .add_resize(data, ResizeMode::Nearest, vec![1.0, 1.0, 2.0, 2.0])
            .expect("resize");
        assert_eq!(graph.shape(up).unwrap().dims(), &[1, 2, 8, 12]);
    }

    #[test]
    fn outputs_are_named_once() {
        let mut graph = NetworkGraph::new();
        let data = input(&mut graph, &[1, 1, 2, 2]);
        graph.mark_output(data, "out").expect("mark");
        assert!(graph.mark_output(data, "out").is_err());
        assert!(graph.mark_output(TensorId::new(42), "other").is_err());
        assert_eq!(graph.outputs().len(), 1);
        assert_eq!(graph.inputs()[0].0, "data");
    }
}
