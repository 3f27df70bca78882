//! Reference CPU evaluator for a recorded [`NetworkGraph`].
//!
//! Nodes run in insertion order on `ndarray` tensors. Convolutions fan out over
//! `(batch, output channel)` planes with `rayon`; everything else is a plain
//! single-threaded loop. The decode node uses the same arithmetic as the
//! accelerator plugin.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use log::{Level, trace};
use ndarray::{Array4, ArrayD, ArrayView4, Axis, Ix4, IxDyn, Slice, concatenate};
use rayon::prelude::*;

use crate::{
    graph::{NetworkGraph, Node, Op},
    network::{
        ActivationKind, ChannelScale, ConvolutionDesc, ConvolutionKind, ElementwiseOp,
        NetworkDefinition, Plugin, PoolDesc, PoolKind, SliceDesc, TensorId,
    },
};
use darknet_utils::timing_guard;

/// Named outputs of one [`CpuRuntime::run`] call.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOutputs {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl RuntimeOutputs {
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    /// Fetch an output, failing with its name when it is missing.
    pub fn require(&self, name: &str) -> Result<&ArrayD<f32>> {
        self.get(name)
            .with_context(|| format!("network has no output named '{name}'"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

/// Executes a [`NetworkGraph`] on the CPU.
#[derive(Debug, Clone)]
pub struct CpuRuntime {
    graph: NetworkGraph,
}

impl CpuRuntime {
    pub fn new(graph: NetworkGraph) -> Self {
        Self { graph }
    }

    pub fn graph(&self) -> &NetworkGraph {
        &self.graph
    }

    /// Run a graph that has exactly one input.
    pub fn run(&self, input: ArrayD<f32>) -> Result<RuntimeOutputs> {
        self.run_observed(input, |_, _, _| {})
    }

    /// Like [`Self::run`], handing every intermediate tensor to `observer` as it is produced.
    pub fn run_observed<F>(&self, input: ArrayD<f32>, observer: F) -> Result<RuntimeOutputs>
    where
        F: FnMut(&Node, TensorId, &ArrayD<f32>),
    {
        let [(name, _)] = self.graph.inputs() else {
            anyhow::bail!(
                "graph has {} inputs; use run_named",
                self.graph.inputs().len()
            );
        };
        self.execute(vec![(name.clone(), input)], observer)
    }

    /// Run with inputs bound by name.
    pub fn run_named(&self, inputs: Vec<(String, ArrayD<f32>)>) -> Result<RuntimeOutputs> {
        self.execute(inputs, |_, _, _| {})
    }

    fn execute<F>(
        &self,
        inputs: Vec<(String, ArrayD<f32>)>,
        mut observer: F,
    ) -> Result<RuntimeOutputs>
    where
        F: FnMut(&Node, TensorId, &ArrayD<f32>),
    {
        let _guard = timing_guard("darknet_core::cpu_runtime", Level::Debug);
        let mut feeds: BTreeMap<String, ArrayD<f32>> = inputs.into_iter().collect();
        let mut values: Vec<Option<ArrayD<f32>>> = vec![None; self.graph.tensor_count()];

        for (idx, node) in self.graph.nodes().iter().enumerate() {
            let produced = self
                .eval(node, &values, &mut feeds)
                .with_context(|| format!("node {idx} ({}) failed", node.op.name()))?;
            anyhow::ensure!(
                produced.len() == node.outputs.len(),
                "node {idx} produced {} tensors, expected {}",
                produced.len(),
                node.outputs.len()
            );
            for (tensor, value) in node.outputs.iter().zip(produced) {
                let expected = self.graph.shape(*tensor)?;
                anyhow::ensure!(
                    value.shape() == expected.dims(),
                    "node {idx} ({}) produced {:?}, graph expects {}",
                    node.op.name(),
                    value.shape(),
                    expected
                );
                observer(node, *tensor, &value);
                values[tensor.index()] = Some(value);
            }
            trace!("evaluated node {idx} {}", node.op.name());
        }

        let mut tensors = BTreeMap::new();
        for (name, tensor) in self.graph.outputs() {
            let value = values[tensor.index()]
                .clone()
                .with_context(|| format!("output '{name}' was never computed"))?;
            tensors.insert(name.clone(), value);
        }
        Ok(RuntimeOutputs { tensors })
    }

    fn eval(
        &self,
        node: &Node,
        values: &[Option<ArrayD<f32>>],
        feeds: &mut BTreeMap<String, ArrayD<f32>>,
    ) -> Result<Vec<ArrayD<f32>>> {
        let arg = |i: usize| operand(node, values, i);
        let out_dims = |i: usize| -> Result<Vec<usize>> {
            Ok(self.graph.shape(node.outputs[i])?.dims().to_vec())
        };

        let value = match &node.op {
            Op::Input { name } => feeds
                .remove(name)
                .with_context(|| format!("no value bound for input '{name}'"))?,
            Op::Convolution(desc) => convolution(arg(0)?, desc, &out_dims(0)?)?,
            Op::Scale(scale) => channel_scale(arg(0)?, scale),
            Op::Elementwise(op) => {
                let (lhs, rhs) = (arg(0)?, arg(1)?);
                match op {
                    ElementwiseOp::Sum => lhs + rhs,
                    ElementwiseOp::Prod => lhs * rhs,
                }
            }
            Op::Activation(kind) => {
                let kind = *kind;
                arg(0)?.mapv(|x| activate(kind, x))
            }
            Op::Constant { values } => {
                ArrayD::from_shape_vec(IxDyn(&out_dims(0)?), values.clone())?
            }
            Op::Concat { axis } => {
                let views = (0..node.inputs.len())
                    .map(|i| arg(i).map(|value| value.view()))
                    .collect::<Result<Vec<_>>>()?;
                concatenate(Axis(*axis), &views)?
            }
            Op::Slice(desc) => slice(arg(0)?, desc),
            Op::Resize { scales, .. } => resize_nearest(arg(0)?, scales, &out_dims(0)?),
            Op::Pool(desc) => pool(arg(0)?, desc, &out_dims(0)?)?,
            Op::Reshape { dims } => arg(0)?
                .as_standard_layout()
                .into_owned()
                .into_shape_with_order(IxDyn(dims))?,
            Op::Transpose { perm } => arg(0)?
                .view()
                .permuted_axes(IxDyn(perm))
                .as_standard_layout()
                .into_owned(),
            Op::Plugin(Plugin::YoloDecode(desc)) => {
                let views = (0..node.inputs.len())
                    .map(|i| arg(i).and_then(|v| Ok(v.view().into_dimensionality::<Ix4>()?)))
                    .collect::<Result<Vec<_>>>()?;
                let decoded = desc.decode(&views)?;
                return Ok(vec![
                    decoded.boxes.into_dyn(),
                    decoded.scores.into_dyn(),
                    decoded.classes.into_dyn(),
                ]);
            }
        };
        Ok(vec![value])
    }
}

fn operand<'v>(
    node: &Node,
    values: &'v [Option<ArrayD<f32>>],
    i: usize,
) -> Result<&'v ArrayD<f32>> {
    let tensor = *node
        .inputs
        .get(i)
        .ok_or_else(|| anyhow!("missing operand {i}"))?;
    values[tensor.index()]
        .as_ref()
        .ok_or_else(|| anyhow!("operand {tensor} has not been computed"))
}

fn activate(kind: ActivationKind, x: f32) -> f32 {
    match kind {
        ActivationKind::Relu => x.max(0.0),
        ActivationKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        ActivationKind::Tanh => x.tanh(),
        ActivationKind::LeakyRelu { alpha } => {
            if x > 0.0 {
                x
            } else {
                alpha * x
            }
        }
        ActivationKind::Softplus => {
            if x > 20.0 {
                x
            } else {
                x.exp().ln_1p()
            }
        }
        ActivationKind::HardSigmoid { alpha, beta } => (alpha * x + beta).clamp(0.0, 1.0),
    }
}

fn channel_scale(input: &ArrayD<f32>, scale: &ChannelScale) -> ArrayD<f32> {
    let mut out = input.clone();
    for (c, mut lane) in out.axis_iter_mut(Axis(1)).enumerate() {
        let factor = scale.scale.get(c).copied().unwrap_or(1.0);
        let shift = scale.shift.get(c).copied().unwrap_or(0.0);
        let power = scale.power.get(c).copied().unwrap_or(1.0);
        lane.mapv_inplace(|x| {
            let y = x.mul_add(factor, shift);
            if power == 1.0 { y } else { y.powf(power) }
        });
    }
    out
}

fn slice(input: &ArrayD<f32>, desc: &SliceDesc) -> ArrayD<f32> {
    input
        .slice_each_axis(|ax| {
            let axis = ax.axis.index();
            let start = desc.start[axis];
            let end = start + (desc.size[axis] - 1) * desc.stride[axis] + 1;
            Slice::new(start as isize, Some(end as isize), desc.stride[axis] as isize)
        })
        .to_owned()
}

fn resize_nearest(input: &ArrayD<f32>, scales: &[f32], out_dims: &[usize]) -> ArrayD<f32> {
    let in_dims = input.shape().to_vec();
    let mut src = vec![0usize; in_dims.len()];
    ArrayD::from_shape_fn(IxDyn(out_dims), |idx| {
        for (axis, slot) in src.iter_mut().enumerate() {
            let mapped = (idx[axis] as f32 / scales[axis]).floor() as usize;
            *slot = mapped.min(in_dims[axis] - 1);
        }
        input[IxDyn(&src)]
    })
}

fn pool(input: &ArrayD<f32>, desc: &PoolDesc, out_dims: &[usize]) -> Result<ArrayD<f32>> {
    let input = input.view().into_dimensionality::<Ix4>()?;
    let (_, _, h, w) = input.dim();
    let &[n, c, oh, ow] = out_dims else {
        anyhow::bail!("pool output must be NCHW (got {out_dims:?})");
    };
    let [kh, kw] = desc.window;
    let [sh, sw] = desc.stride;
    let [ph, pw] = desc.pre_padding;

    let out = Array4::from_shape_fn((n, c, oh, ow), |(b, ch, oy, ox)| {
        let y0 = (oy * sh) as isize - ph as isize;
        let x0 = (ox * sw) as isize - pw as isize;
        let mut best = f32::NEG_INFINITY;
        let mut sum = 0.0f32;
        let mut count = 0usize;
        for dy in 0..kh as isize {
            let y = y0 + dy;
            if y < 0 || y >= h as isize {
                continue;
            }
            for dx in 0..kw as isize {
                let x = x0 + dx;
                if x < 0 || x >= w as isize {
                    continue;
                }
                let v = input[[b, ch, y as usize, x as usize]];
                best = best.max(v);
                sum += v;
                count += 1;
            }
        }
        match desc.kind {
            PoolKind::Max => best,
            PoolKind::Average if count > 0 => sum / count as f32,
            PoolKind::Average => 0.0,
        }
    });
    Ok(out.into_dyn())
}

fn convolution(
    input: &ArrayD<f32>,
    desc: &ConvolutionDesc,
    out_dims: &[usize],
) -> Result<ArrayD<f32>> {
    let input = input.view().into_dimensionality::<Ix4>()?;
    let input = input.as_standard_layout();
    let (n, c, h, w) = input.dim();
    let &[_, filters, oh, ow] = out_dims else {
        anyhow::bail!("convolution output must be NCHW (got {out_dims:?})");
    };
    let geometry = ConvGeometry {
        in_channels_per_group: c / desc.groups,
        filters_per_group: filters / desc.groups,
        kernel: desc.kernel,
        stride: desc.stride,
        padding: desc.padding as isize,
        in_hw: (h, w),
        out_hw: (oh, ow),
    };

    let planes: Vec<Vec<f32>> = (0..n * filters)
        .into_par_iter()
        .map(|job| {
            let (b, oc) = (job / filters, job % filters);
            let bias = desc.bias.as_ref().map_or(0.0, |bias| bias[oc]);
            let mut plane = vec![bias; oh * ow];
            match desc.kind {
                ConvolutionKind::Convolution => {
                    geometry.convolve(&input.view(), &desc.weights, b, oc, &mut plane)
                }
                ConvolutionKind::Deconvolution => {
                    geometry.deconvolve(&input.view(), &desc.weights, b, oc, &mut plane)
                }
            }
            plane
        })
        .collect();
    let out = Array4::from_shape_vec((n, filters, oh, ow), planes.concat())?;
    Ok(out.into_dyn())
}

struct ConvGeometry {
    in_channels_per_group: usize,
    filters_per_group: usize,
    kernel: usize,
    stride: usize,
    padding: isize,
    in_hw: (usize, usize),
    out_hw: (usize, usize),
}

impl ConvGeometry {
    /// Gather form; weights are `[filters, C / groups, k, k]`.
    fn convolve(
        &self,
        input: &ArrayView4<'_, f32>,
        weights: &[f32],
        b: usize,
        oc: usize,
        plane: &mut [f32],
    ) {
        let (h, w) = (self.in_hw.0 as isize, self.in_hw.1 as isize);
        let (oh, ow) = self.out_hw;
        let (k, cg) = (self.kernel, self.in_channels_per_group);
        let group = oc / self.filters_per_group;
        for icl in 0..cg {
            let ic = group * cg + icl;
            for ky in 0..k {
                for kx in 0..k {
                    let weight = weights[((oc * cg + icl) * k + ky) * k + kx];
                    for oy in 0..oh {
                        let iy = (oy * self.stride + ky) as isize - self.padding;
                        if iy < 0 || iy >= h {
                            continue;
                        }
                        for ox in 0..ow {
                            let ix = (ox * self.stride + kx) as isize - self.padding;
                            if ix < 0 || ix >= w {
                                continue;
                            }
                            let acc = &mut plane[oy * ow + ox];
                            *acc = input[[b, ic, iy as usize, ix as usize]].mul_add(weight, *acc);
                        }
                    }
                }
            }
        }
    }

    /// Scatter form; weights are `[C, filters / groups, k, k]`.
    fn deconvolve(
        &self,
        input: &ArrayView4<'_, f32>,
        weights: &[f32],
        b: usize,
        oc: usize,
        plane: &mut [f32],
    ) {
        let (h, w) = self.in_hw;
        let (oh, ow) = (self.out_hw.0 as isize, self.out_hw.1 as isize);
        let (k, cg, fg) = (self.kernel, self.in_channels_per_group, self.filters_per_group);
        let (group, local) = (oc / fg, oc % fg);
        for icl in 0..cg {
            let ic = group * cg + icl;
            for iy in 0..h {
                for ix in 0..w {
                    let value = input[[b, ic, iy, ix]];
                    for ky in 0..k {
                        let oy = (iy * self.stride + ky) as isize - self.padding;
                        if oy < 0 || oy >= oh {
                            continue;
                        }
                        for kx in 0..k {
                            let ox = (ix * self.stride + kx) as isize - self.padding;
                            if ox < 0 || ox >= ow {
                                continue;
                            }
                            let weight = weights[((ic * fg + local) * k + ky) * k + kx];
                            let acc = &mut plane[oy as usize * self.out_hw.1 + ox as usize];
                            *acc = value.mul_add(weight, *acc);
                        }
                    }
                }
            }
        }
    }
}
