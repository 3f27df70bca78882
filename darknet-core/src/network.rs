//! Executor interface the graph builder emits into.
//!
//! An acceleration backend implements [`NetworkDefinition`]; the builder only
//! talks to it through opaque [`TensorId`] handles and shape queries. Every
//! descriptor owns its weights, so the executor never borrows from the weight
//! buffer.

use std::fmt;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::yolo::YoloDecodeDesc;

/// Opaque handle to a tensor produced by a [`NetworkDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

impl TensorId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Dimensions of a tensor; 4-D tensors are NCHW.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TensorShape {
    dims: Vec<usize>,
    #[serde(skip)]
    elements: usize,
}

impl TensorShape {
    /// Create a shape, rejecting empty or zero-sized dimensions.
    pub fn new<D>(dims: D) -> Result<Self>
    where
        D: Into<Vec<usize>>,
    {
        let dims = dims.into();
        anyhow::ensure!(
            !dims.is_empty(),
            "tensor shape must have at least one dimension"
        );
        let mut elements = 1usize;
        for (idx, dim) in dims.iter().enumerate() {
            anyhow::ensure!(
                *dim > 0,
                "dimension {idx} must be greater than zero (got {dims:?})"
            );
            elements = elements
                .checked_mul(*dim)
                .with_context(|| format!("tensor shape {dims:?} overflows at dimension {idx}"))?;
        }
        Ok(Self { dims, elements })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    /// `[N, C, H, W]` for 4-D tensors.
    pub fn nchw(&self) -> Result<[usize; 4]> {
        match self.dims.as_slice() {
            &[n, c, h, w] => Ok([n, c, h, w]),
            other => anyhow::bail!("expected an NCHW tensor (got {:?})", other),
        }
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.dims.iter().map(usize::to_string).collect();
        write!(f, "{}", labels.join("x"))
    }
}

impl From<TensorShape> for Vec<usize> {
    fn from(value: TensorShape) -> Self {
        value.dims
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvolutionKind {
    Convolution,
    /// Transposed convolution; kernel layout `[in_c, filters / groups, k, k]`.
    Deconvolution,
}

/// Square 2-D (de)convolution with owned weights.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvolutionDesc {
    pub kind: ConvolutionKind,
    pub filters: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
    pub weights: Vec<f32>,
    pub bias: Option<Vec<f32>>,
}

/// Per-channel `(x * scale + shift) ^ power`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelScale {
    pub shift: Vec<f32>,
    pub scale: Vec<f32>,
    pub power: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementwiseOp {
    Sum,
    Prod,
}

/// Primitive activations; composite ones are built from these plus elementwise ops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
    LeakyRelu { alpha: f32 },
    Softplus,
    /// `clamp(alpha * x + beta, 0, 1)`.
    HardSigmoid { alpha: f32, beta: f32 },
}

/// Strided window over every axis of the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceDesc {
    pub start: Vec<usize>,
    pub size: Vec<usize>,
    pub stride: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Average,
}

/// 2-D pooling over the last two axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDesc {
    pub kind: PoolKind,
    pub window: [usize; 2],
    pub stride: [usize; 2],
    pub pre_padding: [usize; 2],
    pub post_padding: [usize; 2],
}

/// Custom multi-output nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Plugin {
    YoloDecode(YoloDecodeDesc),
}

impl Plugin {
    pub fn name(&self) -> &'static str {
        match self {
            Plugin::YoloDecode(_) => "yolo_decode",
        }
    }
}

/// Graph-construction API of an inference backend.
pub trait NetworkDefinition {
    fn add_input(&mut self, name: &str, shape: TensorShape) -> Result<TensorId>;
    fn add_convolution(&mut self, input: TensorId, desc: ConvolutionDesc) -> Result<TensorId>;
    fn add_scale(&mut self, input: TensorId, scale: ChannelScale) -> Result<TensorId>;
    fn add_elementwise(&mut self, lhs: TensorId, rhs: TensorId, op: ElementwiseOp)
    -> Result<TensorId>;
    fn add_activation(&mut self, input: TensorId, kind: ActivationKind) -> Result<TensorId>;
    fn add_constant(&mut self, shape: TensorShape, values: Vec<f32>) -> Result<TensorId>;
    fn add_concat(&mut self, inputs: &[TensorId], axis: usize) -> Result<TensorId>;
    fn add_slice(&mut self, input: TensorId, desc: SliceDesc) -> Result<TensorId>;
    fn add_resize(&mut self, input: TensorId, mode: ResizeMode, scales: Vec<f32>)
    -> Result<TensorId>;
    fn add_pool(&mut self, input: TensorId, desc: PoolDesc) -> Result<TensorId>;
    fn add_reshape(&mut self, input: TensorId, dims: Vec<usize>) -> Result<TensorId>;
    fn add_transpose(&mut self, input: TensorId, perm: Vec<usize>) -> Result<TensorId>;
    /// Custom node; returns one handle per plugin output.
    fn add_plugin(&mut self, inputs: &[TensorId], plugin: Plugin) -> Result<Vec<TensorId>>;
    fn mark_output(&mut self, tensor: TensorId, name: &str) -> Result<()>;
    fn shape(&self, tensor: TensorId) -> Result<TensorShape>;
}
