//! Typed view of a parsed cfg.
//!
//! [`DarknetConfig::from_blocks`] walks the raw [`ConfigBlock`]s once, turns every
//! section into a [`LayerKind`] and collects the detection-head templates. All
//! structural problems (unknown layer types, unknown activations, missing or
//! malformed fields) surface here, before any weights are touched.

use std::{fmt, path::Path, str::FromStr};

use anyhow::Result;

use crate::{
    cfg::{ConfigBlock, parse_cfg},
    error::BuildError,
};

/// Nonlinearities understood by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Activation {
    Linear,
    Relu,
    Logistic,
    Tanh,
    Softplus,
    Leaky,
    Mish,
    Silu,
    HardSigmoid,
    HardSwish,
}

impl Activation {
    pub fn as_str(self) -> &'static str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Logistic => "logistic",
            Activation::Tanh => "tanh",
            Activation::Softplus => "softplus",
            Activation::Leaky => "leaky",
            Activation::Mish => "mish",
            Activation::Silu => "silu",
            Activation::HardSigmoid => "hardsigmoid",
            Activation::HardSwish => "hardswish",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "linear" => Ok(Activation::Linear),
            "relu" => Ok(Activation::Relu),
            "logistic" | "sigmoid" => Ok(Activation::Logistic),
            "tanh" => Ok(Activation::Tanh),
            "softplus" => Ok(Activation::Softplus),
            "leaky" => Ok(Activation::Leaky),
            "mish" => Ok(Activation::Mish),
            "silu" | "swish" => Ok(Activation::Silu),
            "hardsigmoid" | "hard_sigmoid" => Ok(Activation::HardSigmoid),
            "hardswish" | "hard_swish" => Ok(Activation::HardSwish),
            other => Err(other.to_string()),
        }
    }
}

/// Values from the leading `[net]` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetParams {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    /// Inputs are letterboxed instead of stretched.
    pub letterbox: bool,
    pub batch: usize,
}

/// Shared parameters of `[convolutional]` and `[deconvolutional]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvParams {
    pub filters: usize,
    pub size: usize,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
    pub batch_normalize: bool,
    /// Per-filter biases are stored ahead of the kernel.
    pub bias: bool,
    pub activation: Activation,
}

/// Channel split of a `[route]` with `groups`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteGroup {
    pub groups: usize,
    pub group_id: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadKind {
    Yolo,
    Region,
}

impl HeadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HeadKind::Yolo => "yolo",
            HeadKind::Region => "region",
        }
    }
}

/// Closed set of layers the compiler understands.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Convolutional(ConvParams),
    Deconvolutional(ConvParams),
    BatchNorm { activation: Activation },
    Implicit { filters: usize },
    ShiftChannels { from: i64 },
    ControlChannels { from: i64 },
    Shortcut { from: i64, activation: Activation },
    Sam { from: i64, activation: Activation },
    Route {
        layers: Vec<i64>,
        axis: i64,
        group: Option<RouteGroup>,
    },
    Upsample { stride: usize },
    MaxPool { size: usize, stride: usize },
    AvgPool,
    Reorg3d,
    Reorg { stride: usize },
    /// Index into [`DarknetConfig::heads`].
    Head { kind: HeadKind, head: usize },
    Dropout,
}

impl LayerKind {
    /// Short name used in layer tables and log lines.
    pub fn name(&self) -> &'static str {
        match self {
            LayerKind::Convolutional(_) => "conv",
            LayerKind::Deconvolutional(_) => "deconv",
            LayerKind::BatchNorm { .. } => "batchnorm",
            LayerKind::Implicit { .. } => "implicit",
            LayerKind::ShiftChannels { .. } => "shift_channels",
            LayerKind::ControlChannels { .. } => "control_channels",
            LayerKind::Shortcut { .. } => "shortcut",
            LayerKind::Sam { .. } => "sam",
            LayerKind::Route { .. } => "route",
            LayerKind::Upsample { .. } => "upsample",
            LayerKind::MaxPool { .. } => "maxpool",
            LayerKind::AvgPool => "avgpool",
            LayerKind::Reorg3d => "reorg3d",
            LayerKind::Reorg { .. } => "reorg",
            LayerKind::Head { kind, .. } => kind.as_str(),
            LayerKind::Dropout => "dropout",
        }
    }
}

/// One non-net block, numbered the way Darknet numbers layers (from 0).
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub index: usize,
    pub kind: LayerKind,
}

impl Layer {
    /// Position of the block in the cfg, counting `[net]` as block 0.
    pub fn block(&self) -> usize {
        self.index + 1
    }
}

/// Metadata of one detection head, completed with the grid size at build time.
#[derive(Debug, Clone, PartialEq)]
pub struct YoloTensorInfo {
    pub blob_name: String,
    pub kind: HeadKind,
    pub grid_width: usize,
    pub grid_height: usize,
    pub num_bboxes: usize,
    pub num_classes: usize,
    /// Flat `[w0, h0, w1, h1, ...]` anchor list.
    pub anchors: Vec<f32>,
    pub mask: Vec<usize>,
    pub scale_x_y: f32,
}

impl YoloTensorInfo {
    /// Channels the head tensor must carry.
    pub fn channels(&self) -> usize {
        self.num_bboxes * (5 + self.num_classes)
    }

    /// Rows this head contributes to the decoded output.
    pub fn rows(&self) -> usize {
        self.num_bboxes * self.grid_width * self.grid_height
    }

    /// Anchor `(w, h)` for box slot `slot`, resolved through the mask when present.
    pub fn anchor(&self, slot: usize) -> Option<(f32, f32)> {
        let idx = if self.mask.is_empty() {
            slot
        } else {
            *self.mask.get(slot)?
        };
        Some((*self.anchors.get(2 * idx)?, *self.anchors.get(2 * idx + 1)?))
    }
}

/// Parsed, typed network description.
#[derive(Debug, Clone, PartialEq)]
pub struct DarknetConfig {
    pub model_name: String,
    pub net: NetParams,
    pub layers: Vec<Layer>,
    pub heads: Vec<YoloTensorInfo>,
    pub num_classes: usize,
    /// Heads emit already-activated values (`new_coords=1`).
    pub new_coords: bool,
}

impl DarknetConfig {
    /// Parse a cfg file, naming the model after the file stem.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let blocks = parse_cfg(path)?;
        let model_name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_blocks(&blocks, &model_name)
    }

    pub fn from_blocks(blocks: &[ConfigBlock], model_name: &str) -> Result<Self> {
        let Some((first, rest)) = blocks.split_first() else {
            return Err(BuildError::Parse {
                line: 0,
                message: "cfg contains no blocks".into(),
            }
            .into());
        };
        if first.block_type != "net" && first.block_type != "network" {
            return Err(BuildError::Parse {
                line: first.line,
                message: format!("first block must be [net], found [{}]", first.block_type),
            }
            .into());
        }
        let net = parse_net(&Fields::new(first, 0))?;

        let mut layers = Vec::with_capacity(rest.len());
        let mut heads = Vec::new();
        let mut head_blocks = Vec::new();
        let mut new_coords = false;
        for (index, block) in rest.iter().enumerate() {
            let fields = Fields::new(block, index + 1);
            let kind = match block.block_type.as_str() {
                "convolutional" => LayerKind::Convolutional(parse_conv(&fields)?),
                "deconvolutional" => LayerKind::Deconvolutional(parse_conv(&fields)?),
                "batchnorm" => LayerKind::BatchNorm {
                    activation: fields.activation()?,
                },
                "implicit" | "implicit_add" | "implicit_mul" => LayerKind::Implicit {
                    filters: fields.positive("filters")?,
                },
                "shift_channels" => LayerKind::ShiftChannels {
                    from: fields.required("from")?,
                },
                "control_channels" => LayerKind::ControlChannels {
                    from: fields.required("from")?,
                },
                "shortcut" => LayerKind::Shortcut {
                    from: fields.required("from")?,
                    activation: fields.activation()?,
                },
                "sam" => LayerKind::Sam {
                    from: fields.required("from")?,
                    activation: fields.activation()?,
                },
                "route" => parse_route(&fields)?,
                "upsample" => LayerKind::Upsample {
                    stride: fields.positive_or("stride", 2)?,
                },
                "maxpool" | "max" => LayerKind::MaxPool {
                    size: fields.positive("size")?,
                    stride: fields.positive("stride")?,
                },
                "avgpool" | "avg" => LayerKind::AvgPool,
                "reorg3d" => LayerKind::Reorg3d,
                "reorg" => LayerKind::Reorg {
                    stride: fields.positive_or("stride", 2)?,
                },
                "yolo" | "region" => {
                    let kind = if block.block_type == "yolo" {
                        HeadKind::Yolo
                    } else {
                        HeadKind::Region
                    };
                    new_coords |= fields.flag("new_coords", false)?;
                    heads.push(parse_head(&fields, kind, index)?);
                    head_blocks.push(index + 1);
                    LayerKind::Head {
                        kind,
                        head: heads.len() - 1,
                    }
                }
                "dropout" => LayerKind::Dropout,
                other => {
                    return Err(BuildError::UnsupportedLayer {
                        block: index + 1,
                        block_type: other.to_string(),
                    }
                    .into());
                }
            };
            layers.push(Layer { index, kind });
        }

        let num_classes = heads.first().map(|h| h.num_classes).unwrap_or(0);
        if let Some((odd, &block)) = heads
            .iter()
            .zip(&head_blocks)
            .find(|(h, _)| h.num_classes != num_classes)
        {
            return Err(BuildError::InvalidField {
                block,
                block_type: odd.kind.as_str().into(),
                field: "classes".into(),
                value: odd.num_classes.to_string(),
            }
            .into());
        }

        Ok(Self {
            model_name: model_name.to_string(),
            net,
            layers,
            heads,
            num_classes,
            new_coords,
        })
    }

    /// Number of `[yolo]`/`[region]` blocks.
    pub fn head_block_count(&self) -> usize {
        self.layers
            .iter()
            .filter(|layer| matches!(layer.kind, LayerKind::Head { .. }))
            .count()
    }
}

fn parse_net(fields: &Fields<'_>) -> Result<NetParams, BuildError> {
    Ok(NetParams {
        width: fields.positive("width")?,
        height: fields.positive("height")?,
        channels: fields.positive("channels")?,
        letterbox: fields.flag("letter_box", false)?,
        batch: fields.positive_or("batch", 1)?,
    })
}

fn parse_conv(fields: &Fields<'_>) -> Result<ConvParams, BuildError> {
    let filters = fields.positive("filters")?;
    let size = fields.positive("size")?;
    let batch_normalize = fields.flag("batch_normalize", false)?;
    let pad: i64 = fields.required("pad")?;
    let padding = if pad != 0 {
        (size - 1) / 2
    } else {
        fields.optional("padding", 0usize)?
    };
    Ok(ConvParams {
        filters,
        size,
        stride: fields.positive("stride")?,
        padding,
        groups: fields.positive_or("groups", 1)?,
        batch_normalize,
        bias: fields.flag("bias", !batch_normalize)?,
        activation: fields.activation()?,
    })
}

fn parse_route(fields: &Fields<'_>) -> Result<LayerKind, BuildError> {
    let layers: Vec<i64> = fields.list("layers")?;
    if layers.is_empty() {
        return Err(fields.invalid("layers", ""));
    }
    let groups = fields.positive_or("groups", 1)?;
    let group_id: usize = fields.optional("group_id", 0)?;
    if group_id >= groups {
        return Err(fields.invalid("group_id", &group_id.to_string()));
    }
    Ok(LayerKind::Route {
        layers,
        axis: fields.optional("axis", 0)?,
        group: (groups > 1).then_some(RouteGroup { groups, group_id }),
    })
}

fn parse_head(
    fields: &Fields<'_>,
    kind: HeadKind,
    index: usize,
) -> Result<YoloTensorInfo, BuildError> {
    let num_classes = fields.required("classes")?;
    let anchors: Vec<f32> = fields.list("anchors")?;
    if anchors.is_empty() || anchors.len() % 2 != 0 {
        return Err(fields.invalid("anchors", &anchors.len().to_string()));
    }
    let mask: Vec<usize> = fields.list_or_empty("mask")?;
    let num_bboxes = if mask.is_empty() {
        fields.positive("num")?
    } else {
        mask.len()
    };
    let anchor_pairs = anchors.len() / 2;
    if let Some(bad) = mask.iter().find(|&&m| m >= anchor_pairs) {
        return Err(fields.invalid("mask", &bad.to_string()));
    }
    if num_bboxes > anchor_pairs {
        return Err(fields.invalid("num", &num_bboxes.to_string()));
    }
    Ok(YoloTensorInfo {
        blob_name: format!("{}_{}", kind.as_str(), index),
        kind,
        grid_width: 0,
        grid_height: 0,
        num_bboxes,
        num_classes,
        anchors,
        mask,
        scale_x_y: fields.optional("scale_x_y", 1.0f32)?,
    })
}

/// Field accessor that turns lookup failures into [`BuildError`]s naming the block.
struct Fields<'a> {
    block: &'a ConfigBlock,
    index: usize,
}

impl<'a> Fields<'a> {
    fn new(block: &'a ConfigBlock, index: usize) -> Self {
        Self { block, index }
    }

    fn invalid(&self, field: &str, value: &str) -> BuildError {
        BuildError::InvalidField {
            block: self.index,
            block_type: self.block.block_type.clone(),
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    fn missing(&self, field: &str) -> BuildError {
        BuildError::MissingField {
            block: self.index,
            block_type: self.block.block_type.clone(),
            field: field.to_string(),
        }
    }

    fn parse<T: FromStr>(&self, field: &str, raw: &str) -> Result<T, BuildError> {
        raw.trim().parse().map_err(|_| self.invalid(field, raw))
    }

    fn required<T: FromStr>(&self, field: &str) -> Result<T, BuildError> {
        let raw = self.block.get(field).ok_or_else(|| self.missing(field))?;
        self.parse(field, raw)
    }

    fn optional<T: FromStr>(&self, field: &str, default: T) -> Result<T, BuildError> {
        match self.block.get(field) {
            Some(raw) => self.parse(field, raw),
            None => Ok(default),
        }
    }

    fn positive(&self, field: &str) -> Result<usize, BuildError> {
        let value: usize = self.required(field)?;
        if value == 0 {
            return Err(self.invalid(field, "0"));
        }
        Ok(value)
    }

    fn positive_or(&self, field: &str, default: usize) -> Result<usize, BuildError> {
        let value = self.optional(field, default)?;
        if value == 0 {
            return Err(self.invalid(field, "0"));
        }
        Ok(value)
    }

    /// Integer flag where any nonzero value means true.
    fn flag(&self, field: &str, default: bool) -> Result<bool, BuildError> {
        match self.block.get(field) {
            Some(raw) => self.parse::<i64>(field, raw).map(|v| v != 0),
            None => Ok(default),
        }
    }

    fn list<T: FromStr>(&self, field: &str) -> Result<Vec<T>, BuildError> {
        let raw = self.block.get(field).ok_or_else(|| self.missing(field))?;
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| self.parse(field, item))
            .collect()
    }

    fn list_or_empty<T: FromStr>(&self, field: &str) -> Result<Vec<T>, BuildError> {
        if self.block.contains(field) {
            self.list(field)
        } else {
            Ok(Vec::new())
        }
    }

    fn activation(&self) -> Result<Activation, BuildError> {
        let raw = self.block.get("activation").unwrap_or("linear");
        raw.parse().map_err(|name| BuildError::UnsupportedActivation {
            block: self.index,
            activation: name,
        })
    }
}
