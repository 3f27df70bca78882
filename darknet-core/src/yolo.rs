//! The custom decode node that turns raw detection-head tensors into boxes.
//!
//! Each head tensor is `[B, num_bboxes * (5 + classes), grid_h, grid_w]`. The node
//! concatenates every head into three outputs: `boxes [B, N, 4]` as
//! `[cx, cy, w, h]` in network pixels, `scores [B, N, 1]` and `classes [B, N, 1]`.

use anyhow::{Context, Result};
use ndarray::{Array3, ArrayView4};

use crate::{
    config::{HeadKind, YoloTensorInfo},
    network::TensorShape,
};

/// Parameters of the decode node.
#[derive(Debug, Clone, PartialEq)]
pub struct YoloDecodeDesc {
    pub input_width: usize,
    pub input_height: usize,
    pub num_classes: usize,
    /// Heads carry already-activated values.
    pub new_coords: bool,
    pub heads: Vec<YoloTensorInfo>,
    /// Total rows `N` across all heads.
    pub output_size: usize,
}

impl YoloDecodeDesc {
    pub fn new(
        input_width: usize,
        input_height: usize,
        num_classes: usize,
        new_coords: bool,
        heads: Vec<YoloTensorInfo>,
    ) -> Self {
        let output_size = heads.iter().map(YoloTensorInfo::rows).sum();
        Self {
            input_width,
            input_height,
            num_classes,
            new_coords,
            heads,
            output_size,
        }
    }

    /// Check the head inputs and return the shapes of `boxes`, `scores` and `classes`.
    pub fn output_shapes(&self, inputs: &[TensorShape]) -> Result<[TensorShape; 3]> {
        anyhow::ensure!(
            inputs.len() == self.heads.len(),
            "decode node expects {} head inputs (got {})",
            self.heads.len(),
            inputs.len()
        );
        anyhow::ensure!(!inputs.is_empty(), "decode node needs at least one head");

        let mut batch = None;
        for (info, shape) in self.heads.iter().zip(inputs) {
            let [n, c, h, w] = shape.nchw()?;
            anyhow::ensure!(
                c == info.channels() && h == info.grid_height && w == info.grid_width,
                "head {} expects {}x{}x{} but got {}",
                info.blob_name,
                info.channels(),
                info.grid_height,
                info.grid_width,
                shape
            );
            match batch {
                None => batch = Some(n),
                Some(b) => anyhow::ensure!(b == n, "head batch sizes differ ({b} vs {n})"),
            }
        }
        let batch = batch.unwrap_or(1);
        let rows: usize = self.heads.iter().map(YoloTensorInfo::rows).sum();
        anyhow::ensure!(
            rows == self.output_size,
            "decode node output size {} does not match {} head rows",
            self.output_size,
            rows
        );
        Ok([
            TensorShape::new(vec![batch, rows, 4])?,
            TensorShape::new(vec![batch, rows, 1])?,
            TensorShape::new(vec![batch, rows, 1])?,
        ])
    }

    /// CPU evaluation of the node.
    pub fn decode(&self, inputs: &[ArrayView4<'_, f32>]) -> Result<DecodedHeads> {
        let shapes = inputs
            .iter()
            .map(|view| TensorShape::new(view.shape().to_vec()))
            .collect::<Result<Vec<_>>>()?;
        let [boxes_shape, _, _] = self.output_shapes(&shapes)?;
        let batch = boxes_shape.dims()[0];

        let mut out = DecodedHeads {
            boxes: Array3::zeros((batch, self.output_size, 4)),
            scores: Array3::zeros((batch, self.output_size, 1)),
            classes: Array3::zeros((batch, self.output_size, 1)),
        };
        for b in 0..batch {
            let mut offset = 0;
            for (info, view) in self.heads.iter().zip(inputs) {
                self.decode_head(info, view, b, offset, &mut out)?;
                offset += info.rows();
            }
        }
        Ok(out)
    }

    fn decode_head(
        &self,
        info: &YoloTensorInfo,
        view: &ArrayView4<'_, f32>,
        b: usize,
        offset: usize,
        out: &mut DecodedHeads,
    ) -> Result<()> {
        let (gw, gh) = (info.grid_width, info.grid_height);
        let stride = 5 + self.num_classes;
        let alpha = info.scale_x_y;
        let beta = -0.5 * (alpha - 1.0);
        let cell_w = self.input_width as f32 / gw as f32;
        let cell_h = self.input_height as f32 / gh as f32;
        let mut probs = vec![0.0f32; self.num_classes];

        for z in 0..info.num_bboxes {
            let base = z * stride;
            let (anchor_w, anchor_h) = info
                .anchor(z)
                .with_context(|| format!("{}: no anchor for box {z}", info.blob_name))?;
            for y in 0..gh {
                for x in 0..gw {
                    let at = |k: usize| view[[b, base + k, y, x]];
                    let (tx, ty, tw, th, to) = (at(0), at(1), at(2), at(3), at(4));
                    for (c, p) in probs.iter_mut().enumerate() {
                        *p = at(5 + c);
                    }

                    let (cx, cy, w, h, objectness) = match info.kind {
                        HeadKind::Yolo if self.new_coords => (
                            (tx * alpha + beta + x as f32) * cell_w,
                            (ty * alpha + beta + y as f32) * cell_h,
                            (2.0 * tw).powi(2) * anchor_w,
                            (2.0 * th).powi(2) * anchor_h,
                            to,
                        ),
                        HeadKind::Yolo => {
                            probs.iter_mut().for_each(|p| *p = sigmoid(*p));
                            (
                                (sigmoid(tx) * alpha + beta + x as f32) * cell_w,
                                (sigmoid(ty) * alpha + beta + y as f32) * cell_h,
                                tw.exp() * anchor_w,
                                th.exp() * anchor_h,
                                sigmoid(to),
                            )
                        }
                        HeadKind::Region => {
                            softmax_in_place(&mut probs);
                            (
                                (sigmoid(tx) + x as f32) * cell_w,
                                (sigmoid(ty) + y as f32) * cell_h,
                                tw.exp() * anchor_w * cell_w,
                                th.exp() * anchor_h * cell_h,
                                sigmoid(to),
                            )
                        }
                    };

                    let (class_id, max_prob) = argmax(&probs);
                    let row = offset + z * gw * gh + y * gw + x;
                    out.boxes[[b, row, 0]] = cx;
                    out.boxes[[b, row, 1]] = cy;
                    out.boxes[[b, row, 2]] = w;
                    out.boxes[[b, row, 3]] = h;
                    out.scores[[b, row, 0]] = objectness * max_prob;
                    out.classes[[b, row, 0]] = class_id as f32;
                }
            }
        }
        Ok(())
    }
}

/// Outputs of [`YoloDecodeDesc::decode`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedHeads {
    pub boxes: Array3<f32>,
    pub scores: Array3<f32>,
    pub classes: Array3<f32>,
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        values.iter_mut().for_each(|v| *v /= sum);
    }
}

fn argmax(values: &[f32]) -> (usize, f32) {
    values
        .iter()
        .copied()
        .enumerate()
        .fold((0, 0.0), |best, (idx, v)| if v > best.1 { (idx, v) } else { best })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn head(kind: HeadKind, classes: usize, grid: usize, mask: Vec<usize>) -> YoloTensorInfo {
        YoloTensorInfo {
            blob_name: format!("{}_0", kind.as_str()),
            kind,
            grid_width: grid,
            grid_height: grid,
            num_bboxes: if mask.is_empty() { 1 } else { mask.len() },
            num_classes: classes,
            anchors: vec![10.0, 20.0, 30.0, 40.0],
            mask,
            scale_x_y: 1.0,
        }
    }

    #[test]
    fn yolo_head_decodes_centre_and_anchor() {
        let info = head(HeadKind::Yolo, 2, 2, vec![1]);
        let desc = YoloDecodeDesc::new(64, 64, 2, false, vec![info]);
        assert_eq!(desc.output_size, 4);

        let mut raw = Array4::<f32>::zeros((1, 7, 2, 2));
        // cell (x=1, y=0): logits for objectness and class 1
        raw[[0, 4, 0, 1]] = 10.0;
        raw[[0, 6, 0, 1]] = 10.0;
        raw[[0, 5, 0, 1]] = -10.0;
        let out = desc.decode(&[raw.view()]).expect("decode");

        let row = 1;
        assert!((out.boxes[[0, row, 0]] - 48.0).abs() < 1e-4);
        assert!((out.boxes[[0, row, 1]] - 16.0).abs() < 1e-4);
        assert!((out.boxes[[0, row, 2]] - 30.0).abs() < 1e-4);
        assert!((out.boxes[[0, row, 3]] - 40.0).abs() < 1e-4);
        assert_eq!(out.classes[[0, row, 0]], 1.0);
        assert!(out.scores[[0, row, 0]] > 0.99);
        // untouched cells: 0.5 objectness * 0.5 prob
        assert!((out.scores[[0, 0, 0]] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn new_coords_uses_raw_values() {
        let info = head(HeadKind::Yolo, 1, 1, vec![0]);
        let desc = YoloDecodeDesc::new(32, 32, 1, true, vec![info]);
        let mut raw = Array4::<f32>::zeros((1, 6, 1, 1));
        raw[[0, 0, 0, 0]] = 0.5;
        raw[[0, 1, 0, 0]] = 0.25;
        raw[[0, 2, 0, 0]] = 0.5;
        raw[[0, 3, 0, 0]] = 1.0;
        raw[[0, 4, 0, 0]] = 0.8;
        raw[[0, 5, 0, 0]] = 0.5;
        let out = desc.decode(&[raw.view()]).expect("decode");
        assert!((out.boxes[[0, 0, 0]] - 16.0).abs() < 1e-5);
        assert!((out.boxes[[0, 0, 1]] - 8.0).abs() < 1e-5);
        assert!((out.boxes[[0, 0, 2]] - 10.0).abs() < 1e-5);
        assert!((out.boxes[[0, 0, 3]] - 80.0).abs() < 1e-5);
        assert!((out.scores[[0, 0, 0]] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn region_head_applies_softmax_and_grid_scaling() {
        let info = head(HeadKind::Region, 2, 2, Vec::new());
        let desc = YoloDecodeDesc::new(64, 64, 2, false, vec![info]);
        let mut raw = Array4::<f32>::zeros((1, 7, 2, 2));
        raw[[0, 4, 1, 1]] = 20.0;
        let out = desc.decode(&[raw.view()]).expect("decode");
        let row = 3;
        assert!((out.boxes[[0, row, 0]] - 48.0).abs() < 1e-4);
        assert!((out.boxes[[0, row, 2]] - 320.0).abs() < 1e-3);
        // equal logits split probability evenly
        assert!((out.scores[[0, row, 0]] - 0.5).abs() < 1e-4);
        assert_eq!(out.classes[[0, row, 0]], 0.0);
    }

    #[test]
    fn missing_anchor_fails_instead_of_guessing() {
        let mut info = head(HeadKind::Region, 1, 1, Vec::new());
        info.num_bboxes = 3;
        let desc = YoloDecodeDesc::new(32, 32, 1, false, vec![info]);
        let raw = Array4::<f32>::zeros((1, 18, 1, 1));
        let err = desc.decode(&[raw.view()]).expect_err("third anchor is missing");
        assert!(err.to_string().contains("no anchor for box 2"));
    }

    #[test]
    fn rejects_mismatched_head_shapes() {
        let info = head(HeadKind::Yolo, 2, 2, vec![0]);
        let desc = YoloDecodeDesc::new(64, 64, 2, false, vec![info]);
        let bad = TensorShape::new(vec![1, 8, 2, 2]).expect("shape");
        assert!(desc.output_shapes(&[bad]).is_err());
        assert!(desc.output_shapes(&[]).is_err());
    }
}
