use burn::{
    prelude::Backend,
    tensor::{Tensor, cast::ToElement, s},
};

/// Upper bound applied to the `dw`/`dh` offsets before they are exponentiated.
///
/// `ln(1000 / 16)`: a box can grow at most 62.5x in a single decode step, which keeps a
/// malformed regression output from producing infinite widths.
pub const DEFAULT_XFORM_CLIP: f32 = 4.135_166_5;

/// Splits a tensor of bounding boxes in any 4 component format (cxcywh, xyxy, ect..) into
/// individual components.
///
/// # Arguments
///
/// * `boxes` - Tensor of shape [num_boxes, 4].
///
/// # Returns
///
/// * Tuple of four tensors `(c1, c2, c3, c4)` each of shape [num_boxes, 1].
pub fn boxes_to_components<B: Backend>(
    boxes: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
    (
        boxes.clone().slice(s![.., 0..1]),
        boxes.clone().slice(s![.., 1..2]),
        boxes.clone().slice(s![.., 2..3]),
        boxes.slice(s![.., 3..4]),
    )
}

/// Converts a tensor of bounding boxes from center format (cx, cy, w, h) to corner
/// format (x1, y1, x2, y2).
///
/// # Arguments
///
/// * `a` - Tensor of shape [num_boxes, 4] in cxcywh format.
///
/// # Returns
///
/// * `Tensor<B, 2>` - Tensor of shape [num_boxes, 4] in xyxy format.
pub fn cxcywh_to_x1y1x2y2<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (cx, cy, w, h) = boxes_to_components(a);

    let half_w = w * 0.5;
    let half_h = h * 0.5;

    Tensor::cat(
        vec![
            cx.clone() - half_w.clone(),
            cy.clone() - half_h.clone(),
            cx + half_w,
            cy + half_h,
        ],
        1,
    )
}

/// Converts a tensor of bounding boxes from corner format (x1, y1, x2, y2) to center format
/// (cx, cy, w, h).
///
/// # Arguments
///
/// * `a` - Tensor of shape [num_boxes, 4] in xyxy format.
///
/// # Returns
///
/// * `Tensor<B, 2>` - Tensor of shape [num_boxes, 4] in cxcywh format.
pub fn x1y1x2y2_to_cxcywh<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (x1, y1, x2, y2) = boxes_to_components(a);

    let cx = (x1.clone() + x2.clone()) * 0.5;
    let cy = (y1.clone() + y2.clone()) * 0.5;

    Tensor::cat(vec![cx, cy, x2 - x1, y2 - y1], 1)
}

/// Single box version of [`x1y1x2y2_to_cxcywh`].
pub fn corner_to_center([x1, y1, x2, y2]: [f32; 4]) -> [f32; 4] {
    [(x1 + x2) * 0.5, (y1 + y2) * 0.5, x2 - x1, y2 - y1]
}

/// Single box version of [`cxcywh_to_x1y1x2y2`].
pub fn center_to_corner([cx, cy, w, h]: [f32; 4]) -> [f32; 4] {
    [cx - w * 0.5, cy - h * 0.5, cx + w * 0.5, cy + h * 0.5]
}

/// Clamps every corner of `boxes` into the image: x into `[0, width]`, y into `[0, height]`.
///
/// # Arguments
///
/// * `boxes` - Tensor of shape [num_boxes, 4] in xyxy format.
/// * `(width, height)` - Image size in the same units as the boxes.
pub fn clip_boxes<B: Backend>(boxes: Tensor<B, 2>, (width, height): (f32, f32)) -> Tensor<B, 2> {
    let (x1, y1, x2, y2) = boxes_to_components(boxes);

    Tensor::cat(
        vec![
            x1.clamp(0.0, width),
            y1.clamp(0.0, height),
            x2.clamp(0.0, width),
            y2.clamp(0.0, height),
        ],
        1,
    )
}

/// Intersection over union of two boxes in `xyxy` format.
///
/// Returns `0.0` when the union is empty so degenerate boxes never produce a NaN.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = iw * ih;

    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Boxes produced by [`BoxCoder::decode`].
#[derive(Debug, Clone)]
pub struct DecodedBoxes<B: Backend> {
    /// Tensor of shape [num_boxes, 4] in xyxy format.
    pub boxes: Tensor<B, 2>,
    /// Number of width/height offsets that hit `xform_clip` and were clamped.
    pub clamped: usize,
}

/// Anchor relative box encoder/decoder.
///
/// The encoding follows the bounding-box regression parameterisation of
///
/// “Rich feature hierarchies for accurate object detection and semantic segmentation”
/// Authors: Ross Girshick, Jeff Donahue, Trevor Darrell, Jitendra Malik
/// Link (official): https://arxiv.org/abs/1311.2524
///
/// which R-FCN reuses for every refinement stage: a scale invariant translation of the
/// reference center followed by a log-space scaling of its width and height.
///
/// `weights` divide the raw offsets before they are applied (and multiply them on encode).
/// With the default `(1, 1, 1, 1)` the network output is used as is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    pub weights: (f32, f32, f32, f32),
    pub xform_clip: f32,
    pub clip_to: Option<(f32, f32)>,
}

impl Default for BoxCoder {
    fn default() -> Self {
        Self::new((1.0, 1.0, 1.0, 1.0))
    }
}

impl BoxCoder {
    pub fn new(weights: (f32, f32, f32, f32)) -> Self {
        Self {
            weights,
            xform_clip: DEFAULT_XFORM_CLIP,
            clip_to: None,
        }
    }

    pub fn with_xform_clip(mut self, xform_clip: f32) -> Self {
        self.xform_clip = xform_clip;
        self
    }

    /// Clamp decoded boxes into `(width, height)`, or leave them unclipped with `None`.
    pub fn with_clip_to(mut self, clip_to: Option<(f32, f32)>) -> Self {
        self.clip_to = clip_to;
        self
    }

    /// Computes the offsets that move each reference box onto its target.
    ///
    /// The regression formula:
    ///
    /// ```text
    ///      Gx - Px            Gy - Py              ⎛Gw⎞              ⎛Gh⎞
    /// tx = ─────── * w1  ty = ─────── * w2  tw = log⎜──⎟ * w3  th = log⎜──⎟ * w4
    ///        Pw                 Ph                  ⎝Pw⎠              ⎝Ph⎠
    /// ```
    ///
    /// # Arguments
    ///
    /// * `targets` - Tensor of shape [num_boxes, 4] in xyxy format.
    /// * `anchors` - Reference boxes, tensor of shape [num_boxes, 4] in xyxy format.
    ///
    /// # Returns
    ///
    /// * `Tensor<B, 2>` - Offsets `(tx, ty, tw, th)` of shape [num_boxes, 4].
    pub fn encode<B: Backend>(
        &self,
        targets: Tensor<B, 2>,
        anchors: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let (w1, w2, w3, w4) = self.weights;
        let (gx, gy, gw, gh) = boxes_to_components(x1y1x2y2_to_cxcywh(targets));
        let (px, py, pw, ph) = boxes_to_components(x1y1x2y2_to_cxcywh(anchors));

        let tx = (gx - px) / pw.clone() * w1;
        let ty = (gy - py) / ph.clone() * w2;
        let tw = (gw / pw).log() * w3;
        let th = (gh / ph).log() * w4;

        Tensor::cat(vec![tx, ty, tw, th], 1)
    }

    /// Applies predicted offsets to reference boxes, the inverse of [`BoxCoder::encode`].
    ///
    /// - pcx = dx * Pw + Px
    /// - pcy = dy * Ph + Py
    /// - pw = exp(min(dw, xform_clip)) * Pw
    /// - ph = exp(min(dh, xform_clip)) * Ph
    ///
    /// When `clip_to` is set the corner boxes are clamped into the image afterwards.
    ///
    /// # Arguments
    ///
    /// * `offsets` - Predicted offsets of shape [num_boxes, 4].
    /// * `anchors` - Reference boxes of shape [num_boxes, 4] in xyxy format.
    pub fn decode<B: Backend>(
        &self,
        offsets: Tensor<B, 2>,
        anchors: Tensor<B, 2>,
    ) -> DecodedBoxes<B> {
        let (w1, w2, w3, w4) = self.weights;
        let (center_x, center_y, w, h) = boxes_to_components(x1y1x2y2_to_cxcywh(anchors));
        let (dx, dy, dw, dh) = boxes_to_components(offsets);

        let dx = dx / w1;
        let dy = dy / w2;
        let dw = dw / w3;
        let dh = dh / w4;

        let clamped = dw
            .clone()
            .greater_elem(self.xform_clip)
            .int()
            .sum()
            .into_scalar()
            .to_usize()
            + dh.clone()
                .greater_elem(self.xform_clip)
                .int()
                .sum()
                .into_scalar()
                .to_usize();

        let pcx = dx * w.clone() + center_x;
        let pcy = dy * h.clone() + center_y;
        let pw = dw.clamp_max(self.xform_clip).exp() * w;
        let ph = dh.clamp_max(self.xform_clip).exp() * h;

        let boxes = cxcywh_to_x1y1x2y2(Tensor::cat(vec![pcx, pcy, pw, ph], 1));
        let boxes = match self.clip_to {
            Some(size) => clip_boxes(boxes, size),
            None => boxes,
        };

        DecodedBoxes { boxes, clamped }
    }
}
