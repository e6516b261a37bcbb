use burn::{
    prelude::Backend,
    tensor::{Tensor, activation::softmax},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    boxes::BoxCoder,
    debug::ensure_finite,
    error::RFCNError,
    layers::CascadeStage,
    models::ps_head::ScoreMapHead,
    pooling::{PoolingMode, flatten_cells, ps_roi_pool, vote},
};

/// Where the features each stage pools from come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CascadeStrategy {
    /// The tail runs once, on the initial proposals, and every stage reuses its output.
    #[default]
    SharedFeatures,
    /// The tail runs again in front of every stage, on that stage's proposals.
    ReextractPerStage,
}

/// Progress of a cascade run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeState {
    Running(CascadeStage),
    Done,
}

impl CascadeState {
    pub fn start() -> Self {
        CascadeState::Running(CascadeStage::First)
    }

    pub fn advance(self) -> Self {
        match self {
            CascadeState::Running(stage) => stage
                .next()
                .map_or(CascadeState::Done, CascadeState::Running),
            CascadeState::Done => CascadeState::Done,
        }
    }
}

/// Feature computation between the backbone and the score-map heads.
pub trait TailFeatures<B: Backend> {
    /// # Arguments
    ///
    /// * `features` - Backbone output of one image, `[1, channels, height, width]`.
    /// * `rois` - The proposals the next stage pools, `[num_rois, 4]` xyxy.
    fn extract(&self, features: Tensor<B, 4>, rois: Tensor<B, 2>) -> Tensor<B, 4>;
}

/// Hands the backbone features through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedTail;

impl<B: Backend> TailFeatures<B> for SharedTail {
    fn extract(&self, features: Tensor<B, 4>, _rois: Tensor<B, 2>) -> Tensor<B, 4> {
        features
    }
}

/// What the last stage hands on to post-processing.
#[derive(Debug, Clone)]
pub struct CascadeOutput<B: Backend> {
    /// Class probabilities of the last stage, `[num_rois, num_classes + 1]`.
    pub scores: Tensor<B, 2>,
    /// Boxes refined by the last stage, `[num_rois, 4]` xyxy.
    pub boxes: Tensor<B, 2>,
    /// Per-cell offsets of the last stage before voting, `[num_rois, 4 * k * k]`.
    pub cell_offsets: Tensor<B, 2>,
}

/// Runs the three refinement stages of one image.
///
/// ```text
///  proposals ─> stage1 ─ boxes ─> stage2 ─ boxes ─> stage3 ─ boxes ─> output
///                  │                 │                 │
///               (scores           (scores           scores ─────────> output
///               dropped)          dropped)
/// ```
///
/// Every stage builds its score maps, pools them on the current proposals, votes the grid
/// into class logits and box offsets, and decodes the offsets against the proposals. The
/// decoded boxes replace the proposals of the next stage.
#[derive(Debug, Clone, Copy)]
pub struct CascadeController {
    pub strategy: CascadeStrategy,
    pub grid_size: usize,
    pub stride: f32,
    pub pooling: PoolingMode,
}

impl CascadeController {
    pub fn new(
        strategy: CascadeStrategy,
        grid_size: usize,
        stride: f32,
        pooling: PoolingMode,
    ) -> Self {
        Self {
            strategy,
            grid_size,
            stride,
            pooling,
        }
    }

    /// # Arguments
    ///
    /// * `heads` - One head per [`CascadeStage`], in stage order.
    /// * `tail` - Feature computation in front of the heads.
    /// * `features` - Backbone output of one image, `[1, channels, height, width]`.
    /// * `proposals` - `[num_rois, 4]` xyxy in image coordinates.
    /// * `coder` - Decoder shared by all stages, clipping to this image when enabled.
    ///
    /// # Returns
    ///
    /// * `None` when there are no proposals, otherwise the last stage's output.
    pub fn run<B, H, T>(
        &self,
        heads: &[H],
        tail: &T,
        features: Tensor<B, 4>,
        proposals: Tensor<B, 2>,
        coder: &BoxCoder,
    ) -> Result<Option<CascadeOutput<B>>, RFCNError>
    where
        B: Backend,
        H: ScoreMapHead<B>,
        T: TailFeatures<B>,
    {
        if heads.len() != CascadeStage::count() {
            return Err(RFCNError::Configuration(format!(
                "cascade needs {} heads, got {}",
                CascadeStage::count(),
                heads.len()
            )));
        }

        let [num_rois, _] = proposals.dims();
        if num_rois == 0 {
            warn!("no proposals, skipping cascade");
            return Ok(None);
        }

        ensure_finite(&proposals, "proposals")?;

        let shared = match self.strategy {
            CascadeStrategy::SharedFeatures => {
                Some(tail.extract(features.clone(), proposals.clone()))
            }
            CascadeStrategy::ReextractPerStage => None,
        };

        let mut rois = proposals;
        let mut output = None;
        let mut state = CascadeState::start();

        while let CascadeState::Running(stage) = state {
            let head = &heads[stage as usize];

            let stage_features = match &shared {
                Some(shared) => shared.clone(),
                None => tail.extract(features.clone(), rois.clone()),
            };

            let maps = head.score_maps(stage_features);

            let [_, bbox_channels, _, _] = maps.bbox.dims();
            let cells = self.grid_size * self.grid_size;
            if bbox_channels != 4 * cells {
                return Err(RFCNError::ChannelMismatch {
                    channels: bbox_channels,
                    cells: 4 * cells,
                });
            }

            let cls_grid = self.pool(maps.cls, rois.clone())?;
            let bbox_grid = self.pool(maps.bbox, rois.clone())?;

            let logits = vote(cls_grid);
            let offsets = vote(bbox_grid.clone());

            let decoded = coder.decode(offsets, rois);
            if decoded.clamped > 0 {
                warn!(%stage, clamped = decoded.clamped, "box scale offsets clamped before exp");
            }

            debug!(%stage, num_rois, "stage done");

            rois = decoded.boxes;

            if stage.is_last() {
                ensure_finite(&rois, "refined boxes")?;

                output = Some(CascadeOutput {
                    scores: softmax(logits, 1),
                    boxes: rois.clone(),
                    cell_offsets: flatten_cells(bbox_grid),
                });
            }

            state = state.advance();
        }

        Ok(output)
    }

    fn pool<B: Backend>(
        &self,
        score_map: Tensor<B, 4>,
        rois: Tensor<B, 2>,
    ) -> Result<Tensor<B, 4>, RFCNError> {
        ps_roi_pool(
            score_map,
            rois,
            0,
            self.grid_size,
            self.stride,
            self.pooling,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{
        class_decoder::ClassDecoder, config::NmsConfig, models::ps_head::ScoreMaps,
        models::rfcn::to_detections,
    };
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::TensorData,
    };

    type B = NdArray<f32>;

    const K: usize = 3;
    const SIDE: usize = 6;

    /// Score maps fixed at construction.
    struct FixedHead {
        maps: ScoreMaps<B>,
        stage: CascadeStage,
    }

    impl ScoreMapHead<B> for FixedHead {
        fn score_maps(&self, _features: Tensor<B, 4>) -> ScoreMaps<B> {
            self.maps.clone()
        }

        fn stage(&self) -> CascadeStage {
            self.stage
        }
    }

    /// Records the proposals it is asked to extract for.
    #[derive(Default)]
    struct RecordingTail {
        calls: RefCell<Vec<Vec<f32>>>,
    }

    impl TailFeatures<B> for RecordingTail {
        fn extract(&self, features: Tensor<B, 4>, rois: Tensor<B, 2>) -> Tensor<B, 4> {
            self.calls
                .borrow_mut()
                .push(rois.to_data().to_vec::<f32>().unwrap());
            features
        }
    }

    // Class maps holding `top_left` logits in the top-left 3x3 quadrant and `bottom_right`
    // logits in the bottom-right one, for every grid cell bank.
    fn quadrant_maps(
        top_left: [f32; 3],
        bottom_right: [f32; 3],
        offsets: [f32; 4],
    ) -> ScoreMaps<B> {
        let device = &NdArrayDevice::default();
        let cpc = top_left.len();
        let mut cls = vec![0.0f32; K * K * cpc * SIDE * SIDE];

        for cell in 0..K * K {
            for c in 0..cpc {
                let plane = (cell * cpc + c) * SIDE * SIDE;
                for y in 0..SIDE {
                    for x in 0..SIDE {
                        cls[plane + y * SIDE + x] = match (y < 3, x < 3) {
                            (true, true) => top_left[c],
                            (false, false) => bottom_right[c],
                            _ => -50.0,
                        };
                    }
                }
            }
        }

        let mut bbox = vec![0.0f32; K * K * 4 * SIDE * SIDE];
        for cell in 0..K * K {
            for (c, offset) in offsets.iter().enumerate() {
                let plane = (cell * 4 + c) * SIDE * SIDE;
                bbox[plane..plane + SIDE * SIDE].fill(*offset);
            }
        }

        ScoreMaps {
            cls: Tensor::from_data(TensorData::new(cls, [1, K * K * cpc, SIDE, SIDE]), device),
            bbox: Tensor::from_data(TensorData::new(bbox, [1, K * K * 4, SIDE, SIDE]), device),
        }
    }

    fn fixed_heads(maps: ScoreMaps<B>) -> Vec<FixedHead> {
        CascadeStage::as_list()
            .into_iter()
            .map(|stage| FixedHead {
                maps: maps.clone(),
                stage,
            })
            .collect()
    }

    fn controller(strategy: CascadeStrategy) -> CascadeController {
        CascadeController::new(strategy, K, 1.0, PoolingMode::Average)
    }

    fn proposals() -> Tensor<B, 2> {
        Tensor::from_data(
            [[0.0, 0.0, 3.0, 3.0], [3.0, 3.0, 6.0, 6.0]],
            &NdArrayDevice::default(),
        )
    }

    #[test]
    fn test_end_to_end_single_detection() {
        let device = &NdArrayDevice::default();

        // softmax of log-probabilities gives the probabilities back
        let confident = [0.05f32.ln(), 0.9f32.ln(), 0.05f32.ln()];
        let unsure = [0.3f32.ln(), 0.4f32.ln(), 0.3f32.ln()];
        let heads = fixed_heads(quadrant_maps(confident, unsure, [0.0; 4]));

        let features = Tensor::<B, 4>::zeros([1, 1, SIDE, SIDE], device);
        let coder = BoxCoder::default().with_clip_to(Some((SIDE as f32, SIDE as f32)));

        let output = controller(CascadeStrategy::SharedFeatures)
            .run(&heads, &SharedTail, features, proposals(), &coder)
            .unwrap()
            .unwrap();

        assert_eq!(output.scores.dims(), [2, 3]);
        assert_eq!(output.cell_offsets.dims(), [2, 4 * K * K]);

        let detections = to_detections(
            output,
            &ClassDecoder::new(2, 0.5),
            &NmsConfig::new(),
        )
        .unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].cls_id, 1);
        assert!((detections[0].score - 0.9).abs() < 1e-4);
        for (got, want) in detections[0].bbox.iter().zip([0.0, 0.0, 3.0, 3.0]) {
            assert!((got - want).abs() < 1e-4);
        }
    }

    #[test]
    fn test_stages_feed_refined_boxes_forward() {
        let device = &NdArrayDevice::default();

        // every stage shifts the boxes right by a tenth of their width
        let heads = fixed_heads(quadrant_maps([0.0; 3], [0.0; 3], [0.1, 0.0, 0.0, 0.0]));
        let features = Tensor::<B, 4>::zeros([1, 1, SIDE, SIDE], device);
        let tail = RecordingTail::default();

        let output = controller(CascadeStrategy::ReextractPerStage)
            .run(&heads, &tail, features, proposals(), &BoxCoder::default())
            .unwrap()
            .unwrap();

        let calls = tail.calls.borrow();
        assert_eq!(calls.len(), 3);

        // x1 of the first proposal: 0.0, then 0.3, then 0.6 (width stays 3)
        let first_x1: Vec<f32> = calls.iter().map(|rois| rois[0]).collect();
        for (got, want) in first_x1.iter().zip([0.0, 0.3, 0.6]) {
            assert!((got - want).abs() < 1e-4);
        }

        let boxes = output.boxes.to_data().to_vec::<f32>().unwrap();
        assert!((boxes[0] - 0.9).abs() < 1e-4);
        assert!((boxes[2] - 3.9).abs() < 1e-4);
    }

    #[test]
    fn test_shared_features_extract_once() {
        let device = &NdArrayDevice::default();
        let heads = fixed_heads(quadrant_maps([0.0; 3], [0.0; 3], [0.0; 4]));
        let tail = RecordingTail::default();

        controller(CascadeStrategy::SharedFeatures)
            .run(
                &heads,
                &tail,
                Tensor::<B, 4>::zeros([1, 1, SIDE, SIDE], device),
                proposals(),
                &BoxCoder::default(),
            )
            .unwrap();

        assert_eq!(tail.calls.borrow().len(), 1);
    }

    #[test]
    fn test_empty_proposals_short_circuit() {
        let device = &NdArrayDevice::default();
        let heads = fixed_heads(quadrant_maps([0.0; 3], [0.0; 3], [0.0; 4]));
        let empty = Tensor::<B, 2>::from_data(TensorData::new(Vec::<f32>::new(), [0, 4]), device);

        let output = controller(CascadeStrategy::SharedFeatures)
            .run(
                &heads,
                &SharedTail,
                Tensor::<B, 4>::zeros([1, 1, SIDE, SIDE], device),
                empty,
                &BoxCoder::default(),
            )
            .unwrap();

        assert!(output.is_none());
    }

    #[test]
    fn test_requires_three_heads() {
        let device = &NdArrayDevice::default();
        let mut heads = fixed_heads(quadrant_maps([0.0; 3], [0.0; 3], [0.0; 4]));
        heads.pop();

        let err = controller(CascadeStrategy::SharedFeatures)
            .run(
                &heads,
                &SharedTail,
                Tensor::<B, 4>::zeros([1, 1, SIDE, SIDE], device),
                proposals(),
                &BoxCoder::default(),
            )
            .unwrap_err();

        assert!(matches!(err, RFCNError::Configuration(_)));
    }

    #[test]
    fn test_state_walks_to_done() {
        let mut state = CascadeState::start();
        let mut visited = vec![];

        while let CascadeState::Running(stage) = state {
            visited.push(stage);
            state = state.advance();
        }

        assert_eq!(visited, CascadeStage::as_list());
        assert_eq!(state.advance(), CascadeState::Done);
    }
}
