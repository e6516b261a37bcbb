use burn::{
    module::{Ignored, Module},
    prelude::Backend,
    tensor::{Tensor, TensorData, s},
};
use tracing::{debug, warn};

use crate::{
    cascade::{CascadeController, CascadeOutput, SharedTail, TailFeatures},
    class_decoder::ClassDecoder,
    config::{NmsConfig, RFCNConfig},
    error::RFCNError,
    labels::ClassNames,
    layers::{CascadeStage, LrMultipliers},
    models::ps_head::{PositionSensitiveHead, PsHeadConfig},
    nms::{Detection, nms},
};

/// Proposals of one image together with the image size they refer to.
#[derive(Debug, Clone)]
pub struct ImageProposals<B: Backend> {
    /// `[num_rois, 4]` xyxy in image coordinates.
    pub rois: Tensor<B, 2>,
    /// `(width, height)` of the image, used for clipping.
    pub image_size: (f32, f32),
}

/// Proposals of a batch, one entry per image.
#[derive(Debug, Clone)]
pub struct Proposals<B: Backend> {
    pub images: Vec<ImageProposals<B>>,
}

impl<B: Backend> Proposals<B> {
    pub fn new(images: Vec<ImageProposals<B>>) -> Self {
        Self { images }
    }

    /// Splits a batch of region proposals into per-image sets.
    ///
    /// # Arguments
    ///
    /// * `rois` - Tensor of shape `[num_rois, 5]`, rows `(batch_index, x1, y1, x2, y2)`.
    /// * `image_sizes` - `(width, height)` of every image in the batch.
    ///
    /// Images without a single row get an empty proposal set.
    pub fn from_rois(rois: Tensor<B, 2>, image_sizes: &[(f32, f32)]) -> Result<Self, RFCNError> {
        let [_, width] = rois.dims();
        if width != 5 {
            return Err(RFCNError::ScoreWidth {
                expected: 5,
                got: width,
            });
        }

        let device = rois.device();
        let rows = rois.into_data().convert::<f32>().to_vec::<f32>()?;
        let mut grouped: Vec<Vec<f32>> = vec![Vec::new(); image_sizes.len()];

        for row in rows.chunks_exact(5) {
            let index = row[0];

            // whole, finite and in range; NaN fails the first comparison
            if !(index >= 0.0 && index < image_sizes.len() as f32) || index.fract() != 0.0 {
                return Err(RFCNError::BatchIndex {
                    index,
                    images: image_sizes.len(),
                });
            }

            grouped[index as usize].extend_from_slice(&row[1..]);
        }

        let images = grouped
            .into_iter()
            .zip(image_sizes)
            .map(|(boxes, size)| {
                let count = boxes.len() / 4;
                ImageProposals {
                    rois: Tensor::from_data(TensorData::new(boxes, [count, 4]), &device),
                    image_size: *size,
                }
            })
            .collect();

        Ok(Self { images })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Cascaded R-FCN detection head.
///
/// “R-FCN: Object Detection via Region-based Fully Convolutional Networks”
/// Authors: Jifeng Dai, Yi Li, Kaiming He, Jian Sun
/// Link (official): https://arxiv.org/abs/1605.06409
///
/// Three [`PositionSensitiveHead`]s, one per [`CascadeStage`], sit on top of a backbone the
/// caller provides. Region proposals are scored and refined by each stage in turn, the last
/// stage's scores are decoded per class and the result goes through [`nms`].
#[derive(Module, Debug)]
pub struct RFCN<B: Backend> {
    pub stages: Vec<PositionSensitiveHead<B>>,
    config: Ignored<RFCNConfig>,
    nms: Ignored<NmsConfig>,
}

impl<B: Backend> RFCN<B> {
    /// Builds a freshly initialised head.
    ///
    /// Fails with `Configuration` when there are no classes, `roi_size` is not square or
    /// `roi_mode` is anything but `pspool`.
    pub fn new(config: RFCNConfig, device: &B::Device) -> Result<Self, RFCNError> {
        config.validate()?;

        let stages = CascadeStage::as_list()
            .into_iter()
            .map(|stage| Ok(PsHeadConfig::for_stage(stage, &config)?.init(device)))
            .collect::<Result<Vec<_>, RFCNError>>()?;

        debug!(
            classes = config.num_classes(),
            grid = config.roi_size[0],
            "built cascade heads"
        );

        Ok(Self {
            stages,
            config: Ignored(config),
            nms: Ignored(NmsConfig::new()),
        })
    }

    pub fn config(&self) -> &RFCNConfig {
        &self.config
    }

    pub fn class_names(&self) -> ClassNames {
        ClassNames::new(self.config.classes.clone())
    }

    /// Replaces the stored post-processing settings.
    pub fn set_nms(&mut self, nms: NmsConfig) {
        self.nms = Ignored(nms);
    }

    pub fn nms_config(&self) -> &NmsConfig {
        &self.nms
    }

    /// Learning-rate multipliers of every stage, in cascade order.
    pub fn lr_multipliers(&self) -> Vec<(CascadeStage, LrMultipliers)> {
        CascadeStage::as_list()
            .into_iter()
            .zip(self.stages.iter())
            .map(|(stage, head)| (stage, head.lr_multipliers()))
            .collect()
    }

    fn controller(&self) -> Result<CascadeController, RFCNError> {
        Ok(CascadeController::new(
            self.config.cascade,
            self.config.grid_size()?,
            self.config.stride,
            self.config.pooling,
        ))
    }

    /// Runs the cascade on one image and returns the raw last-stage output.
    ///
    /// # Arguments
    ///
    /// * `features` - Backbone output of the image, `[1, in_channels, height, width]`.
    /// * `proposals` - The image's proposals.
    /// * `tail` - Feature computation in front of every stage.
    pub fn forward_image<T: TailFeatures<B>>(
        &self,
        features: Tensor<B, 4>,
        proposals: &ImageProposals<B>,
        tail: &T,
    ) -> Result<Option<CascadeOutput<B>>, RFCNError> {
        let coder = self.config.box_coder(proposals.image_size);

        self.controller()?
            .run(&self.stages, tail, features, proposals.rois.clone(), &coder)
    }

    /// Detects objects with the stored NMS settings.
    pub fn detect(
        &self,
        features: Tensor<B, 4>,
        proposals: &Proposals<B>,
    ) -> Result<Vec<Result<Vec<Detection>, RFCNError>>, RFCNError> {
        self.detect_with(features, proposals, &self.nms)
    }

    /// Detects objects with explicit NMS settings.
    pub fn detect_with(
        &self,
        features: Tensor<B, 4>,
        proposals: &Proposals<B>,
        nms: &NmsConfig,
    ) -> Result<Vec<Result<Vec<Detection>, RFCNError>>, RFCNError> {
        self.detect_with_tail(features, proposals, nms, &SharedTail)
    }

    /// Detects objects in every image of the batch.
    ///
    /// # Arguments
    ///
    /// * `features` - Backbone output, `[batch, in_channels, height, width]`.
    /// * `proposals` - One proposal set per batch entry.
    /// * `nms` - Post-processing settings for this call.
    /// * `tail` - Feature computation in front of every stage.
    ///
    /// # Returns
    ///
    /// * One result per image, detections sorted by descending score. An image without
    ///   proposals yields an empty list, a failing image does not affect the others.
    pub fn detect_with_tail<T: TailFeatures<B>>(
        &self,
        features: Tensor<B, 4>,
        proposals: &Proposals<B>,
        nms: &NmsConfig,
        tail: &T,
    ) -> Result<Vec<Result<Vec<Detection>, RFCNError>>, RFCNError> {
        let [batch, _, _, _] = features.dims();

        if batch != proposals.len() {
            return Err(RFCNError::BatchMismatch {
                features: batch,
                proposals: proposals.len(),
            });
        }

        let decoder = ClassDecoder::new(self.config.num_classes(), self.config.score_thresh);

        let results = proposals
            .images
            .iter()
            .enumerate()
            .map(|(image, image_proposals)| {
                let image_features = features.clone().slice(s![image..image + 1]);

                let result = self
                    .forward_image(image_features, image_proposals, tail)
                    .and_then(|output| match output {
                        Some(output) => to_detections(output, &decoder, nms),
                        None => Ok(Vec::new()),
                    });

                if let Err(err) = &result {
                    warn!(image, %err, "skipping image");
                }

                result
            })
            .collect();

        Ok(results)
    }
}

/// Class decoding and NMS of one image's cascade output.
pub fn to_detections<B: Backend>(
    output: CascadeOutput<B>,
    decoder: &ClassDecoder,
    nms_config: &NmsConfig,
) -> Result<Vec<Detection>, RFCNError> {
    let candidates = decoder.decode(output.scores)?;
    let boxes = output.boxes.into_data().convert::<f32>().to_vec::<f32>()?;

    let detections = candidates
        .into_iter()
        .flatten()
        .map(|candidate| {
            let b = &boxes[candidate.region * 4..candidate.region * 4 + 4];
            Detection {
                cls_id: candidate.class_id,
                score: candidate.score,
                bbox: [b[0], b[1], b[2], b[3]],
            }
        })
        .collect();

    Ok(nms(detections, nms_config))
}
