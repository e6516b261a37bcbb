use burn::tensor::{Tensor, TensorData, backend::Backend};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::info;

use crate::{
    config::{NmsConfig, RFCNConfig},
    error::RFCNError,
    models::rfcn::{ImageProposals, Proposals, RFCN},
    nms::Detection,
};

/// Size of the synthetic input image before it is rescaled to `short`/`max_size`.
pub const DEMO_IMAGE_SIZE: (f32, f32) = (500.0, 375.0);

/// Smallest side of a random proposal, in pixels.
const MIN_PROPOSAL_SIDE: f32 = 16.0;

/// Runs a freshly initialised detection head on random backbone features and random
/// proposals, logging every detection that comes out of NMS.
///
/// There is no backbone and no proposal network here; the run exercises the full cascade,
/// class decoding and suppression path with the configured shapes.
///
/// # Parameters
/// - `config`: Model configuration, the demo image is sized from `short`/`max_size`.
/// - `nms`: Post-processing settings stored on the model.
/// - `num_proposals`: Random proposals generated for the image.
/// - `seed`: Seed of the feature and proposal generator.
/// - `device`: Device the model runs on.
pub fn demo<B: Backend>(
    config: RFCNConfig,
    nms: NmsConfig,
    num_proposals: usize,
    seed: u64,
    device: &B::Device,
) -> Result<Vec<Detection>, RFCNError> {
    let mut model: RFCN<B> = RFCN::new(config.clone(), device)?;
    model.set_nms(nms);

    let scale = config.image_scale(DEMO_IMAGE_SIZE);
    let width = (DEMO_IMAGE_SIZE.0 * scale).round();
    let height = (DEMO_IMAGE_SIZE.1 * scale).round();

    let feat_w = (width / config.stride).ceil() as usize;
    let feat_h = (height / config.stride).ceil() as usize;

    info!(
        width,
        height,
        feat_w,
        feat_h,
        num_proposals,
        "running cascade on synthetic input"
    );

    let mut rng = StdRng::seed_from_u64(seed);

    let features: Vec<f32> = (0..config.in_channels * feat_h * feat_w)
        .map(|_| rng.random::<f32>())
        .collect();
    let features = Tensor::<B, 4>::from_data(
        TensorData::new(features, [1, config.in_channels, feat_h, feat_w]),
        device,
    );

    let rois = random_proposals(&mut rng, num_proposals, (width, height));
    let proposals = Proposals::new(vec![ImageProposals {
        rois: Tensor::from_data(TensorData::new(rois, [num_proposals, 4]), device),
        image_size: (width, height),
    }]);

    let detections = model
        .detect(features, &proposals)?
        .into_iter()
        .next()
        .unwrap_or_else(|| Ok(Vec::new()))?;

    let names = model.class_names();

    for det in detections.iter() {
        info!(
            class = names.name(det.cls_id).unwrap_or("?"),
            score = det.score,
            bbox = ?det.bbox,
            "detection"
        );
    }

    info!(count = detections.len(), "done");

    Ok(detections)
}

// xyxy boxes at least MIN_PROPOSAL_SIDE wide and tall, inside the image
fn random_proposals(rng: &mut StdRng, count: usize, (width, height): (f32, f32)) -> Vec<f32> {
    let max_side = MIN_PROPOSAL_SIDE.max(width.min(height));

    (0..count)
        .flat_map(|_| {
            let w = rng.random_range(MIN_PROPOSAL_SIDE..=max_side);
            let h = rng.random_range(MIN_PROPOSAL_SIDE..=max_side);
            let x1 = rng.random_range(0.0..=(width - w).max(0.0));
            let y1 = rng.random_range(0.0..=(height - h).max(0.0));

            [x1, y1, x1 + w, y1 + h]
        })
        .collect()
}
