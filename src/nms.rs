use std::collections::BTreeMap;

use crate::{boxes::iou, config::NmsConfig};

/// A decoded detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Foreground class id, `1..=num_classes`.
    pub cls_id: usize,
    pub score: f32,
    /// Box in `xyxy` image coordinates.
    pub bbox: [f32; 4],
}

/// Multi-class non-maximum suppression.
///
/// For every class independently the detections are sorted by descending score, cut to
/// `nms_topk` and greedily suppressed: a detection is kept only if its IoU with every
/// detection already kept for that class is below `nms_thresh`. The survivors of all classes
/// are merged, sorted by descending score and cut to `post_nms`.
///
/// ```text
///  class 1: 0.9 ─┐               class 2: 0.8 ─┐
///           0.7  ├─ suppress              0.3  ├─ suppress
///           0.2 ─┘                             ┘
///                 \_______ merge, sort, post_nms _______/
/// ```
///
/// A `nms_thresh` outside `(0, 1]` disables suppression and a negative `nms_topk`/`post_nms`
/// means no limit. Equal scores keep their input order.
pub fn nms(detections: Vec<Detection>, config: &NmsConfig) -> Vec<Detection> {
    let mut per_class: BTreeMap<usize, Vec<Detection>> = BTreeMap::new();

    for det in detections {
        per_class.entry(det.cls_id).or_default().push(det);
    }

    let mut kept: Vec<Detection> = per_class
        .into_values()
        .flat_map(|class_dets| suppress_class(class_dets, config))
        .collect();

    sort_by_score(&mut kept);
    truncate(&mut kept, config.post_nms);

    kept
}

fn suppress_class(mut dets: Vec<Detection>, config: &NmsConfig) -> Vec<Detection> {
    sort_by_score(&mut dets);
    truncate(&mut dets, config.nms_topk);

    if !suppression_enabled(config.nms_thresh) {
        return dets;
    }

    let mut kept: Vec<Detection> = Vec::with_capacity(dets.len());

    for det in dets {
        if kept.iter().all(|k| iou(&k.bbox, &det.bbox) < config.nms_thresh) {
            kept.push(det);
        }
    }

    kept
}

fn suppression_enabled(nms_thresh: f32) -> bool {
    nms_thresh > 0.0 && nms_thresh <= 1.0
}

// stable, so equal scores keep their order
fn sort_by_score(dets: &mut [Detection]) {
    dets.sort_by(|a, b| b.score.total_cmp(&a.score));
}

fn truncate(dets: &mut Vec<Detection>, limit: i64) {
    if let Ok(limit) = usize::try_from(limit) {
        dets.truncate(limit);
    }
}
