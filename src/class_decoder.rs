use burn::{prelude::Backend, tensor::Tensor};

use crate::error::RFCNError;

/// A region that survived class decoding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassCandidate {
    /// Foreground class id, `1..=num_classes`.
    pub class_id: usize,
    pub score: f32,
    /// Row of the region in the score tensor.
    pub region: usize,
}

/// Turns per-region class scores into per-class candidate lists.
///
/// Column `0` of the scores is background. A region is reported under its arg-max class only,
/// and only when that class is a foreground class whose score is strictly above `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct ClassDecoder {
    num_classes: usize,
    threshold: f32,
}

impl ClassDecoder {
    pub fn new(num_classes: usize, threshold: f32) -> Self {
        Self {
            num_classes,
            threshold,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Decodes one image.
    ///
    /// # Arguments
    ///
    /// * `scores` - Tensor of shape `[num_regions, num_classes + 1]`.
    ///
    /// # Returns
    ///
    /// * `Vec<Vec<ClassCandidate>>` - One list per foreground class (entry `c - 1` holds class
    ///   `c`), regions in ascending order.
    ///
    /// Fails with `NonFinite` if any score is NaN or infinite.
    pub fn decode<B: Backend>(
        &self,
        scores: Tensor<B, 2>,
    ) -> Result<Vec<Vec<ClassCandidate>>, RFCNError> {
        let [_, width] = scores.dims();

        if width != self.num_classes + 1 {
            return Err(RFCNError::ScoreWidth {
                expected: self.num_classes + 1,
                got: width,
            });
        }

        let scores = scores.into_data().convert::<f32>().to_vec::<f32>()?;

        if scores.iter().any(|s| !s.is_finite()) {
            return Err(RFCNError::NonFinite("class scores"));
        }

        let mut per_class = vec![Vec::new(); self.num_classes];

        for (region, row) in scores.chunks_exact(width).enumerate() {
            let (class_id, score) = arg_max(row);

            if class_id == 0 || score <= self.threshold {
                continue;
            }

            per_class[class_id - 1].push(ClassCandidate {
                class_id,
                score,
                region,
            });
        }

        Ok(per_class)
    }
}

// first maximum wins, so ties go to the lowest class index
fn arg_max(row: &[f32]) -> (usize, f32) {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_score), (i, s)| {
            if *s > best_score {
                (i, *s)
            } else {
                (best, best_score)
            }
        })
}
