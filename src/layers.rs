use serde::{Deserialize, Serialize};

/// Per-parameter learning-rate multipliers of a stage's convolutions.
///
/// Inference never reads these; they are carried so an external optimizer can scale the
/// gradient step of each stage's weights and biases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrMultipliers {
    pub weight_lr_mult: f64,
    pub bias_lr_mult: f64,
}

/// The refinement stages of the R-FCN cascade.
///
/// Each variant owns an independent position-sensitive head. Stage one scores the proposals
/// handed in by the region proposal network, every later stage re-pools on the boxes refined by
/// the stage before it.
///
/// “R-FCN: Object Detection via Region-based Fully Convolutional Networks”
/// Authors: Jifeng Dai, Yi Li, Kaiming He, Jian Sun
/// Link (official): https://arxiv.org/abs/1605.06409
///
/// The later stages see progressively better localised regions and are trained with amplified
/// learning rates, doubling at every step of the cascade.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CascadeStage {
    /// Scores the raw proposals.
    First,
    /// Re-scores the boxes refined by `First`.
    Second,
    /// Produces the reported scores and final boxes.
    Third,
}

impl CascadeStage {
    /// Returns all stages in execution order.
    pub fn as_list() -> Vec<CascadeStage> {
        vec![CascadeStage::First, CascadeStage::Second, CascadeStage::Third]
    }

    pub fn count() -> usize {
        Self::as_list().len()
    }

    /// Returns the 1-based position of the stage in the cascade.
    pub fn get_id(&self) -> usize {
        *self as usize + 1
    }

    /// Returns the stage that runs after this one, `None` for the last stage.
    pub fn next(&self) -> Option<CascadeStage> {
        match self {
            CascadeStage::First => Some(CascadeStage::Second),
            CascadeStage::Second => Some(CascadeStage::Third),
            CascadeStage::Third => None,
        }
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }

    /// Learning-rate multipliers of the stage's projections.
    ///
    /// Stage one only amplifies the biases (1x weight / 2x bias), the second stage doubles both
    /// (2x / 4x) and the third doubles again (4x / 8x).
    pub fn lr_multipliers(&self) -> LrMultipliers {
        match self {
            CascadeStage::First => LrMultipliers {
                weight_lr_mult: 1.0,
                bias_lr_mult: 2.0,
            },
            CascadeStage::Second => LrMultipliers {
                weight_lr_mult: 2.0,
                bias_lr_mult: 4.0,
            },
            CascadeStage::Third => LrMultipliers {
                weight_lr_mult: 4.0,
                bias_lr_mult: 8.0,
            },
        }
    }
}

impl std::fmt::Display for CascadeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stage{}", self.get_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_list_order_and_contents() {
        let stages = CascadeStage::as_list();
        assert_eq!(stages.len(), 3);
        assert_eq!(CascadeStage::count(), 3);
        assert!(matches!(stages[0], CascadeStage::First));
        assert!(matches!(stages[1], CascadeStage::Second));
        assert!(matches!(stages[2], CascadeStage::Third));
    }

    #[test]
    fn test_get_id_is_one_based() {
        for (index, stage) in CascadeStage::as_list().iter().enumerate() {
            assert_eq!(stage.get_id(), index + 1);
        }
        assert_eq!(CascadeStage::Second.to_string(), "stage2");
    }

    #[test]
    fn test_next_walks_the_cascade() {
        assert_eq!(CascadeStage::First.next(), Some(CascadeStage::Second));
        assert_eq!(CascadeStage::Second.next(), Some(CascadeStage::Third));
        assert_eq!(CascadeStage::Third.next(), None);
        assert!(CascadeStage::Third.is_last());
        assert!(!CascadeStage::First.is_last());
    }

    #[test]
    fn test_lr_multipliers_double_per_stage() {
        let mults: Vec<_> = CascadeStage::as_list()
            .iter()
            .map(|s| s.lr_multipliers())
            .collect();

        assert_eq!((mults[0].weight_lr_mult, mults[0].bias_lr_mult), (1.0, 2.0));
        assert_eq!((mults[1].weight_lr_mult, mults[1].bias_lr_mult), (2.0, 4.0));
        assert_eq!((mults[2].weight_lr_mult, mults[2].bias_lr_mult), (4.0, 8.0));
    }
}
