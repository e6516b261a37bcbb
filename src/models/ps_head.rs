use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        Initializer,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::Backend,
    tensor::{Tensor, activation::relu},
};

use crate::{
    config::RFCNConfig,
    error::RFCNError,
    layers::{CascadeStage, LrMultipliers},
};

/// Dense position-sensitive score maps of one stage.
#[derive(Debug, Clone)]
pub struct ScoreMaps<B: Backend> {
    /// `[batch, (num_classes + 1) * k * k, height, width]`
    pub cls: Tensor<B, 4>,
    /// `[batch, 4 * k * k, height, width]`
    pub bbox: Tensor<B, 4>,
}

/// Anything that turns backbone features into one stage's score maps.
///
/// [`PositionSensitiveHead`] is the learned implementation; tests drive the cascade with
/// hand-built maps through the same seam.
pub trait ScoreMapHead<B: Backend> {
    fn score_maps(&self, features: Tensor<B, 4>) -> ScoreMaps<B>;

    fn stage(&self) -> CascadeStage;
}

#[derive(Config, Debug)]
pub struct PsHeadConfig {
    pub stage: CascadeStage,
    pub in_channels: usize,
    pub num_classes: usize,
    pub lr: LrMultipliers,
    #[config(default = 1024)]
    pub hidden_channels: usize,
    #[config(default = 7)]
    pub grid_size: usize,
    #[config(default = 0.01)]
    pub init_std: f64,
}

impl PsHeadConfig {
    /// Head settings for `stage`, taken from the model config.
    pub fn for_stage(stage: CascadeStage, config: &RFCNConfig) -> Result<Self, RFCNError> {
        Ok(Self::new(
            stage,
            config.in_channels,
            config.num_classes(),
            stage.lr_multipliers(),
        )
        .with_hidden_channels(config.hidden_channels)
        .with_grid_size(config.grid_size()?)
        .with_init_std(config.init_std))
    }

    pub fn cls_channels(&self) -> usize {
        (self.num_classes + 1) * self.grid_size * self.grid_size
    }

    pub fn bbox_channels(&self) -> usize {
        4 * self.grid_size * self.grid_size
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> PositionSensitiveHead<B> {
        let initializer = Initializer::Normal {
            mean: 0.0,
            std: self.init_std,
        };

        // 1x1 dimension reduction on top of the backbone
        let conv_new = Conv2dConfig::new([self.in_channels, self.hidden_channels], [1, 1])
            .with_initializer(initializer.clone())
            .init(device);

        let rfcn_cls = Conv2dConfig::new([self.hidden_channels, self.cls_channels()], [1, 1])
            .with_initializer(initializer.clone())
            .init(device);

        let rfcn_bbox = Conv2dConfig::new([self.hidden_channels, self.bbox_channels()], [1, 1])
            .with_initializer(initializer)
            .init(device);

        PositionSensitiveHead {
            conv_new,
            rfcn_cls,
            rfcn_bbox,
            stage: Ignored(self.stage),
            lr: Ignored(self.lr),
        }
    }
}

/// One cascade stage: `relu(conv_new)` followed by the classification and regression
/// projections.
///
/// ```text
///                          ┌─ rfcn_cls  ─> (C+1)·k² maps
/// features ─ conv_new ─ relu
///                          └─ rfcn_bbox ─>     4·k² maps
/// ```
///
/// Every stage owns its three convolutions, no weights are shared across the cascade.
#[derive(Module, Debug)]
pub struct PositionSensitiveHead<B: Backend> {
    conv_new: Conv2d<B>,
    rfcn_cls: Conv2d<B>,
    rfcn_bbox: Conv2d<B>,
    stage: Ignored<CascadeStage>,
    lr: Ignored<LrMultipliers>,
}

impl<B: Backend> PositionSensitiveHead<B> {
    pub fn forward(&self, features: Tensor<B, 4>) -> ScoreMaps<B> {
        let hidden = relu(self.conv_new.forward(features));

        ScoreMaps {
            cls: self.rfcn_cls.forward(hidden.clone()),
            bbox: self.rfcn_bbox.forward(hidden),
        }
    }

    pub fn lr_multipliers(&self) -> LrMultipliers {
        self.lr.0
    }
}

impl<B: Backend> ScoreMapHead<B> for PositionSensitiveHead<B> {
    fn score_maps(&self, features: Tensor<B, 4>) -> ScoreMaps<B> {
        self.forward(features)
    }

    fn stage(&self) -> CascadeStage {
        self.stage.0
    }
}
