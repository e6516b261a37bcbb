use burn::config::Config;
use {argh::FromArgs, std::fmt::Debug};

use crate::{
    boxes::{BoxCoder, DEFAULT_XFORM_CLIP},
    cascade::CascadeStrategy,
    error::RFCNError,
    pooling::PoolingMode,
};

pub const CONFIG_PATH: &str = "./config/rfcn_config.json";

/// “R-FCN: Object Detection via Region-based Fully Convolutional Networks”
/// Authors: Jifeng Dai, Yi Li, Kaiming He, Jian Sun
/// Link (official): https://arxiv.org/abs/1605.06409
///
/// Implementation - Section 3
///
/// Our R-FCN is built on ResNet-101, the last convolutional block of which is 2048-d. We
/// attach a randomly initialized 1×1 convolutional layer for reducing dimension (to be
/// precise, this increases the depth in Table 1 by 1). The last layer of ResNet-101 then
/// produces k²(C+1) score maps for classification and 4k² maps for bounding box regression.
/// The feature stride is 16 pixels; we use k × k = 7 × 7 position-sensitive score maps.
///
/// Construction-time settings of the detection head. Everything in here is fixed once the
/// model is built; see [`NmsConfig`] for what can change between calls.
#[derive(Config, Debug)]
pub struct RFCNConfig {
    /// Foreground class names. The background class is implicit and always id `0`.
    pub classes: Vec<String>,
    /// Only `"pspool"` is supported.
    #[config(default = "String::from(\"pspool\")")]
    pub roi_mode: String,
    /// Position-sensitive grid `(h, w)`, both entries must be equal.
    #[config(default = "[7, 7]")]
    pub roi_size: [usize; 2],
    /// Input image pixels per feature-map cell.
    #[config(default = 16.0)]
    pub stride: f32,
    /// Clip the decoded boxes to the image.
    #[config(default = true)]
    pub clip: bool,
    #[config(default = "PoolingMode::Average")]
    pub pooling: PoolingMode,
    /// Backbone feature depth.
    #[config(default = 2048)]
    pub in_channels: usize,
    /// Width of the 1×1 reduction in front of the score maps.
    #[config(default = 1024)]
    pub hidden_channels: usize,
    /// Standard deviation of the normal weight init.
    #[config(default = 0.01)]
    pub init_std: f64,
    /// Class score a detection must exceed.
    #[config(default = 0.01)]
    pub score_thresh: f32,
    #[config(default = "[1.0, 1.0, 1.0, 1.0]")]
    pub box_weights: [f32; 4],
    #[config(default = "DEFAULT_XFORM_CLIP")]
    pub xform_clip: f32,
    #[config(default = "CascadeStrategy::SharedFeatures")]
    pub cascade: CascadeStrategy,
    /// Shorter image side the detector is run at.
    #[config(default = 600)]
    pub short: usize,
    /// Upper bound of the longer image side.
    #[config(default = 1000)]
    pub max_size: usize,
}

impl RFCNConfig {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Grid size `k`, once `roi_size` is known to be square.
    pub fn grid_size(&self) -> Result<usize, RFCNError> {
        let [h, w] = self.roi_size;

        if h != w {
            return Err(RFCNError::Configuration(format!(
                "roi_size must have equal dimensions, got ({h}, {w})"
            )));
        }

        if h == 0 {
            return Err(RFCNError::Configuration("roi_size must be positive".into()));
        }

        Ok(h)
    }

    /// Checks everything that has to hold before any weights are created.
    pub fn validate(&self) -> Result<(), RFCNError> {
        if self.num_classes() == 0 {
            return Err(RFCNError::Configuration(
                "at least one foreground class is required".into(),
            ));
        }

        if !self.roi_mode.eq_ignore_ascii_case("pspool") {
            return Err(RFCNError::Configuration(format!(
                "unsupported roi_mode '{}', only 'pspool' is available",
                self.roi_mode
            )));
        }

        self.grid_size()?;

        if !(self.stride > 0.0) {
            return Err(RFCNError::Configuration(format!(
                "stride must be positive, got {}",
                self.stride
            )));
        }

        if self.box_weights.iter().any(|w| !(*w > 0.0)) {
            return Err(RFCNError::Configuration(format!(
                "box_weights must be positive, got {:?}",
                self.box_weights
            )));
        }

        Ok(())
    }

    /// Box coder for one image of size `(width, height)`.
    pub fn box_coder(&self, image_size: (f32, f32)) -> BoxCoder {
        let [w1, w2, w3, w4] = self.box_weights;

        BoxCoder::new((w1, w2, w3, w4))
            .with_xform_clip(self.xform_clip)
            .with_clip_to(self.clip.then_some(image_size))
    }

    /// Scale that brings an image to `short` pixels on its shorter side without letting the
    /// longer side exceed `max_size`.
    pub fn image_scale(&self, (width, height): (f32, f32)) -> f32 {
        let short_side = width.min(height);
        let long_side = width.max(height);

        let scale = self.short as f32 / short_side;

        if (long_side * scale).round() > self.max_size as f32 {
            self.max_size as f32 / long_side
        } else {
            scale
        }
    }
}

/// Post-processing settings, replaced as a whole through `RFCN::set_nms` or passed per call.
///
/// Negative `nms_topk`/`post_nms` mean no limit, a `nms_thresh` outside `(0, 1]` disables
/// suppression.
#[derive(Config, Debug, PartialEq)]
pub struct NmsConfig {
    /// IoU at or above which a lower scored box of the same class is dropped.
    #[config(default = 0.3)]
    pub nms_thresh: f32,
    /// Detections kept per class before suppression.
    #[config(default = 400)]
    pub nms_topk: i64,
    /// Detections kept per image after all classes are merged.
    #[config(default = 100)]
    pub post_nms: i64,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Top-level command.
pub struct RFCNCmd {
    #[argh(subcommand)]
    pub commands: Commands,
    #[argh(option)]
    /// object names to detect e.g 'dog,cat,person', defaults to the VOC classes
    pub o: Option<String>,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Demo(SubCommandDemo),
    InitConfig(SubCommandInitConfig),
}

#[derive(FromArgs, PartialEq, Debug)]
/// Run the cascade on synthetic features and proposals
#[argh(subcommand, name = "demo")]
pub struct SubCommandDemo {
    #[argh(option)]
    /// config file to build the model from (Ex: ./config/rfcn_config.json)
    pub c: Option<String>,
    #[argh(option)]
    /// iou overlap - boxes of the same class overlapping at least this much are merged
    pub i: Option<f32>,
    #[argh(option)]
    /// detections kept per class before suppression, -1 for all
    pub k: Option<i64>,
    #[argh(option)]
    /// detections kept per image, -1 for all
    pub n: Option<i64>,
    #[argh(option)]
    /// number of random proposals per image
    pub r: Option<usize>,
    #[argh(option)]
    /// random seed
    pub s: Option<u64>,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Write the default model config to disk
#[argh(subcommand, name = "init-config")]
pub struct SubCommandInitConfig {
    #[argh(option)]
    /// output path, defaults to ./config/rfcn_config.json
    pub p: Option<String>,
}
