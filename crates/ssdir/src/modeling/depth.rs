//! Depth (`z_depth`) encoder.

use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder};

use super::{background::BackgroundHead, flatten_cells};
use crate::{iter::zip_levels, num};

/// Predicts the distribution of the ordering value of every slot.
///
/// Higher values end up in front when glimpses are composited.
pub struct DepthEncoder {
    loc_encoders: Vec<Conv2d>,
    scale_encoders: Vec<Conv2d>,
    background_loc: BackgroundHead,
    background_scale: BackgroundHead,
}

impl DepthEncoder {
    pub fn new(
        channels: &[usize],
        feature_maps: &[usize],
        vb: VarBuilder<'_>,
    ) -> anyhow::Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = |c, name: String| candle_nn::conv2d(c, 1, 3, cfg, vb.pp(name));

        let mut loc_encoders = Vec::with_capacity(channels.len());
        let mut scale_encoders = Vec::with_capacity(channels.len());
        for (i, &c) in channels.iter().enumerate() {
            loc_encoders.push(conv(c, format!("loc{i}"))?);
            scale_encoders.push(conv(c, format!("scale{i}"))?);
        }

        Ok(Self {
            loc_encoders,
            scale_encoders,
            background_loc: BackgroundHead::new(
                1,
                channels,
                feature_maps,
                vb.pp("background_loc"),
            )?,
            background_scale: BackgroundHead::new(
                1,
                channels,
                feature_maps,
                vb.pp("background_scale"),
            )?,
        })
    }

    /// Computes `(loc, scale)`, each `[N, slots + 1, 1]`, with a strictly positive `scale`.
    pub fn forward(&self, features: &[Tensor]) -> anyhow::Result<(Tensor, Tensor)> {
        let mut locs = Vec::with_capacity(features.len() + 1);
        let mut scales = Vec::with_capacity(features.len() + 1);
        let heads = self.loc_encoders.iter().zip(&self.scale_encoders);
        for (feature, (loc_enc, scale_enc)) in zip_levels(features, heads)? {
            locs.push(flatten_cells(&loc_enc.forward(feature)?, 1)?);
            scales.push(flatten_cells(&scale_enc.forward(feature)?, 1)?);
        }
        locs.push(self.background_loc.forward(features)?);
        scales.push(self.background_scale.forward(features)?);

        Ok((
            Tensor::cat(&locs, 1)?,
            num::softplus(&Tensor::cat(&scales, 1)?)?,
        ))
    }
}
