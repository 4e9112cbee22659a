//! The extra background slot shared by the appearance and depth encoders.

use candle_core::{Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder};
use itertools::izip;

use crate::iter::zip_levels;

/// Produces one value vector for the background slot from all feature map levels.
///
/// Every level is reduced to a single `out_size` vector by a convolution spanning the whole
/// feature map. The per-level vectors are concatenated and merged by a linear layer.
pub struct BackgroundHead {
    out_size: usize,
    level_convs: Vec<Conv2d>,
    merger: Linear,
}

impl BackgroundHead {
    pub fn new(
        out_size: usize,
        channels: &[usize],
        feature_maps: &[usize],
        vb: VarBuilder<'_>,
    ) -> anyhow::Result<Self> {
        if channels.len() != feature_maps.len() {
            anyhow::bail!(
                "background head got {} channel counts for {} feature maps",
                channels.len(),
                feature_maps.len(),
            );
        }

        // kernel == grid, so every level collapses to a 1x1 map
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 3,
            ..Default::default()
        };
        let mut level_convs = Vec::with_capacity(channels.len());
        for (i, &in_channels, &grid) in izip!(0.., channels, feature_maps) {
            level_convs.push(candle_nn::conv2d(
                in_channels,
                out_size,
                grid,
                cfg,
                vb.pp(format!("level{i}")),
            )?);
        }
        let merger = candle_nn::linear(channels.len() * out_size, out_size, vb.pp("merger"))?;

        Ok(Self {
            out_size,
            level_convs,
            merger,
        })
    }

    /// Computes the background entry as a `[N, 1, out_size]` tensor.
    pub fn forward(&self, features: &[Tensor]) -> anyhow::Result<Tensor> {
        let mut pooled = Vec::with_capacity(self.level_convs.len());
        for (level, (feature, conv)) in zip_levels(features, &self.level_convs)?.enumerate() {
            let out = conv.forward(feature)?;
            let (n, c, h, w) = out.dims4()?;
            if (c, h, w) != (self.out_size, 1, 1) {
                anyhow::bail!(
                    "background head reduced level {level} feature map of shape {:?} to {:?}, \
                     expected [N, {}, 1, 1]",
                    feature.dims(),
                    out.dims(),
                    self.out_size,
                );
            }
            pooled.push(out.reshape((n, c))?);
        }
        let merged = self.merger.forward(&Tensor::cat(&pooled, D::Minus1)?)?;
        Ok(merged.unsqueeze(1)?)
    }
}
