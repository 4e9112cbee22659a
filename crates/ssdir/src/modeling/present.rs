//! Presence (`z_present`) encoder.

use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder};

use super::flatten_cells;
use crate::{detection::ssd::LayerInfo, iter::zip_levels};

/// Predicts the probability that an object exists at each anchor.
///
/// There is no background entry. The background is always present.
pub struct PresentEncoder {
    encoders: Vec<Conv2d>,
}

impl PresentEncoder {
    pub fn new(
        layers: &[LayerInfo],
        channels: &[usize],
        vb: VarBuilder<'_>,
    ) -> anyhow::Result<Self> {
        if layers.len() != channels.len() {
            anyhow::bail!(
                "presence encoder got {} layers, but {} channel counts",
                layers.len(),
                channels.len()
            );
        }
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let encoders = layers
            .iter()
            .zip(channels)
            .enumerate()
            .map(|(i, (layer, &c))| {
                candle_nn::conv2d(c, layer.boxes_per_cell(), 3, cfg, vb.pp(format!("level{i}")))
            })
            .collect::<candle_core::Result<_>>()?;
        Ok(Self { encoders })
    }

    /// Computes `[N, anchors, 1]` presence probabilities.
    pub fn forward(&self, features: &[Tensor]) -> anyhow::Result<Tensor> {
        let mut probs = Vec::with_capacity(features.len());
        for (feature, encoder) in zip_levels(features, &self.encoders)? {
            let logits = encoder.forward(feature)?;
            probs.push(flatten_cells(&candle_nn::ops::sigmoid(&logits)?, 1)?);
        }
        Ok(Tensor::cat(&probs, 1)?)
    }
}
