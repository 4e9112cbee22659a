//! Appearance (`z_what`) encoder and decoder.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Init, VarBuilder};
use itertools::izip;

use super::{background::BackgroundHead, flatten_cells};
use crate::{iter::zip_levels, num};

/// Side length of the glimpses produced by [`WhatDecoder`].
pub const GLIMPSE_SIZE: usize = 64;

/// Creates a 3x3, padding 1 convolution with Xavier-uniform weights and a zero bias.
pub(crate) fn xavier_conv3x3(
    in_channels: usize,
    out_channels: usize,
    vb: VarBuilder<'_>,
) -> candle_core::Result<Conv2d> {
    let bound = num::xavier_bound(in_channels * 9, out_channels * 9);
    let weight = vb.get_with_hints(
        (out_channels, in_channels, 3, 3),
        "weight",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, Some(bias), cfg))
}

/// Predicts the appearance distribution of every slot.
pub struct WhatEncoder {
    z_what_size: usize,
    loc_encoders: Vec<Conv2d>,
    scale_encoders: Vec<Conv2d>,
    background_loc: BackgroundHead,
    background_scale: BackgroundHead,
}

impl WhatEncoder {
    pub fn new(
        z_what_size: usize,
        channels: &[usize],
        feature_maps: &[usize],
        vb: VarBuilder<'_>,
    ) -> anyhow::Result<Self> {
        let mut loc_encoders = Vec::with_capacity(channels.len());
        let mut scale_encoders = Vec::with_capacity(channels.len());
        for (i, &c) in channels.iter().enumerate() {
            loc_encoders.push(xavier_conv3x3(c, z_what_size, vb.pp(format!("loc{i}")))?);
            scale_encoders.push(xavier_conv3x3(c, z_what_size, vb.pp(format!("scale{i}")))?);
        }

        Ok(Self {
            z_what_size,
            loc_encoders,
            scale_encoders,
            background_loc: BackgroundHead::new(
                z_what_size,
                channels,
                feature_maps,
                vb.pp("background_loc"),
            )?,
            background_scale: BackgroundHead::new(
                z_what_size,
                channels,
                feature_maps,
                vb.pp("background_scale"),
            )?,
        })
    }

    pub fn z_what_size(&self) -> usize {
        self.z_what_size
    }

    /// Computes `(loc, scale)`, each `[N, slots + 1, z_what_size]`.
    ///
    /// Slots are ordered by level and then row by row, the background slot comes last. `scale`
    /// is strictly positive.
    pub fn forward(&self, features: &[Tensor]) -> anyhow::Result<(Tensor, Tensor)> {
        let mut locs = Vec::with_capacity(features.len() + 1);
        let mut scales = Vec::with_capacity(features.len() + 1);
        let heads = self.loc_encoders.iter().zip(&self.scale_encoders);
        for (feature, (loc_enc, scale_enc)) in zip_levels(features, heads)? {
            locs.push(flatten_cells(&loc_enc.forward(feature)?, self.z_what_size)?);
            scales.push(flatten_cells(&scale_enc.forward(feature)?, self.z_what_size)?);
        }
        locs.push(self.background_loc.forward(features)?);
        scales.push(self.background_scale.forward(features)?);

        let loc = Tensor::cat(&locs, 1)?;
        let scale = num::softplus(&Tensor::cat(&scales, 1)?)?;
        Ok((loc, scale))
    }
}

/// Renders appearance codes into RGB glimpses.
///
/// Transposed convolutions grow a `1x1` code to `5x5`, `13x13`, `30x30` and finally
/// `64x64` pixels.
pub struct WhatDecoder {
    z_what_size: usize,
    layers: Vec<ConvTranspose2d>,
}

impl WhatDecoder {
    pub fn new(z_what_size: usize, vb: VarBuilder<'_>) -> anyhow::Result<Self> {
        let cfg = ConvTranspose2dConfig {
            stride: 2,
            ..Default::default()
        };
        let stack = [(z_what_size, 128, 5), (128, 64, 5), (64, 32, 6), (32, 3, 6)];
        let layers = izip!(0.., stack)
            .map(|(i, (in_c, out_c, kernel))| {
                candle_nn::conv_transpose2d(in_c, out_c, kernel, cfg, vb.pp(format!("layer{i}")))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            z_what_size,
            layers,
        })
    }
}

/// Maps `[..., z_what_size]` codes to `[n, 3, 64, 64]` glimpses with values in `(0, 1)`, where
/// `n` is the number of codes.
impl Module for WhatDecoder {
    fn forward(&self, z_what: &Tensor) -> candle_core::Result<Tensor> {
        let n = z_what.elem_count() / self.z_what_size;
        if n == 0 {
            return Tensor::zeros(
                (0, 3, GLIMPSE_SIZE, GLIMPSE_SIZE),
                DType::F32,
                z_what.device(),
            );
        }

        let mut xs = z_what.reshape((n, self.z_what_size, 1, 1))?;
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i + 1 < self.layers.len() {
                xs = xs.relu()?;
            }
        }
        candle_nn::ops::sigmoid(&xs)
    }
}

#[cfg(test)]
mod tests {
    use candle_nn::VarMap;

    use super::*;
    use crate::test;

    fn features(rng: &mut fastrand::Rng, batch: usize) -> Vec<Tensor> {
        let config = test::small_ssd_config();
        izip!(&config.channels, config.feature_maps())
            .map(|(&c, grid)| test::uniform(rng, (batch, c, grid, grid), -3.0, 3.0))
            .collect()
    }

    #[test]
    fn encoder_shapes() {
        let config = test::small_ssd_config();
        let varmap = VarMap::new();
        let encoder = WhatEncoder::new(
            6,
            &config.channels,
            &config.feature_maps(),
            test::var_builder(&varmap),
        )
        .unwrap();
        let mut rng = fastrand::Rng::with_seed(11);
        let (loc, scale) = encoder.forward(&features(&mut rng, 2)).unwrap();
        assert_eq!(loc.dims(), &[2, config.slot_count() + 1, 6]);
        assert_eq!(scale.dims(), loc.dims());
    }

    #[test]
    fn encoder_scale_positive() {
        let config = test::small_ssd_config();
        let varmap = VarMap::new();
        let encoder = WhatEncoder::new(
            4,
            &config.channels,
            &config.feature_maps(),
            test::var_builder(&varmap),
        )
        .unwrap();
        let mut rng = fastrand::Rng::with_seed(1234);
        // large inputs drive some pre-activations far below the point where `exp` underflows
        for magnitude in [1.0, 1.0, 1e3, 1e5] {
            let features = features(&mut rng, 1)
                .iter()
                .map(|f| (f * magnitude).unwrap())
                .collect::<Vec<_>>();
            let (_, scale) = encoder.forward(&features).unwrap();
            let scale = scale.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(scale.iter().all(|&s| s > 0.0 && s.is_finite()), "{scale:?}");
        }
    }

    #[test]
    fn xavier_init_bounds() {
        let varmap = VarMap::new();
        let conv = xavier_conv3x3(8, 4, test::var_builder(&varmap)).unwrap();
        let bound = num::xavier_bound(72, 36) as f32;
        let weights = conv.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(weights.iter().all(|w| w.abs() <= bound));
        assert!(weights.iter().any(|&w| w != 0.0));
        let bias = conv.bias().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(bias, [0.0; 4]);
    }

    #[test]
    fn decoder_glimpses() {
        let varmap = VarMap::new();
        let decoder = WhatDecoder::new(4, test::var_builder(&varmap)).unwrap();
        let mut rng = fastrand::Rng::with_seed(5);
        let z_what = test::uniform(&mut rng, (2, 3, 4), -2.0, 2.0);
        let glimpses = decoder.forward(&z_what).unwrap();
        assert_eq!(glimpses.dims(), &[6, 3, GLIMPSE_SIZE, GLIMPSE_SIZE]);
        let values = glimpses.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn decoder_no_codes() {
        let varmap = VarMap::new();
        let decoder = WhatDecoder::new(4, test::var_builder(&varmap)).unwrap();
        let z_what = Tensor::zeros((0, 4), DType::F32, &candle_core::Device::Cpu).unwrap();
        let glimpses = decoder.forward(&z_what).unwrap();
        assert_eq!(glimpses.dims(), &[0, 3, GLIMPSE_SIZE, GLIMPSE_SIZE]);
    }
}
