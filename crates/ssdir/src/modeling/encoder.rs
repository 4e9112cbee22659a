//! The inference network.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use super::{
    depth::DepthEncoder, latents::EncodedLatents, present::PresentEncoder, spatial::WhereEncoder,
    what::WhatEncoder,
};
use crate::detection::{ssd::SsdConfig, Backbone, Ssd};

/// Computes the parameters of all latent distributions from a batch of images.
///
/// Owns the SSD backbone and regression heads. All encoders see the same feature maps.
pub struct Encoder {
    ssd_config: SsdConfig,
    backbone: Box<dyn Backbone>,
    what_enc: WhatEncoder,
    where_enc: WhereEncoder,
    present_enc: PresentEncoder,
    depth_enc: DepthEncoder,
}

impl Encoder {
    pub fn new(
        ssd: Ssd,
        z_what_size: usize,
        square_boxes: bool,
        vb: VarBuilder<'_>,
    ) -> anyhow::Result<Self> {
        let (config, backbone, predictor, priors) = ssd.into_parts();
        let channels = &config.channels;
        let feature_maps = config.feature_maps();

        let what_enc = WhatEncoder::new(z_what_size, channels, &feature_maps, vb.pp("what"))?;
        let priors = priors.to_tensor(vb.device())?;
        let where_enc = WhereEncoder::new(predictor, priors, &config, square_boxes)?;
        let present_enc = PresentEncoder::new(&config.layers, channels, vb.pp("present"))?;
        let depth_enc = DepthEncoder::new(channels, &feature_maps, vb.pp("depth"))?;

        log::debug!(
            "encoder: {} levels, {} slots, {} anchors",
            config.layers.len(),
            config.slot_count(),
            config.anchor_count(),
        );

        Ok(Self {
            ssd_config: config,
            backbone,
            what_enc,
            where_enc,
            present_enc,
            depth_enc,
        })
    }

    pub fn ssd_config(&self) -> &SsdConfig {
        &self.ssd_config
    }

    pub fn z_what_size(&self) -> usize {
        self.what_enc.z_what_size()
    }

    /// Encodes `[N, 3, S, S]` images, where `S` is the SSD's input size.
    pub fn forward(&self, images: &Tensor) -> anyhow::Result<EncodedLatents> {
        let size = self.ssd_config.image_size;
        let (_, c, h, w) = images.dims4()?;
        if (c, h, w) != (3, size, size) {
            anyhow::bail!("expected [N, 3, {size}, {size}] images, got {:?}", images.dims());
        }

        let features = self.backbone.forward(images)?;
        self.check_features(&features, images.dim(0)?)?;
        let (z_what_loc, z_what_scale) = self.what_enc.forward(&features)?;
        let z_where = self.where_enc.forward(&features)?;
        let z_present = self.present_enc.forward(&features)?;
        let (z_depth_loc, z_depth_scale) = self.depth_enc.forward(&features)?;

        Ok(EncodedLatents {
            z_what_loc,
            z_what_scale,
            z_where,
            z_present,
            z_depth_loc,
            z_depth_scale,
        })
    }

    /// Checks that the backbone produced one `[N, C, G, G]` map per configured level.
    fn check_features(&self, features: &[Tensor], batch: usize) -> anyhow::Result<()> {
        let config = &self.ssd_config;
        if features.len() != config.layers.len() {
            anyhow::bail!(
                "backbone produced {} feature maps for {} SSD layers",
                features.len(),
                config.layers.len(),
            );
        }
        for (level, (feature, layer, &channels)) in
            itertools::izip!(features, &config.layers, &config.channels).enumerate()
        {
            let expected = [batch, channels, layer.grid(), layer.grid()];
            if feature.dims() != expected {
                anyhow::bail!(
                    "backbone produced a level {level} feature map of shape {:?}, expected {:?}",
                    feature.dims(),
                    expected,
                );
            }
        }
        Ok(())
    }
}
