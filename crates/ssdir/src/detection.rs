//! The SSD detector SSDIR builds upon.
//!
//! SSDIR consumes three things from a Single-Shot MultiBox Detector: the per-level feature maps
//! produced by its backbone, its per-level box regression heads, and its prior boxes. This module
//! defines those collaborators. [`ConvBackbone`] is a small stand-in for a pre-trained backbone
//! that is good enough for tests and toy data; real use is expected to plug in a pre-trained
//! network through the [`Backbone`] trait.

pub mod boxes;
pub mod ssd;

use candle_core::Tensor;
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder};

use self::ssd::{PriorBoxes, SsdConfig};

/// Trait implemented by networks that compute the feature pyramid of an SSD.
pub trait Backbone {
    /// Computes one feature map per SSD layer.
    ///
    /// `images` is `[N, 3, image_size, image_size]`. The returned maps must be
    /// `[N, channels, grid, grid]`, with `channels` as reported by [`Backbone::out_channels`] and
    /// `grid` as configured in the [`SsdConfig`] layers.
    fn forward(&self, images: &Tensor) -> anyhow::Result<Vec<Tensor>>;

    /// Returns the number of channels of each returned feature map.
    fn out_channels(&self) -> &[usize];
}

/// A plain convolutional feature pyramid.
///
/// Each level is a single ReLU-activated convolution applied to the previous level (the first
/// level is applied to the input image). Kernel size and stride are chosen so that every level
/// ends up with exactly the configured grid size.
pub struct ConvBackbone {
    levels: Vec<Conv2d>,
    channels: Vec<usize>,
}

impl ConvBackbone {
    pub fn new(config: &SsdConfig, vb: VarBuilder<'_>) -> anyhow::Result<Self> {
        config.validate()?;

        let mut levels = Vec::with_capacity(config.layers.len());
        let mut size = config.image_size;
        let mut in_channels = 3;
        for (i, (layer, &channels)) in config.layers.iter().zip(&config.channels).enumerate() {
            let grid = layer.grid();
            if grid > size {
                anyhow::bail!(
                    "feature map {i} has grid size {grid}, but its input is only {size} wide"
                );
            }

            // out = (size - kernel) / stride + 1 == grid
            let stride = size / grid;
            let kernel = size - stride * (grid - 1);
            let cfg = Conv2dConfig {
                stride,
                ..Default::default()
            };
            levels.push(candle_nn::conv2d(
                in_channels,
                channels,
                kernel,
                cfg,
                vb.pp(format!("level{i}")),
            )?);

            size = grid;
            in_channels = channels;
        }

        Ok(Self {
            levels,
            channels: config.channels.clone(),
        })
    }
}

impl Backbone for ConvBackbone {
    fn forward(&self, images: &Tensor) -> anyhow::Result<Vec<Tensor>> {
        let mut features = Vec::with_capacity(self.levels.len());
        let mut xs = images.clone();
        for level in &self.levels {
            xs = level.forward(&xs)?.relu()?;
            features.push(xs.clone());
        }
        Ok(features)
    }

    fn out_channels(&self) -> &[usize] {
        &self.channels
    }
}

/// The box regression heads of an SSD.
///
/// Each head is a 3x3 convolution mapping a feature map to `boxes_per_cell * 4` regression
/// outputs per cell.
#[derive(Clone)]
pub struct BoxPredictor {
    reg_headers: Vec<Conv2d>,
}

impl BoxPredictor {
    pub fn new(config: &SsdConfig, vb: VarBuilder<'_>) -> anyhow::Result<Self> {
        config.validate()?;

        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let reg_headers = config
            .layers
            .iter()
            .zip(&config.channels)
            .enumerate()
            .map(|(i, (layer, &channels))| {
                candle_nn::conv2d(
                    channels,
                    layer.boxes_per_cell() * 4,
                    3,
                    cfg,
                    vb.pp(format!("reg_header{i}")),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self { reg_headers })
    }

    /// Returns the per-level regression heads, finest level first.
    pub fn reg_headers(&self) -> &[Conv2d] {
        &self.reg_headers
    }
}

/// An SSD detector: configuration, backbone, regression heads and prior boxes.
pub struct Ssd {
    config: SsdConfig,
    backbone: Box<dyn Backbone>,
    predictor: BoxPredictor,
    priors: PriorBoxes,
}

impl Ssd {
    /// Assembles a detector from its parts.
    ///
    /// Fails if the backbone's channel counts do not match the configuration.
    pub fn new<B: Backbone + 'static>(
        config: SsdConfig,
        backbone: B,
        predictor: BoxPredictor,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        if backbone.out_channels() != config.channels {
            anyhow::bail!(
                "backbone produces {:?} channels, but the SSD is configured for {:?}",
                backbone.out_channels(),
                config.channels,
            );
        }
        if predictor.reg_headers().len() != config.layers.len() {
            anyhow::bail!(
                "box predictor has {} heads, but the SSD has {} layers",
                predictor.reg_headers().len(),
                config.layers.len(),
            );
        }

        let priors = PriorBoxes::calculate(&config);
        Ok(Self {
            config,
            backbone: Box::new(backbone),
            predictor,
            priors,
        })
    }

    /// Creates a detector with a freshly initialized [`ConvBackbone`] and [`BoxPredictor`].
    pub fn with_conv_backbone(config: SsdConfig, vb: VarBuilder<'_>) -> anyhow::Result<Self> {
        let backbone = ConvBackbone::new(&config, vb.pp("backbone"))?;
        let predictor = BoxPredictor::new(&config, vb.pp("predictor"))?;
        Self::new(config, backbone, predictor)
    }

    pub fn config(&self) -> &SsdConfig {
        &self.config
    }

    pub fn backbone(&self) -> &dyn Backbone {
        &*self.backbone
    }

    pub fn predictor(&self) -> &BoxPredictor {
        &self.predictor
    }

    pub fn priors(&self) -> &PriorBoxes {
        &self.priors
    }

    /// Splits the detector into the parts used by the encoder.
    pub(crate) fn into_parts(self) -> (SsdConfig, Box<dyn Backbone>, BoxPredictor, PriorBoxes) {
        (self.config, self.backbone, self.predictor, self.priors)
    }
}
