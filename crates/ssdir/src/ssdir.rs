use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::{
    detection::{ssd::SsdConfig, Ssd},
    modeling::{Compositing, Decoder, Encoder, Latents},
    prob::{elbo_loss, Distribution, ElboLoss, Trace},
};

/// Hyperparameters of an [`Ssdir`] model.
#[derive(Debug, Clone, PartialEq)]
pub struct SsdirConfig {
    /// Size of the appearance code of every object.
    pub z_what_size: usize,
    /// Standard deviation of the `z_where` distributions of prior and guide.
    pub z_where_scale_eps: f32,
    /// Prior probability of an object being present at any anchor.
    pub z_present_p_prior: f32,
    /// Prior mean of every `z_where` component.
    pub z_where_prior: f32,
    /// Forces predicted boxes to be square.
    pub square_boxes: bool,
    pub compositing: Compositing,
}

impl Default for SsdirConfig {
    fn default() -> Self {
        Self {
            z_what_size: 64,
            z_where_scale_eps: 1e-5,
            z_present_p_prior: 0.01,
            z_where_prior: 0.5,
            square_boxes: false,
            compositing: Compositing::DropEmpty,
        }
    }
}

impl SsdirConfig {
    pub fn with_z_what_size(self, z_what_size: usize) -> Self {
        Self {
            z_what_size,
            ..self
        }
    }

    pub fn with_z_where_scale_eps(self, z_where_scale_eps: f32) -> Self {
        Self {
            z_where_scale_eps,
            ..self
        }
    }

    pub fn with_z_present_p_prior(self, z_present_p_prior: f32) -> Self {
        Self {
            z_present_p_prior,
            ..self
        }
    }

    pub fn with_z_where_prior(self, z_where_prior: f32) -> Self {
        Self {
            z_where_prior,
            ..self
        }
    }

    pub fn with_square_boxes(self, square_boxes: bool) -> Self {
        Self {
            square_boxes,
            ..self
        }
    }

    pub fn with_compositing(self, compositing: Compositing) -> Self {
        Self {
            compositing,
            ..self
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.z_what_size == 0 {
            anyhow::bail!("`z_what_size` must be non-zero");
        }
        if self.z_where_scale_eps.is_nan() || self.z_where_scale_eps <= 0.0 {
            anyhow::bail!("`z_where_scale_eps` must be positive, got {}", self.z_where_scale_eps);
        }
        if !(0.0..=1.0).contains(&self.z_present_p_prior) {
            anyhow::bail!(
                "`z_present_p_prior` must be a probability, got {}",
                self.z_present_p_prior
            );
        }
        Ok(())
    }
}

/// Single-Shot Detect, Infer, Repeat.
///
/// Combines an [`Encoder`] and a [`Decoder`] into a variational autoencoder whose latent space
/// is structured by the anchors of an SSD. All parameters live in one [`VarMap`]; encoder
/// parameters are prefixed with `encoder.`, decoder parameters with `decoder.`.
pub struct Ssdir {
    config: SsdirConfig,
    varmap: VarMap,
    image_size: usize,
    slots: usize,
    anchors: usize,
    encoder: Encoder,
    decoder: Decoder,
}

impl Ssdir {
    /// Creates the model around an existing SSD.
    ///
    /// New parameters are allocated in `varmap` on `device`. The parameters of `ssd` only take
    /// part in [`Ssdir::filtered_parameters`] if they are stored in `varmap` as well, under the
    /// `encoder.` prefix.
    pub fn new(
        ssd: Ssd,
        config: SsdirConfig,
        varmap: &VarMap,
        device: &Device,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let ssd_config = ssd.config().clone();

        let encoder = Encoder::new(
            ssd,
            config.z_what_size,
            config.square_boxes,
            vb.pp("encoder"),
        )?;
        let decoder = Decoder::new(
            &ssd_config,
            config.z_what_size,
            config.compositing,
            vb.pp("decoder"),
        )?;

        log::debug!("SSDIR model with {config:?}");
        Ok(Self {
            image_size: ssd_config.image_size,
            slots: ssd_config.slot_count(),
            anchors: ssd_config.anchor_count(),
            config,
            varmap: varmap.clone(),
            encoder,
            decoder,
        })
    }

    /// Creates a model with a freshly initialized [`crate::detection::ConvBackbone`].
    pub fn with_conv_backbone(
        ssd_config: SsdConfig,
        config: SsdirConfig,
        device: &Device,
    ) -> anyhow::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let ssd = Ssd::with_conv_backbone(ssd_config, vb.pp("encoder").pp("ssd"))?;
        Self::new(ssd, config, &varmap, device)
    }

    pub fn config(&self) -> &SsdirConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Encodes images and samples latents from the resulting distributions.
    ///
    /// `z_where` is not sampled, the predicted boxes are used directly.
    pub fn encoder_forward(&self, images: &Tensor) -> anyhow::Result<Latents> {
        let encoded = self.encoder.forward(images)?;
        Ok(Latents {
            z_what: Distribution::normal(encoded.z_what_loc, encoded.z_what_scale)?.sample()?,
            z_where: encoded.z_where,
            z_present: Distribution::bernoulli(encoded.z_present).sample()?,
            z_depth: Distribution::normal(encoded.z_depth_loc, encoded.z_depth_scale)?.sample()?,
        })
    }

    /// Reconstructs images from latents.
    pub fn decoder_forward(&self, latents: &Latents) -> anyhow::Result<Tensor> {
        self.decoder.forward(latents)
    }

    /// Runs the generative model `p(x | z) p(z)` on a batch of images.
    ///
    /// Samples all latents from their priors (or replays them, see [`Trace::replaying`]),
    /// renders them, and records `images` as the observation `obs`.
    pub fn model(&self, images: &Tensor, trace: &mut Trace) -> anyhow::Result<()> {
        let n = self.check_images(images)?;
        trace.set_scale(pixel_scale(images)?);
        trace.register_module("decoder");

        let what_shape = (n, self.slots + 1, self.config.z_what_size);
        let z_what = trace.sample(
            "z_what",
            Distribution::normal_const(0.0, 1.0, what_shape, images)?,
        )?;
        let z_where = trace.sample(
            "z_where",
            Distribution::normal_const(
                self.config.z_where_prior,
                self.config.z_where_scale_eps,
                (n, self.anchors, 4),
                images,
            )?,
        )?;
        let present_p = Tensor::full(
            self.config.z_present_p_prior,
            (n, self.anchors, 1),
            images.device(),
        )?
        .to_dtype(images.dtype())?;
        let z_present = trace.sample("z_present", Distribution::bernoulli(present_p))?;
        let z_depth = trace.sample(
            "z_depth",
            Distribution::normal_const(0.0, 1.0, (n, self.slots + 1, 1), images)?,
        )?;

        let output = self.decoder.forward(&Latents {
            z_what,
            z_where,
            z_present,
            z_depth,
        })?;

        let pixels = images.elem_count() / n;
        trace.observe(
            "obs",
            Distribution::bernoulli(output.reshape((n, pixels))?),
            &images.reshape((n, pixels))?,
        )
    }

    /// Runs the inference guide `q(z | x)` on a batch of images.
    pub fn guide(&self, images: &Tensor, trace: &mut Trace) -> anyhow::Result<()> {
        self.check_images(images)?;
        trace.set_scale(pixel_scale(images)?);
        trace.register_module("encoder");

        let encoded = self.encoder.forward(images)?;
        let where_scale = (encoded.z_where.ones_like()? * self.config.z_where_scale_eps as f64)?;

        trace.sample(
            "z_what",
            Distribution::normal(encoded.z_what_loc, encoded.z_what_scale)?,
        )?;
        trace.sample("z_where", Distribution::normal(encoded.z_where, where_scale)?)?;
        trace.sample("z_present", Distribution::bernoulli(encoded.z_present))?;
        trace.sample(
            "z_depth",
            Distribution::normal(encoded.z_depth_loc, encoded.z_depth_scale)?,
        )?;
        Ok(())
    }

    /// Estimates the negative ELBO of a batch of images.
    ///
    /// Runs the guide, replays its samples in the model, and returns the loss to minimize.
    pub fn loss(&self, images: &Tensor) -> anyhow::Result<ElboLoss> {
        let mut guide = Trace::new();
        self.guide(images, &mut guide)?;
        let mut model = Trace::replaying(&guide);
        self.model(images, &mut model)?;
        elbo_loss(&model, &guide)
    }

    /// Returns the parameters whose names contain `include` (if given) and do not contain
    /// `exclude` (if given), sorted by name.
    pub fn filtered_parameters(&self, include: Option<&str>, exclude: Option<&str>) -> Vec<Var> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let mut params = data
            .iter()
            .filter(|(name, _)| include.map_or(true, |inc| name.contains(inc)))
            .filter(|(name, _)| exclude.map_or(true, |exc| !name.contains(exc)))
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect::<Vec<_>>();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params.into_iter().map(|(_, var)| var).collect()
    }

    /// Returns the parameters of all modules registered in `trace`.
    pub fn trace_parameters(&self, trace: &Trace) -> Vec<Var> {
        trace
            .modules()
            .iter()
            .flat_map(|module| self.filtered_parameters(Some(&format!("{module}.")), None))
            .collect()
    }

    fn check_images(&self, images: &Tensor) -> anyhow::Result<usize> {
        let (n, c, h, w) = images.dims4()?;
        let size = self.image_size;
        if (c, h, w) != (3, size, size) {
            anyhow::bail!("expected [N, 3, {size}, {size}] images, got {:?}", images.dims());
        }
        Ok(n)
    }
}

/// Log densities are divided by the number of values per image.
fn pixel_scale(images: &Tensor) -> anyhow::Result<f64> {
    let (_, c, h, w) = images.dims4()?;
    Ok(1.0 / (c * h * w) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{prob::Site, test};

    fn small_model(compositing: Compositing) -> Ssdir {
        let config = SsdirConfig::default()
            .with_z_what_size(4)
            .with_compositing(compositing);
        Ssdir::with_conv_backbone(test::small_ssd_config(), config, &Device::Cpu).unwrap()
    }

    #[test]
    fn config_builder() {
        let config = SsdirConfig::default()
            .with_z_what_size(8)
            .with_z_where_scale_eps(0.1)
            .with_z_present_p_prior(0.5)
            .with_z_where_prior(0.25)
            .with_square_boxes(true)
            .with_compositing(Compositing::mask_empty());
        assert_eq!(config.z_what_size, 8);
        assert_eq!(config.z_where_scale_eps, 0.1);
        assert_eq!(config.z_present_p_prior, 0.5);
        assert_eq!(config.z_where_prior, 0.25);
        assert!(config.square_boxes);
        assert_eq!(
            config.compositing,
            Compositing::MaskEmpty {
                empty_depth: -1000.0
            }
        );

        assert!(SsdirConfig::default().with_z_what_size(0).validate().is_err());
        assert!(SsdirConfig::default().with_z_present_p_prior(1.5).validate().is_err());
        assert!(SsdirConfig::default().with_z_where_scale_eps(0.0).validate().is_err());
    }

    #[test]
    fn parameter_filters() {
        let model = small_model(Compositing::DropEmpty);
        let all = model.filtered_parameters(None, None);
        let decoder = model.filtered_parameters(Some("decoder"), None);
        let encoder = model.filtered_parameters(Some("encoder"), None);
        let no_backbone = model.filtered_parameters(None, Some("backbone"));

        assert!(!decoder.is_empty());
        assert!(!encoder.is_empty());
        assert_eq!(decoder.len() + encoder.len(), all.len());
        assert!(no_backbone.len() < all.len());
        // decoder: 4 transposed convolutions with weight and bias
        assert_eq!(decoder.len(), 8);
    }

    #[test]
    fn encoder_forward_samples() {
        let model = small_model(Compositing::DropEmpty);
        let mut rng = fastrand::Rng::with_seed(10);
        let images = test::uniform(&mut rng, (2, 3, 16, 16), 0.0, 1.0);
        let latents = model.encoder_forward(&images).unwrap();
        latents.validate(20, 36, 4).unwrap();
        let present = latents.z_present.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(present.iter().all(|&p| p == 0.0 || p == 1.0));
    }

    #[test]
    fn model_records_sites() {
        let model = small_model(Compositing::DropEmpty);
        let mut rng = fastrand::Rng::with_seed(12);
        let images = test::coin_flips(&mut rng, (2, 3, 16, 16), 0.5);

        let mut trace = Trace::new();
        model.model(&images, &mut trace).unwrap();
        let names = trace.sites().iter().map(Site::name).collect::<Vec<_>>();
        assert_eq!(names, ["z_what", "z_where", "z_present", "z_depth", "obs"]);
        assert!(trace.site("obs").unwrap().is_observed());
        let scale = trace.site("z_what").unwrap().scale();
        assert!((scale - 1.0 / 768.0).abs() < 1e-12);
        assert_eq!(trace.modules(), ["decoder"]);
        assert_eq!(model.trace_parameters(&trace).len(), 8);
    }

    #[test]
    fn guide_records_sites() {
        let model = small_model(Compositing::DropEmpty);
        let mut rng = fastrand::Rng::with_seed(13);
        let images = test::uniform(&mut rng, (1, 3, 16, 16), 0.0, 1.0);

        let mut trace = Trace::new();
        model.guide(&images, &mut trace).unwrap();
        let names = trace.sites().iter().map(Site::name).collect::<Vec<_>>();
        assert_eq!(names, ["z_what", "z_where", "z_present", "z_depth"]);
        assert!(trace.sites().iter().all(|site| !site.is_observed()));
    }

    #[test]
    fn wrong_image_shape() {
        let model = small_model(Compositing::DropEmpty);
        let images = Tensor::zeros((1, 1, 16, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(model.loss(&images).is_err());
        assert!(model.guide(&images, &mut Trace::new()).is_err());
    }
}
