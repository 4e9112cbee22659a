//! The generative network: renders latents back into images.

use candle_core::{DType, Module, Tensor};
use candle_nn::VarBuilder;

use super::{
    compose::{
        depth_weights, mask_depths, merge_reconstructions, pad_reconstructions, Compositing,
    },
    latents::Latents,
    spatial::{whole_image_box, WhereTransformer},
    what::WhatDecoder,
};
use crate::{
    detection::ssd::{reconstruction_indices, SsdConfig},
    timer::Timer,
};

/// Reconstructs images from [`Latents`].
///
/// Every present object is rendered into a glimpse, placed on the canvas according to its box,
/// and the canvases of each image are blended with weights derived from the objects' depths. The
/// background slot is treated as an object covering the whole image that is always present.
pub struct Decoder {
    z_what_size: usize,
    slots: usize,
    anchors: usize,
    indices: Tensor,
    what_dec: WhatDecoder,
    where_stn: WhereTransformer,
    compositing: Compositing,
    t_render: Timer,
    t_pad: Timer,
    t_merge: Timer,
}

impl Decoder {
    pub fn new(
        config: &SsdConfig,
        z_what_size: usize,
        compositing: Compositing,
        vb: VarBuilder<'_>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let indices = reconstruction_indices(&config.layers);
        let slots = config.slot_count();
        let anchors = config.anchor_count();
        log::debug!("decoder: {slots} slots, {anchors} anchors, compositing {compositing:?}");

        Ok(Self {
            z_what_size,
            slots,
            anchors,
            indices: Tensor::new(indices, vb.device())?,
            what_dec: WhatDecoder::new(z_what_size, vb.pp("what"))?,
            where_stn: WhereTransformer::new(config.image_size, false),
            compositing,
            t_render: Timer::new("render"),
            t_pad: Timer::new("pad"),
            t_merge: Timer::new("merge"),
        })
    }

    pub fn compositing(&self) -> Compositing {
        self.compositing
    }

    /// Returns the slot index of every anchor, followed by the background slot.
    pub fn reconstruction_indices(&self) -> &Tensor {
        &self.indices
    }

    /// Returns the timers of the render, pad and merge stages.
    pub fn timers(&self) -> [&Timer; 3] {
        [&self.t_render, &self.t_pad, &self.t_merge]
    }

    /// Brings all latents to per-anchor resolution and appends the background object.
    ///
    /// The result has `anchors + 1` entries per image for every latent.
    pub fn pad_latents(&self, latents: &Latents) -> anyhow::Result<Latents> {
        let n = latents.batch_size();
        let device = latents.z_where.device();
        let dtype = latents.z_where.dtype();

        let background_where = whole_image_box(device)?
            .to_dtype(dtype)?
            .unsqueeze(0)?
            .broadcast_as((n, 1, 4))?
            .contiguous()?;
        let background_present = Tensor::ones((n, 1, 1), latents.z_present.dtype(), device)?;

        Ok(Latents {
            z_what: latents.z_what.index_select(&self.indices, 1)?,
            z_where: Tensor::cat(&[&latents.z_where, &background_where], 1)?,
            z_present: Tensor::cat(&[&latents.z_present, &background_present], 1)?,
            z_depth: latents.z_depth.index_select(&self.indices, 1)?,
        })
    }

    /// Renders `[n, z_what_size]` codes into `[n, 3, S, S]` canvases using `[n, 4]` boxes.
    fn render(&self, z_what: &Tensor, z_where: &Tensor) -> anyhow::Result<Tensor> {
        let glimpses = self.what_dec.forward(z_what)?;
        self.where_stn.forward(&glimpses, z_where)
    }

    /// Renders the objects of padded latents.
    ///
    /// Returns `[N, K, 3, S, S]` canvases and their `[N, K]` depths.
    pub fn reconstruct_objects(&self, padded: &Latents) -> anyhow::Result<(Tensor, Tensor)> {
        let (n, k, _) = padded.z_present.dims3()?;
        let z_what = padded.z_what.reshape((n * k, self.z_what_size))?;
        let z_where = padded.z_where.reshape((n * k, 4))?;
        let z_depth = padded.z_depth.reshape(n * k)?;

        match self.compositing {
            Compositing::DropEmpty => {
                let present = padded
                    .z_present
                    .flatten_all()?
                    .to_dtype(DType::F32)?
                    .to_vec1::<f32>()?;
                let mut selected = Vec::new();
                let mut n_present = vec![0; n];
                for (i, &p) in present.iter().enumerate() {
                    if p == 1.0 {
                        selected.push(i as u32);
                        n_present[i / k] += 1;
                    }
                }
                log::trace!("present objects per image: {n_present:?}");

                let selected = Tensor::new(selected, z_what.device())?;
                let images = self.t_render.time(|| {
                    self.render(
                        &z_what.index_select(&selected, 0)?,
                        &z_where.index_select(&selected, 0)?,
                    )
                })?;
                let depths = z_depth.index_select(&selected, 0)?;
                self.t_pad
                    .time(|| pad_reconstructions(&images, &depths, &n_present))
            }
            Compositing::MaskEmpty { empty_depth } => {
                let images = self.t_render.time(|| self.render(&z_what, &z_where))?;
                let (_, c, h, w) = images.dims4()?;
                let images = images.reshape((n, k, c, h, w))?;
                let depths = mask_depths(&padded.z_depth, &padded.z_present, empty_depth)?;
                Ok((images, depths))
            }
        }
    }

    /// Reconstructs a `[N, 3, S, S]` batch of images.
    ///
    /// Fails with [`super::LatentShapeError`] if the latents do not match the model's layout.
    pub fn forward(&self, latents: &Latents) -> anyhow::Result<Tensor> {
        latents.validate(self.slots, self.anchors, self.z_what_size)?;
        let padded = self.pad_latents(latents)?;
        let (images, depths) = self.reconstruct_objects(&padded)?;
        log::trace!("compositing {} objects per image", images.dim(1)?);

        self.t_merge.time(|| {
            let weights = depth_weights(&depths)?;
            merge_reconstructions(&images, &weights)
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use candle_nn::VarMap;

    use super::*;
    use crate::{
        modeling::{spatial::DegenerateBoxError, LatentShapeError},
        test,
    };

    const Z_WHAT: usize = 4;

    fn decoder(varmap: &VarMap, compositing: Compositing) -> Decoder {
        let vb = test::var_builder(varmap);
        Decoder::new(&test::small_ssd_config(), Z_WHAT, compositing, vb.pp("decoder")).unwrap()
    }

    fn random_latents(rng: &mut fastrand::Rng, n: usize, p_present: f32) -> Latents {
        let config = test::small_ssd_config();
        let (slots, anchors) = (config.slot_count(), config.anchor_count());
        let centers = test::uniform(rng, (n, anchors, 2), 0.0, 1.0);
        let sizes = test::uniform(rng, (n, anchors, 2), 0.1, 0.6);
        Latents {
            z_what: test::uniform(rng, (n, slots + 1, Z_WHAT), -1.0, 1.0),
            z_where: Tensor::cat(&[centers, sizes], 2).unwrap(),
            z_present: test::coin_flips(rng, (n, anchors, 1), p_present),
            z_depth: test::uniform(rng, (n, slots + 1, 1), -2.0, 2.0),
        }
    }

    fn assert_image(out: &Tensor, n: usize) {
        let size = test::small_ssd_config().image_size;
        assert_eq!(out.dims(), &[n, 3, size, size]);
        test::assert_finite(out);
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (0.0..=1.0 + 1e-5).contains(v)));
    }

    #[test]
    fn reconstruction_shape() {
        let varmap = VarMap::new();
        let decoder = decoder(&varmap, Compositing::DropEmpty);
        let mut rng = fastrand::Rng::with_seed(1);
        let out = decoder.forward(&random_latents(&mut rng, 3, 0.2)).unwrap();
        assert_image(&out, 3);
        assert!(decoder.timers().iter().all(|t| t.count() == 1));
    }

    #[test]
    fn pad_latents_appends_background() {
        let varmap = VarMap::new();
        let decoder = decoder(&varmap, Compositing::DropEmpty);
        let config = test::small_ssd_config();
        let anchors = config.anchor_count();
        let mut rng = fastrand::Rng::with_seed(2);
        let latents = random_latents(&mut rng, 2, 0.5);

        let padded = decoder.pad_latents(&latents).unwrap();
        for t in [&padded.z_what, &padded.z_where, &padded.z_present, &padded.z_depth] {
            assert_eq!(t.dims()[..2], [2, anchors + 1]);
        }
        for image in padded.z_where.to_vec3::<f32>().unwrap() {
            assert_eq!(image[anchors], [0.5, 0.5, 1.0, 1.0]);
        }
        for image in padded.z_present.to_vec3::<f32>().unwrap() {
            assert_eq!(image[anchors], [1.0]);
        }

        // every anchor carries the code of its slot
        let indices = reconstruction_indices(&config.layers);
        let what = latents.z_what.to_vec3::<f32>().unwrap();
        let padded_what = padded.z_what.to_vec3::<f32>().unwrap();
        for (image, padded_image) in what.iter().zip(&padded_what) {
            for (anchor, &slot) in indices.iter().enumerate() {
                assert_eq!(padded_image[anchor], image[slot as usize]);
            }
        }
    }

    #[test]
    fn nothing_present() {
        let varmap = VarMap::new();
        let decoder = decoder(&varmap, Compositing::DropEmpty);
        let mut rng = fastrand::Rng::with_seed(3);
        let mut latents = random_latents(&mut rng, 2, 0.0);
        // one image with objects, one without
        latents.z_present = Tensor::cat(
            &[
                test::coin_flips(&mut rng, (1, 36, 1), 0.5),
                test::coin_flips(&mut rng, (1, 36, 1), 0.0),
            ],
            0,
        )
        .unwrap();
        let out = decoder.forward(&latents).unwrap();
        assert_image(&out, 2);
    }

    #[test]
    fn policies_agree() {
        let varmap = VarMap::new();
        let drop_empty = decoder(&varmap, Compositing::DropEmpty);
        let mask_empty = decoder(&varmap, Compositing::mask_empty());
        let mut rng = fastrand::Rng::with_seed(4);
        let latents = random_latents(&mut rng, 2, 0.3);

        let a = drop_empty.forward(&latents).unwrap();
        let b = mask_empty.forward(&latents).unwrap();
        assert_image(&b, 2);
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in a.iter().zip(&b) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn shape_mismatch() {
        let varmap = VarMap::new();
        let decoder = decoder(&varmap, Compositing::DropEmpty);
        let mut rng = fastrand::Rng::with_seed(5);
        let mut latents = random_latents(&mut rng, 2, 0.3);
        latents.z_present = test::coin_flips(&mut rng, (3, 36, 1), 0.3);
        let err = decoder.forward(&latents).unwrap_err();
        let err = err.downcast_ref::<LatentShapeError>().unwrap();
        assert_eq!(err.latent, "z_present");
        assert_eq!(decoder.timers()[0].count(), 0);
    }

    #[test]
    fn degenerate_box_is_reported() {
        let varmap = VarMap::new();
        let decoder = decoder(&varmap, Compositing::DropEmpty);
        let mut rng = fastrand::Rng::with_seed(6);
        let mut latents = random_latents(&mut rng, 1, 0.0);
        latents.z_present = Tensor::ones((1, 36, 1), DType::F32, &Device::Cpu).unwrap();
        latents.z_where = Tensor::zeros((1, 36, 4), DType::F32, &Device::Cpu).unwrap();
        let err = decoder.forward(&latents).unwrap_err();
        assert!(err.downcast_ref::<DegenerateBoxError>().is_some());
    }
}
