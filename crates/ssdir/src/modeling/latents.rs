//! Latent variable bundles exchanged between encoder, decoder and the probabilistic model.

use std::fmt;

use candle_core::Tensor;

/// The latent variables describing a batch of scenes.
///
/// `z_what` and `z_depth` have one entry per slot (plus the background slot), `z_where` and
/// `z_present` have one entry per anchor.
#[derive(Debug, Clone)]
pub struct Latents {
    /// `[N, slots + 1, z_what_size]`
    pub z_what: Tensor,
    /// `[N, anchors, 4]`
    pub z_where: Tensor,
    /// `[N, anchors, 1]`, `1.0` for objects that are present.
    pub z_present: Tensor,
    /// `[N, slots + 1, 1]`
    pub z_depth: Tensor,
}

/// The distribution parameters computed by the [`super::Encoder`].
#[derive(Debug, Clone)]
pub struct EncodedLatents {
    pub z_what_loc: Tensor,
    pub z_what_scale: Tensor,
    /// Predicted boxes, used as the mean of the `z_where` distribution.
    pub z_where: Tensor,
    /// Presence probabilities.
    pub z_present: Tensor,
    pub z_depth_loc: Tensor,
    pub z_depth_scale: Tensor,
}

/// A latent variable tensor does not have the shape the model was built for.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentShapeError {
    pub latent: &'static str,
    pub expected: Vec<usize>,
    pub actual: Vec<usize>,
}

impl fmt::Display for LatentShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "latent `{}` has shape {:?}, expected {:?}",
            self.latent, self.actual, self.expected
        )
    }
}

impl std::error::Error for LatentShapeError {}

impl Latents {
    pub fn batch_size(&self) -> usize {
        self.z_what.dims().first().copied().unwrap_or(0)
    }

    /// Checks all four tensors against the given layout.
    ///
    /// The batch size is taken from `z_what`. Mismatches are reported as [`LatentShapeError`].
    pub fn validate(&self, slots: usize, anchors: usize, z_what_size: usize) -> anyhow::Result<()> {
        let n = self.batch_size();
        let checks: [(&'static str, &Tensor, [usize; 3]); 4] = [
            ("z_what", &self.z_what, [n, slots + 1, z_what_size]),
            ("z_where", &self.z_where, [n, anchors, 4]),
            ("z_present", &self.z_present, [n, anchors, 1]),
            ("z_depth", &self.z_depth, [n, slots + 1, 1]),
        ];
        for (latent, tensor, expected) in checks {
            if tensor.dims() != expected {
                return Err(LatentShapeError {
                    latent,
                    expected: expected.to_vec(),
                    actual: tensor.dims().to_vec(),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn latents(n: usize, slots: usize, anchors: usize, what: usize) -> Latents {
        let zeros = |shape: (usize, usize, usize)| {
            Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
        };
        Latents {
            z_what: zeros((n, slots + 1, what)),
            z_where: zeros((n, anchors, 4)),
            z_present: zeros((n, anchors, 1)),
            z_depth: zeros((n, slots + 1, 1)),
        }
    }

    #[test]
    fn valid() {
        latents(2, 5, 12, 8).validate(5, 12, 8).unwrap();
    }

    #[test]
    fn batch_mismatch() {
        let mut l = latents(2, 5, 12, 8);
        l.z_depth = latents(3, 5, 12, 8).z_depth;
        let err = l.validate(5, 12, 8).unwrap_err();
        let err = err.downcast_ref::<LatentShapeError>().unwrap();
        assert_eq!(err.latent, "z_depth");
        assert_eq!(err.expected, [2, 6, 1]);
        assert_eq!(err.actual, [3, 6, 1]);
    }

    #[test]
    fn anchor_mismatch() {
        let l = latents(1, 5, 11, 8);
        let err = l.validate(5, 12, 8).unwrap_err();
        assert_eq!(err.downcast_ref::<LatentShapeError>().unwrap().latent, "z_where");
    }
}
