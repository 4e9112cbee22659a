//! The distributions used by the model and the guide.

use std::f64::consts::PI;

use candle_core::{Result, Shape, Tensor};

/// Probabilities are kept this far away from 0 and 1 when computing log densities.
const PROB_EPS: f64 = f32::EPSILON as f64;

/// An element-wise independent distribution over a tensor.
///
/// The first dimension of every parameter tensor is the batch dimension, all remaining
/// dimensions are event dimensions.
#[derive(Debug, Clone)]
pub enum Distribution {
    Normal { loc: Tensor, scale: Tensor },
    Bernoulli { probs: Tensor },
}

impl Distribution {
    /// Creates a normal distribution. `loc` and `scale` must have the same shape.
    pub fn normal(loc: Tensor, scale: Tensor) -> anyhow::Result<Self> {
        if loc.shape() != scale.shape() {
            anyhow::bail!(
                "normal distribution with loc of shape {:?} and scale of shape {:?}",
                loc.dims(),
                scale.dims()
            );
        }
        Ok(Self::Normal { loc, scale })
    }

    /// Creates a normal distribution with the same `loc` and `scale` everywhere.
    pub fn normal_const(
        loc: f32,
        scale: f32,
        shape: impl Into<Shape>,
        like: &Tensor,
    ) -> Result<Self> {
        let shape = shape.into();
        Ok(Self::Normal {
            loc: Tensor::full(loc, shape.clone(), like.device())?.to_dtype(like.dtype())?,
            scale: Tensor::full(scale, shape, like.device())?.to_dtype(like.dtype())?,
        })
    }

    pub fn bernoulli(probs: Tensor) -> Self {
        Self::Bernoulli { probs }
    }

    pub fn shape(&self) -> &Shape {
        match self {
            Self::Normal { loc, .. } => loc.shape(),
            Self::Bernoulli { probs } => probs.shape(),
        }
    }

    /// Whether samples are differentiable functions of the parameters.
    pub fn has_rsample(&self) -> bool {
        match self {
            Self::Normal { .. } => true,
            Self::Bernoulli { .. } => false,
        }
    }

    /// Draws a sample.
    ///
    /// Normal samples are reparameterized (`loc + eps * scale`), so gradients flow into `loc`
    /// and `scale`. Bernoulli samples are `0.0` or `1.0` and carry no gradient.
    pub fn sample(&self) -> Result<Tensor> {
        match self {
            Self::Normal { loc, scale } => {
                let eps = loc.randn_like(0.0, 1.0)?.detach();
                loc + (eps * scale)?
            }
            Self::Bernoulli { probs } => {
                let probs = probs.detach();
                probs.rand_like(0.0, 1.0)?.lt(&probs)?.to_dtype(probs.dtype())
            }
        }
    }

    /// Computes the element-wise log density of `value`.
    pub fn log_prob(&self, value: &Tensor) -> Result<Tensor> {
        match self {
            Self::Normal { loc, scale } => {
                let z = ((value - loc)? / scale)?;
                let log_norm = scale.log()?.affine(1.0, 0.5 * (2.0 * PI).ln())?;
                (z.sqr()? * -0.5)? - log_norm
            }
            Self::Bernoulli { probs } => {
                let p = probs.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
                let log_p = p.log()?;
                let log_not_p = p.affine(-1.0, 1.0)?.log()?;
                let not_value = value.affine(-1.0, 1.0)?;
                (value * log_p)? + (not_value * log_not_p)?
            }
        }
    }

    /// Computes the log density of `value`, summed over the event dimensions.
    ///
    /// Returns a `[N]` tensor with one entry per batch element.
    pub fn log_prob_sum(&self, value: &Tensor) -> Result<Tensor> {
        let log_prob = self.log_prob(value)?;
        if log_prob.rank() < 2 {
            return Ok(log_prob);
        }
        log_prob.flatten_from(1)?.sum(1)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use candle_core::{DType, Device};

    use super::*;

    #[test]
    fn normal_log_prob() {
        let dist = Distribution::normal(
            Tensor::new(&[[0.0f32, 1.0]], &Device::Cpu).unwrap(),
            Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap(),
        )
        .unwrap();
        let value = Tensor::new(&[[0.0f32, 3.0]], &Device::Cpu).unwrap();
        let lp = dist.log_prob(&value).unwrap().to_vec2::<f32>().unwrap();
        let half_ln_2pi = 0.5 * (2.0 * std::f32::consts::PI).ln();
        assert_abs_diff_eq!(lp[0][0], -half_ln_2pi, epsilon = 1e-5);
        assert_abs_diff_eq!(lp[0][1], -0.5 - 2.0f32.ln() - half_ln_2pi, epsilon = 1e-5);

        let sum = dist.log_prob_sum(&value).unwrap().to_vec1::<f32>().unwrap();
        assert_abs_diff_eq!(sum[0], lp[0][0] + lp[0][1], epsilon = 1e-5);
    }

    #[test]
    fn bernoulli_log_prob() {
        let probs = Tensor::new(&[[0.25f32, 0.25, 0.0]], &Device::Cpu).unwrap();
        let dist = Distribution::bernoulli(probs);
        let value = Tensor::new(&[[1.0f32, 0.0, 0.0]], &Device::Cpu).unwrap();
        let lp = dist.log_prob(&value).unwrap().to_vec2::<f32>().unwrap();
        assert_abs_diff_eq!(lp[0][0], 0.25f32.ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(lp[0][1], 0.75f32.ln(), epsilon = 1e-5);
        assert_abs_diff_eq!(lp[0][2], 0.0, epsilon = 1e-5);

        // clamped, but still finite
        let one = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        let lp = dist.log_prob(&one).unwrap().to_vec2::<f32>().unwrap();
        assert!(lp[0][2].is_finite() && lp[0][2] < -10.0);
    }

    #[test]
    fn bernoulli_extreme_samples() {
        let probs = Tensor::new(&[[1.0f32, 0.0, 1.0, 0.0]], &Device::Cpu).unwrap();
        let sample = Distribution::bernoulli(probs.clone()).sample().unwrap();
        assert_eq!(sample.to_vec2::<f32>().unwrap(), probs.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn normal_samples() {
        let loc = Tensor::full(3.0f32, (2, 1000), &Device::Cpu).unwrap();
        let dist = Distribution::normal(loc.clone(), (loc.ones_like().unwrap() * 0.5).unwrap())
            .unwrap();
        assert!(dist.has_rsample());
        let sample = dist.sample().unwrap();
        assert_eq!(sample.dims(), &[2, 1000]);
        let mean = sample.mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert_abs_diff_eq!(mean, 3.0, epsilon = 0.1);

        let degenerate = Distribution::normal(loc.clone(), loc.zeros_like().unwrap()).unwrap();
        let sample = degenerate.sample().unwrap();
        assert_eq!(sample.to_vec2::<f32>().unwrap(), loc.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn shape_mismatch() {
        let loc = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let scale = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(Distribution::normal(loc, scale).is_err());
    }
}
