//! Evidence lower bound estimation.

use candle_core::Tensor;

use super::Trace;

/// A single-sample ELBO estimate.
pub struct ElboLoss {
    /// Differentiable surrogate loss to call `backward` on.
    ///
    /// Its value equals `-elbo`, and its gradient is an unbiased estimate of the gradient of the
    /// negative ELBO, including the score function term of sites that cannot be reparameterized.
    pub loss: Tensor,
    /// The ELBO estimate itself, averaged over the batch.
    pub elbo: f32,
}

/// Estimates the ELBO from a guide trace and a model trace replaying it.
///
/// For every batch element, `log p(x, z) - log q(z)` is computed from the traces. Guide sites
/// whose samples are not differentiable contribute `log q(z) * detach(log p - log q)` to the
/// surrogate objective, so the gradients of their parameters follow the score function
/// estimator.
pub fn elbo_loss(model: &Trace, guide: &Trace) -> anyhow::Result<ElboLoss> {
    let log_p = model.log_prob()?;
    let log_q = guide.log_prob_of(|site| !site.is_observed())?;
    let elbo = (&log_p - &log_q)?;

    let mut surrogate = elbo.clone();
    if guide.sites().iter().any(|site| !site.dist().has_rsample()) {
        let score = guide.log_prob_of(|site| !site.is_observed() && !site.dist().has_rsample())?;
        let score_term = (score * elbo.detach())?;
        // contributes gradients only
        surrogate = ((surrogate + &score_term)? - score_term.detach())?;
    }

    let loss = surrogate.sum_all()?.neg()?;
    let batch = elbo.elem_count().max(1) as f32;
    let elbo = elbo.sum_all()?.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()? / batch;
    log::trace!("elbo: {elbo}");
    Ok(ElboLoss { loss, elbo })
}
