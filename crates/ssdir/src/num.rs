//! Utilities for numerics.

use candle_core::{Result, Tensor};

/// Below this, `ln(1 + y)` is computed from its Taylor expansion.
const LOG1P_TAYLOR_THRESH: f64 = 1e-4;

/// Element-wise `ln(1 + exp(x))`.
///
/// Computed as `max(x, 0) + ln(1 + exp(-|x|))` so that large inputs do not overflow. For very
/// negative inputs, `ln(1 + y)` is replaced by `y - y²/2`, which is accurate where the naive
/// formula would round to zero. Once `exp(x)` underflows, the result is floored at the smallest
/// positive normal `f32`, so it is always strictly positive.
pub fn softplus(xs: &Tensor) -> Result<Tensor> {
    let y = xs.abs()?.neg()?.exp()?;
    let naive = y.affine(1.0, 1.0)?.log()?;
    let taylor = (&y - (y.sqr()? * 0.5)?)?;
    let log1p = y.lt(LOG1P_TAYLOR_THRESH)?.where_cond(&taylor, &naive)?;
    (xs.relu()? + log1p)?.clamp(f32::MIN_POSITIVE as f64, f64::INFINITY)
}

/// Softmax over `dim` that maps rows without any finite entry to all-zero weights.
///
/// Rows containing at least one finite value get the exact softmax; `-inf` entries receive a
/// weight of exactly 0. A row consisting only of `-inf` would be `0 / 0` in the textbook
/// formulation, here its weights are all 0 instead.
pub fn softmax_or_zero<Dim: candle_core::shape::Dim>(xs: &Tensor, dim: Dim) -> Result<Tensor> {
    let dim = dim.to_index(xs.shape(), "softmax_or_zero")?;
    // The shift does not change the result, so it does not need a gradient. Clamping maps an
    // all `-inf` row to a finite shift, so that `exp` yields zeros rather than NaN.
    let shift = xs
        .max_keepdim(dim)?
        .detach()
        .clamp(f32::MIN as f64, f32::MAX as f64)?;
    let exp = xs.broadcast_sub(&shift)?.exp()?;
    let sum = exp.sum_keepdim(dim)?.clamp(f32::MIN_POSITIVE as f64, f32::MAX as f64)?;
    exp.broadcast_div(&sum)
}

/// Bound of the Xavier/Glorot uniform initialization for a layer.
pub fn xavier_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}
