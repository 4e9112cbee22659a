//! The SSDIR networks.
//!
//! Every latent variable has its own encoder working on the SSD feature maps. The
//! [`Decoder`] renders `z_what` into glimpses, places them according to `z_where` and
//! composites them according to `z_present` and `z_depth`.

pub mod background;
pub mod compose;
pub mod decoder;
pub mod depth;
pub mod encoder;
pub mod latents;
pub mod present;
pub mod spatial;
pub mod what;

use candle_core::{Result, Tensor};

pub use self::compose::Compositing;
pub use self::decoder::Decoder;
pub use self::encoder::Encoder;
pub use self::latents::{EncodedLatents, LatentShapeError, Latents};

/// Flattens a `[N, C, H, W]` convolution output into `[N, H * W * C / per_entry, per_entry]`.
///
/// Entries of the same cell end up next to each other, and cells are ordered row by row. This
/// matches the anchor order of [`crate::detection::ssd::PriorBoxes`].
pub(crate) fn flatten_cells(xs: &Tensor, per_entry: usize) -> Result<Tensor> {
    let (n, c, h, w) = xs.dims4()?;
    assert_eq!(c % per_entry, 0, "{c} channels cannot be split into {per_entry}-sized entries");
    xs.permute((0, 2, 3, 1))?
        .contiguous()?
        .reshape((n, h * w * c / per_entry, per_entry))
}
