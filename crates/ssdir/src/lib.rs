//! SSDIR: Single-Shot Detect, Infer, Repeat.
//!
//! SSDIR decomposes a scene into a variable number of objects, each described by four latent
//! variables attached to the anchors of a Single-Shot MultiBox Detector (SSD):
//!
//! * `z_what`: appearance code, decoded into a 64x64 RGB glimpse,
//! * `z_where`: bounding box `(center_x, center_y, width, height)` in normalized image
//!   coordinates,
//! * `z_present`: whether the object exists at all,
//! * `z_depth`: ordering value used to composite overlapping glimpses.
//!
//! The [`modeling::Encoder`] infers the latents from SSD backbone features, the
//! [`modeling::Decoder`] renders, places and composites them back into an image, and [`Ssdir`]
//! ties both together into a generative model and its inference guide.
//!
//! # Tensor Layout
//!
//! Images are `[N, C, H, W]`. Appearance and depth latents exist once per feature map cell (a
//! *slot*), plus one trailing background slot. Box and presence latents exist once per SSD anchor.
//! [`detection::ssd::reconstruction_indices`] maps between the two resolutions.
//!
//! # Environment Variables
//!
//! * `SSDIR_DEVICE`: selects the device tensors are allocated on. Allowed values are `cpu` (the
//!   default) and `cuda` (requires `candle` to be built with CUDA support).

use log::LevelFilter;

pub mod detection;
pub mod device;
pub mod iter;
pub mod modeling;
pub mod num;
pub mod prob;
pub mod timer;

mod ssdir;

pub use ssdir::{Ssdir, SsdirConfig};


/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("candle_core"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and SSDIR will log at *trace* level.
/// Otherwise, they will log at *debug* level.
///
/// `candle_core` will always log at *warn* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
