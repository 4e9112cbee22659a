//! Minimal probabilistic programming support.
//!
//! The generative model and the inference guide of SSDIR are plain functions that record their
//! random choices in a [`Trace`]. Running the guide first and replaying its choices in the model
//! yields everything needed to estimate the evidence lower bound ([`elbo_loss`]).

pub mod dist;
pub mod elbo;
pub mod trace;

pub use self::dist::Distribution;
pub use self::elbo::{elbo_loss, ElboLoss};
pub use self::trace::{Site, Trace};
