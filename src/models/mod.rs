//! Resonator response models.
//!
//! Models are implemented as small, pure functions so the fit stages only deal with
//! residual bookkeeping.

pub mod model;

pub use model::*;
