//! Calibration and fit stages.
//!
//! Responsibilities:
//!
//! - remove the linear phase background
//! - crop the sweep to the resonance window
//! - fit the resonance circle and reject outliers once
//! - normalize onto the canonical off-resonant point
//! - fit the calibrated magnitude and validate its uncertainties

pub mod background;
pub mod circle;
pub mod isolate;
pub mod magnitude;
pub mod normalize;

pub use background::remove_background;
pub use circle::{CircleFit, MIN_CIRCLE_POINTS, circle_fit};
pub use isolate::{IsolatedWindow, isolate_spike};
pub use magnitude::{MagnitudeFit, ParamErrors, mag_fit};
pub use normalize::{Normalization, normalize};
