//! Mathematical utilities: linear and nonlinear least squares, statistics, angles.

pub mod lm;
pub mod ols;
pub mod phase;
pub mod stats;

pub use lm::*;
pub use ols::*;
pub use phase::*;
pub use stats::*;
