//! `resonator-fit` library crate.
//!
//! Calibration and fit of swept S21 transmission measurements of microwave resonators:
//! background removal, spike isolation, circle fit, normalization onto the canonical
//! off-resonant point and a magnitude fit for `fr`, `Ql` and `Qc`, plus a correlation
//! analysis across grouped measurements.
//!
//! The binary (`resfit`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the pipeline stages are reusable on in-memory records

pub mod analysis;
pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
