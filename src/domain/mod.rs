//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - pipeline configuration (`PipelineConfig`, `LorentzWeight`, `PhaseModel`)
//! - the record state machine (`Stage`, `PipelineState`, `FailureKind`)
//! - fit-derived scalars (`ResonanceEstimates`, `CircleParams`)

pub mod types;

pub use types::*;
