//! Measurement data: the tabular collaborator, the measurement record and synthetic sweeps.

pub mod record;
pub mod synth;
pub mod table;

pub use record::{MIN_SAMPLES, MeasurementRecord, Sample};
pub use synth::{SyntheticTrace, grouped_table};
pub use table::{Column, Row, Table};
