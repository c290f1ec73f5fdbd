//! JSON run summary of a single-trace fit.

use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::MeasurementRecord;
use crate::domain::{GroupKey, PipelineConfig, PipelineState, ResonanceEstimates};
use crate::error::AppError;
use crate::fit::MagnitudeFit;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tool: String,
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub source: Option<String>,
    pub config: PipelineConfig,
    pub state: PipelineState,
    pub n_samples: usize,
    pub group: Option<GroupKey>,
    pub estimates: ResonanceEstimates,
    pub fit: Option<MagnitudeFit>,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(
        source: Option<&Path>,
        config: &PipelineConfig,
        record: &MeasurementRecord,
        fit: Option<&MagnitudeFit>,
        error: Option<String>,
    ) -> Self {
        Self {
            tool: "resfit".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: Utc::now(),
            source: source.map(|p| p.display().to_string()),
            config: config.clone(),
            state: record.state(),
            n_samples: record.len(),
            group: record.group().cloned(),
            estimates: record.estimates().clone(),
            fit: fit.cloned(),
            error,
        }
    }
}

pub fn write_summary_json(path: &Path, summary: &RunSummary) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create summary JSON '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(file, summary)
        .map_err(|e| AppError::new(2, format!("Failed to write summary JSON: {e}")))
}

pub fn read_summary_json(path: &Path) -> Result<RunSummary, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(2, format!("Failed to open summary JSON '{}': {e}", path.display())))?;
    serde_json::from_reader(file).map_err(|e| AppError::new(2, format!("Invalid summary JSON: {e}")))
}
