//! Shared pipeline logic used by the CLI subcommands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! config -> CSV ingest -> record -> fit or analysis -> summary
//!
//! The subcommand handlers can then focus on presentation (printing and exports).

use std::fs::File;
use std::path::Path;

use tracing::{info, warn};

use crate::analysis::{Analysis, analyse};
use crate::cli::{PipelineArgs, SynthArgs};
use crate::data::{MeasurementRecord, grouped_table};
use crate::domain::{FrequencyUnit, PipelineConfig};
use crate::error::{AppError, StageError};
use crate::fit::{MagnitudeFit, mag_fit};
use crate::io::{RunSummary, load_trace_csv, write_trace_csv};

/// All computed outputs of a single `resfit fit` run.
#[derive(Debug, Clone)]
pub struct FitRun {
    pub record: MeasurementRecord,
    pub fit: Option<MagnitudeFit>,
    /// Why the pipeline stopped, when it did.
    pub error: Option<StageError>,
    pub summary: RunSummary,
}

/// Resolve the pipeline configuration: defaults, then `path` (JSON), then `overrides`.
pub fn load_config(path: Option<&Path>, overrides: &PipelineArgs) -> Result<PipelineConfig, AppError> {
    let mut config = match path {
        Some(path) => {
            let file = File::open(path)
                .map_err(|e| AppError::new(2, format!("Failed to open config '{}': {e}", path.display())))?;
            serde_json::from_reader(file)
                .map_err(|e| AppError::new(2, format!("Invalid config '{}': {e}", path.display())))?
        }
        None => PipelineConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

/// Load a sweep CSV into a measurement record.
pub fn load_record(path: &Path, freq_unit: FrequencyUnit) -> Result<MeasurementRecord, AppError> {
    let ingested = load_trace_csv(path, freq_unit)?;
    for e in ingested.row_errors.iter().take(5) {
        warn!(line = e.line, "{}", e.message);
    }
    info!(
        path = %path.display(),
        rows = ingested.rows_used,
        skipped = ingested.row_errors.len(),
        "trace loaded"
    );
    MeasurementRecord::from_table(ingested.table)
}

/// Run the full calibration and fit on one CSV.
///
/// A stage failure is not an `Err` here: the record, its state and the summary are
/// returned so the caller can still report and export them.
pub fn run_fit_file(path: &Path, freq_unit: FrequencyUnit, config: &PipelineConfig) -> Result<FitRun, AppError> {
    config.validate()?;
    let record = load_record(path, freq_unit)?;
    Ok(run_fit(Some(path), record, config))
}

/// Run the full calibration and fit on an in-memory record.
pub fn run_fit(source: Option<&Path>, mut record: MeasurementRecord, config: &PipelineConfig) -> FitRun {
    let (fit, error) = match mag_fit(&mut record, config) {
        Ok(fit) => (Some(fit), None),
        Err(e) => (None, Some(e)),
    };
    let summary = RunSummary::new(
        source,
        config,
        &record,
        fit.as_ref(),
        error.as_ref().map(ToString::to_string),
    );
    FitRun {
        record,
        fit,
        error,
        summary,
    }
}

/// Split a CSV by `column` and run the correlation analysis.
pub fn run_analysis_file(
    path: &Path,
    freq_unit: FrequencyUnit,
    column: &str,
    config: &PipelineConfig,
) -> Result<Analysis, AppError> {
    let record = load_record(path, freq_unit)?;
    analyse(&record, column, config)
}

/// Generate the synthetic sweep(s) described by `args` and write them as CSV.
///
/// Returns the number of rows written.
pub fn run_synth(args: &SynthArgs) -> Result<usize, AppError> {
    let base = args.trace();
    let table = match &args.group_by {
        Some(column) => {
            let traces: Vec<_> = args
                .values
                .iter()
                .enumerate()
                .map(|(i, &value)| {
                    let mut trace = base.clone();
                    trace.fr += value * args.fr_shift;
                    trace.seed = base.seed.wrapping_add(i as u64);
                    (value, trace)
                })
                .collect();
            grouped_table(column, &traces)?
        }
        None => base.to_table()?,
    };

    let record = MeasurementRecord::from_table(table)?;
    write_trace_csv(&args.out, &record)?;
    info!(path = %args.out.display(), rows = record.len(), "synthetic trace written");
    Ok(record.len())
}
