//! CSV exports.
//!
//! - the trace of a record (one row per sample, in the ingest layout)
//! - the per-slice table of a correlation analysis

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::analysis::Analysis;
use crate::data::MeasurementRecord;
use crate::error::AppError;

/// Write the record's samples (in their current, possibly calibrated, coordinates).
///
/// The layout matches the ingest schema: auxiliary columns first, then `f`, `re`, `im`,
/// so an exported trace can be loaded again.
pub fn write_trace_csv(path: &Path, record: &MeasurementRecord) -> Result<(), AppError> {
    let mut out = create(path)?;
    let aux = record.aux();

    let mut header = String::new();
    for name in aux.column_names() {
        header.push_str(name);
        header.push(',');
    }
    header.push_str("f,re,im");
    writeln!(out, "{header}").map_err(write_error)?;

    for (i, s) in record.samples().iter().enumerate() {
        for column in aux.columns() {
            write!(out, "{},", column.values[i]).map_err(write_error)?;
        }
        writeln!(out, "{:.6},{:.10},{:.10}", s.f, s.re, s.im).map_err(write_error)?;
    }
    out.flush().map_err(write_error)
}

/// Write one row per slice: group value, outcome and fitted parameters when available.
pub fn write_slices_csv(path: &Path, analysis: &Analysis) -> Result<(), AppError> {
    let mut out = create(path)?;
    writeln!(
        out,
        "{},n_samples,state,fr,fr_err,ql,ql_err,qc,qc_err,phi,error",
        analysis.variable
    )
    .map_err(write_error)?;

    for slice in &analysis.slices {
        let state = format!("{:?}", slice.state);
        let values = match &slice.fit {
            Some(fit) => format!(
                "{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.6}",
                fit.freq_res, fit.stderr.freq_res, fit.ql, fit.stderr.ql, fit.qc, fit.stderr.qc, fit.phi
            ),
            None => ",,,,,,".to_string(),
        };
        let error = slice.error.as_deref().unwrap_or("").replace(['"', ','], " ");
        writeln!(out, "{},{},{},{},{}", slice.value, slice.n_samples, state, values, error)
            .map_err(write_error)?;
    }
    out.flush().map_err(write_error)
}

fn create(path: &Path) -> Result<BufWriter<File>, AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create export CSV '{}': {e}", path.display())))?;
    Ok(BufWriter::new(file))
}

fn write_error(e: std::io::Error) -> AppError {
    AppError::new(2, format!("Failed to write export CSV: {e}"))
}
