//! CSV ingest.
//!
//! Turns a sweep CSV into a unit-aware [`Table`] holding `f` (Hz), `re`, `im` and any
//! auxiliary columns.
//!
//! Design goals:
//! - **Strict schema**: a header row and at least three columns, clear errors with exit code 2
//! - **Row-level validation**: bad rows are skipped and reported, not fatal
//! - **Separation of concerns**: no fitting logic here

use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::StringRecord;
use tracing::{debug, warn};

use crate::data::Table;
use crate::domain::FrequencyUnit;
use crate::error::AppError;

/// Names given to the trailing three columns.
pub const TRACE_COLUMNS: [&str; 3] = ["f", "re", "im"];

/// A row-level error encountered during ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

/// Ingest output: the table plus what happened on the way.
#[derive(Debug, Clone)]
pub struct IngestedTrace {
    pub table: Table,
    /// Unit the frequency column was given in (the table itself holds Hz).
    pub freq_unit: FrequencyUnit,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
    pub rows_used: usize,
}

/// Load a sweep CSV from disk.
pub fn load_trace_csv(path: &Path, freq_unit: FrequencyUnit) -> Result<IngestedTrace, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(2, format!("Failed to open CSV '{}': {e}", path.display())))?;
    let ingested = read_trace_csv(file, freq_unit)?;
    debug!(
        path = %path.display(),
        rows_read = ingested.rows_read,
        rows_used = ingested.rows_used,
        "trace loaded"
    );
    Ok(ingested)
}

/// Parse a sweep CSV from any reader.
///
/// The last three columns are frequency, real and imaginary part, in that order, and
/// are renamed to `f`, `re`, `im`. Every other column is kept as an auxiliary column. Empty
/// auxiliary cells read as NaN.
pub fn read_trace_csv<R: Read>(reader: R, freq_unit: FrequencyUnit) -> Result<IngestedTrace, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader
        .headers()
        .map_err(|e| AppError::new(2, format!("Failed to read CSV headers: {e}")))?
        .clone();
    let names = header_names(&headers)?;
    let width = names.len();
    let n_aux = width - TRACE_COLUMNS.len();

    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); width];
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;

    for (idx, result) in reader.records().enumerate() {
        // +2: records() starts after the header, lines are 1-based.
        let line = idx + 2;
        rows_read += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };

        match parse_row(&record, width, n_aux) {
            Ok(values) => {
                for (column, v) in columns.iter_mut().zip(values) {
                    column.push(v);
                }
            }
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }

    if !row_errors.is_empty() {
        warn!(skipped = row_errors.len(), rows_read, "skipped malformed CSV rows");
    }
    let rows_used = columns[0].len();
    if rows_used == 0 {
        return Err(AppError::new(3, "No valid rows in the CSV."));
    }

    let mut table = Table::from_columns(names.iter().cloned().zip(columns))?;
    let mut renamed: Vec<&str> = names[..n_aux].iter().map(String::as_str).collect();
    renamed.extend(TRACE_COLUMNS);
    table.rename_columns(&renamed)?;
    table.give_units([("f", freq_unit.label())]);
    frequencies_to_hz(&mut table)?;

    Ok(IngestedTrace {
        table,
        freq_unit,
        row_errors,
        rows_read,
        rows_used,
    })
}

/// Rescale the `f` column according to its unit and relabel it as Hz.
pub fn frequencies_to_hz(table: &mut Table) -> Result<(), AppError> {
    let label = table.unit("f").unwrap_or("Hz");
    let unit = FrequencyUnit::from_label(label)
        .ok_or_else(|| AppError::new(2, format!("Unknown frequency unit '{label}'.")))?;
    if unit != FrequencyUnit::Hz {
        table.scale_column("f", unit.to_hz())?;
    }
    table.give_units([("f", FrequencyUnit::Hz.label())]);
    Ok(())
}

fn header_names(headers: &StringRecord) -> Result<Vec<String>, AppError> {
    // Spreadsheet exports may prefix the first header with a UTF-8 BOM.
    let names: Vec<String> = headers
        .iter()
        .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
        .collect();

    if names.len() < TRACE_COLUMNS.len() {
        return Err(AppError::new(
            2,
            format!(
                "Expected at least 3 columns (frequency, real, imaginary), found {}.",
                names.len()
            ),
        ));
    }
    if let Some(i) = names.iter().position(|n| n.is_empty()) {
        return Err(AppError::new(2, format!("Column {} has an empty header.", i + 1)));
    }
    Ok(names)
}

fn parse_row(record: &StringRecord, width: usize, n_aux: usize) -> Result<Vec<f64>, String> {
    if record.len() != width {
        return Err(format!("Expected {width} fields, found {}.", record.len()));
    }
    record
        .iter()
        .enumerate()
        .map(|(i, field)| {
            if field.is_empty() && i < n_aux {
                return Ok(f64::NAN);
            }
            let value: f64 = field
                .parse()
                .map_err(|_| format!("Invalid number '{field}' in column {}.", i + 1))?;
            if i >= n_aux && !value.is_finite() {
                return Err(format!("Non-finite value in column {}.", i + 1));
            }
            Ok(value)
        })
        .collect()
}
