//! Correlation analysis across groups of a combined dataset.
//!
//! A record carrying an auxiliary variable (power, temperature, bias...) is split by
//! that variable, every slice is fitted independently (in parallel), and each fitted
//! parameter is correlated against the variable over the slices that did not fail.

use rayon::prelude::*;
use tracing::info;

use crate::data::{MeasurementRecord, Table};
use crate::domain::{PipelineConfig, PipelineState};
use crate::error::AppError;
use crate::fit::{MagnitudeFit, mag_fit};
use crate::math::{Correlation, pearson};

/// Parameters correlated against the grouping variable, in table order.
pub const PARAMETERS: [&str; 4] = ["fr", "Ql", "Qc", "phi"];

/// What happened to one slice.
#[derive(Debug, Clone)]
pub struct SliceOutcome {
    pub value: f64,
    pub n_samples: usize,
    pub state: PipelineState,
    pub fit: Option<MagnitudeFit>,
    /// Why the slice was excluded, when it was.
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParameterCorrelation {
    pub parameter: &'static str,
    /// `None` when the parameter is constant over the fitted slices.
    pub correlation: Option<Correlation>,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub variable: String,
    pub slices: Vec<SliceOutcome>,
    /// One row per fitted slice: the variable followed by [`PARAMETERS`].
    pub table: Table,
    pub correlations: Vec<ParameterCorrelation>,
}

impl Analysis {
    pub fn fitted(&self) -> usize {
        self.table.len()
    }

    pub fn correlation(&self, parameter: &str) -> Option<&Correlation> {
        self.correlations
            .iter()
            .find(|c| c.parameter == parameter)
            .and_then(|c| c.correlation.as_ref())
    }
}

/// Split `record` by `column`, fit every slice and correlate the results.
///
/// Failed slices are reported and left out. Fewer than two fitted slices is an error
/// (exit code 3) since no correlation can be formed.
pub fn analyse(record: &MeasurementRecord, column: &str, config: &PipelineConfig) -> Result<Analysis, AppError> {
    config.validate()?;
    let children = record.split_by(column)?;
    if children.is_empty() {
        return Err(AppError::new(3, format!("No usable groups in column '{column}'.")));
    }

    let slices: Vec<SliceOutcome> = children
        .into_par_iter()
        .map(|mut child| {
            let value = child.group().map_or(f64::NAN, |g| g.value);
            let n_samples = child.len();
            let result = mag_fit(&mut child, config);
            let (fit, error) = match result {
                Ok(fit) => (Some(fit), None),
                Err(e) => (None, Some(e.to_string())),
            };
            SliceOutcome {
                value,
                n_samples,
                state: child.state(),
                fit,
                error,
            }
        })
        .collect();

    let fitted: Vec<(f64, &MagnitudeFit)> = slices
        .iter()
        .filter_map(|s| s.fit.as_ref().map(|fit| (s.value, fit)))
        .collect();
    info!(
        column,
        slices = slices.len(),
        fitted = fitted.len(),
        "slices analysed"
    );
    if fitted.len() < 2 {
        return Err(AppError::new(
            3,
            format!(
                "Only {} of {} slices could be fitted; at least 2 are needed for a correlation.",
                fitted.len(),
                slices.len()
            ),
        ));
    }

    let x: Vec<f64> = fitted.iter().map(|(v, _)| *v).collect();
    let columns: Vec<Vec<f64>> = vec![
        fitted.iter().map(|(_, f)| f.freq_res).collect(),
        fitted.iter().map(|(_, f)| f.ql).collect(),
        fitted.iter().map(|(_, f)| f.qc).collect(),
        fitted.iter().map(|(_, f)| f.phi).collect(),
    ];

    let correlations = PARAMETERS
        .iter()
        .zip(columns.iter())
        .map(|(&parameter, y)| ParameterCorrelation {
            parameter,
            correlation: pearson(&x, y),
        })
        .collect();

    let mut table = Table::new();
    table.push_column(column, x)?;
    for (name, values) in PARAMETERS.iter().zip(columns) {
        table.push_column(*name, values)?;
    }
    table.give_units([("fr", "Hz")]);

    Ok(Analysis {
        variable: column.to_string(),
        slices,
        table,
        correlations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SyntheticTrace, grouped_table};
    use crate::domain::FailureKind;

    fn slice(value: f64) -> SyntheticTrace {
        SyntheticTrace {
            fr: 8.43e9 + value * 1e6,
            f_start: 8.41e9,
            f_stop: 8.45e9,
            n_points: 8001,
            seed: 100 + value as u64,
            ..SyntheticTrace::default()
        }
    }

    #[test]
    fn resonance_tracks_the_grouping_variable() {
        let traces: Vec<(f64, SyntheticTrace)> = (0..5).map(|v| (v as f64, slice(v as f64))).collect();
        let record = MeasurementRecord::from_table(grouped_table("bias", &traces).unwrap()).unwrap();

        let analysis = analyse(&record, "bias", &PipelineConfig::default()).unwrap();
        assert_eq!(analysis.slices.len(), 5);
        assert_eq!(analysis.fitted(), 5);
        assert_eq!(analysis.table.column_names(), vec!["bias", "fr", "Ql", "Qc", "phi"]);
        assert_eq!(analysis.table.get("bias").unwrap(), &[0.0, 1.0, 2.0, 3.0, 4.0]);

        let fr = analysis.correlation("fr").unwrap();
        assert!(fr.r.abs() > 0.9, "r {}", fr.r);
        assert!(fr.p_value < 0.01, "p {}", fr.p_value);
        assert_eq!(fr.n, 5);

        for (i, &f) in analysis.table.get("fr").unwrap().iter().enumerate() {
            let expected = 8.43e9 + i as f64 * 1e6;
            assert!((f / expected - 1.0).abs() < 1e-4, "slice {i}: fr {f}");
        }
    }

    #[test]
    fn failed_slices_are_excluded() {
        let mut traces: Vec<(f64, SyntheticTrace)> = (0..3).map(|v| (v as f64, slice(v as f64))).collect();
        // Resonance below the sweep: isolation cannot bracket it.
        traces.push((
            9.0,
            SyntheticTrace {
                fr: 8.385e9,
                noise_sigma: 0.0,
                ..slice(9.0)
            },
        ));
        let record = MeasurementRecord::from_table(grouped_table("bias", &traces).unwrap()).unwrap();

        let analysis = analyse(&record, "bias", &PipelineConfig::default()).unwrap();
        assert_eq!(analysis.slices.len(), 4);
        assert_eq!(analysis.fitted(), 3);
        let failed = &analysis.slices[3];
        assert_eq!(failed.value, 9.0);
        assert_eq!(failed.state, PipelineState::Failed(FailureKind::NoResonanceInRange));
        assert!(failed.fit.is_none() && failed.error.is_some());
        assert_eq!(analysis.correlation("fr").unwrap().n, 3);
    }

    #[test]
    fn one_slice_is_not_enough() {
        let record = MeasurementRecord::from_table(grouped_table("bias", &[(1.0, slice(1.0))]).unwrap()).unwrap();
        let err = analyse(&record, "bias", &PipelineConfig::default()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn unknown_column_is_an_input_error() {
        let record = MeasurementRecord::from_table(grouped_table("bias", &[(1.0, slice(1.0))]).unwrap()).unwrap();
        let err = analyse(&record, "temperature", &PipelineConfig::default()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
