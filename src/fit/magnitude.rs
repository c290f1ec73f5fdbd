//! Final magnitude fit.
//!
//! The calibrated magnitude is fitted with `|S21(f)| + offset` (see [`crate::models::s21`]).
//! The fit's own `Qc` and `φ` absorb whatever the normalization left over; the reported
//! coupling quality factor comes from the normalized circle instead.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::MeasurementRecord;
use crate::domain::{LorentzWeight, PipelineConfig, Stage};
use crate::error::StageError;
use crate::fit::normalize;
use crate::math::{LeastSquaresProblem, LmFit, LmOptions, minimize};
use crate::models::{coupling_q, s21_magnitude};

const PARAM_NAMES: [&str; 5] = ["fr", "Ql", "Qc", "phi", "offset"];

/// Relative errors are taken against `max(|value|, floor)`. Angles and the offset sit
/// near zero for a well calibrated trace and are judged on an absolute scale.
const RELATIVE_FLOOR: [f64; 5] = [0.0, 0.0, 0.0, 1.0, 1.0];

/// Standard errors of the magnitude-fit parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamErrors {
    pub freq_res: f64,
    pub ql: f64,
    pub qc_model: f64,
    pub phi_model: f64,
    pub offset: f64,
    /// Propagated from `ql`; the normalized radius is taken as exact.
    pub qc: f64,
}

/// Outcome of [`mag_fit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnitudeFit {
    pub freq_res: f64,
    pub ql: f64,
    /// Coupling quality factor `Ql / (2·r·cos φ)` from the normalized circle.
    pub qc: f64,
    /// Mismatch angle from the normalized circle.
    pub phi: f64,
    pub offset: f64,
    /// Raw `Qc` parameter of the magnitude model.
    pub qc_model: f64,
    /// Raw `φ` parameter of the magnitude model.
    pub phi_model: f64,
    pub stderr: ParamErrors,
    pub reduced_chi_square: f64,
    pub nfev: usize,
}

struct MagnitudeProblem {
    f: Vec<f64>,
    mag: Vec<f64>,
    weight: Vec<f64>,
}

impl LeastSquaresProblem for MagnitudeProblem {
    fn residuals(&self, p: &[f64]) -> Option<DVector<f64>> {
        let (fr, ql, qc, phi, offset) = (p[0], p[1], p[2], p[3], p[4]);
        if fr <= 0.0 {
            return None;
        }
        Some(DVector::from_iterator(
            self.f.len(),
            (0..self.f.len()).map(|i| {
                self.weight[i] * (self.mag[i] - s21_magnitude(self.f[i], fr, ql, qc, phi, offset))
            }),
        ))
    }
}

/// Fit the magnitude of the record, normalizing it first when needed.
///
/// Stores `freq_res`, `ql`, `qc` and `offset` in the record's estimates on success.
pub fn mag_fit(record: &mut MeasurementRecord, config: &PipelineConfig) -> Result<MagnitudeFit, StageError> {
    record.check_not_terminal()?;
    if !record.is_normalized() {
        normalize(record, config, None)?;
    }
    record.clear_recoverable_failure();

    let estimates = record.estimates();
    let (Some(fr_guess), Some(ql_guess), Some(width), Some(r), Some(phi)) = (
        estimates.guess_freq_res,
        estimates.guess_ql,
        estimates.guess_width,
        estimates.r,
        estimates.phi,
    ) else {
        return Err(unreliable(record, "normalization left no resonance estimates"));
    };

    let problem = magnitude_problem(record, config.magnitude_weight, fr_guess, width);
    let p0 = [fr_guess, ql_guess, ql_guess * config.qc_guess_multiplier, 0.0, 0.0];
    let fit = match minimize(&problem, &p0, &LmOptions::with_max_nfev(config.magnitude_max_nfev)) {
        Ok(fit) => fit,
        Err(e) => return Err(unreliable(record, &format!("solver failed: {e}"))),
    };
    let stderr = match check_errors(&fit, config.max_relative_stderr) {
        Ok(stderr) => stderr,
        Err(reason) => return Err(unreliable(record, &reason)),
    };

    let (freq_res, ql, qc_model, phi_model, offset) =
        (fit.params[0], fit.params[1], fit.params[2], fit.params[3], fit.params[4]);
    let qc = coupling_q(ql, r, phi);

    let estimates = record.estimates_mut();
    estimates.freq_res = Some(freq_res);
    estimates.ql = Some(ql);
    estimates.qc = Some(qc);
    estimates.offset = Some(offset);
    record.mark_complete(Stage::MagnitudeFitted);

    debug!(freq_res, ql, qc, qc_model, phi_model, offset, nfev = fit.nfev, "magnitude fitted");

    Ok(MagnitudeFit {
        freq_res,
        ql,
        qc,
        phi,
        offset,
        qc_model,
        phi_model,
        stderr: ParamErrors {
            freq_res: stderr[0],
            ql: stderr[1],
            qc_model: stderr[2],
            phi_model: stderr[3],
            offset: stderr[4],
            qc: (qc * stderr[1] / ql).abs(),
        },
        reduced_chi_square: fit.reduced_chi_square,
        nfev: fit.nfev,
    })
}

fn magnitude_problem(
    record: &MeasurementRecord,
    weighting: LorentzWeight,
    fr_guess: f64,
    width: f64,
) -> MagnitudeProblem {
    let (f, mag): (Vec<f64>, Vec<f64>) = record
        .samples()
        .iter()
        .filter(|s| s.mag.is_finite())
        .map(|s| (s.f, s.mag))
        .unzip();
    let weight = f.iter().map(|&f| weighting.weight(f, fr_guess, width)).collect();
    MagnitudeProblem { f, mag, weight }
}

fn check_errors(fit: &LmFit, max_relative: f64) -> Result<Vec<f64>, String> {
    let stderr = match &fit.stderr {
        Some(stderr) if fit.has_errorbars() => stderr.clone(),
        _ => return Err("fit produced no usable error bars".to_string()),
    };
    for (i, (&value, &err)) in fit.params.iter().zip(stderr.iter()).enumerate() {
        let relative = err / value.abs().max(RELATIVE_FLOOR[i]);
        if relative.is_nan() || relative > max_relative {
            return Err(format!(
                "relative error of {} is {relative:.3} (limit {max_relative})",
                PARAM_NAMES[i]
            ));
        }
    }
    Ok(stderr)
}

fn unreliable(record: &mut MeasurementRecord, reason: &str) -> StageError {
    let err = StageError::MagnitudeFitUnreliable {
        reason: reason.to_string(),
    };
    record.fail(&err);
    err
}
