//! Synthetic S21 sweeps.
//!
//! Traces follow the notch-type resonator response of [`crate::models::s21`], multiplied
//! by a complex amplitude with a linear phase background `phase_slope·f + phase_offset`,
//! plus independent Gaussian noise on the real and imaginary parts. Generation is
//! seeded and deterministic.

use num_complex::Complex64;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::data::record::MeasurementRecord;
use crate::data::table::Table;
use crate::error::AppError;
use crate::models::s21;

/// Parameters of a synthetic sweep. Frequencies in Hz, angles in radians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticTrace {
    pub fr: f64,
    pub ql: f64,
    pub qc: f64,
    pub phi: f64,
    pub amplitude: f64,
    /// Standard deviation of the noise added to `re` and `im`.
    pub noise_sigma: f64,
    /// Background phase slope in rad/Hz.
    pub phase_slope: f64,
    pub phase_offset: f64,
    pub f_start: f64,
    pub f_stop: f64,
    pub n_points: usize,
    pub seed: u64,
}

impl Default for SyntheticTrace {
    /// An 8.43 GHz resonance with `Ql = 1e4`, `Qc = 2e4`, σ = 0.01 noise and a
    /// 1 mrad/MHz phase background, swept over ±20 MHz.
    fn default() -> Self {
        let fr = 8.43e9;
        Self {
            fr,
            ql: 1e4,
            qc: 2e4,
            phi: 0.0,
            amplitude: 1.0,
            noise_sigma: 0.01,
            phase_slope: 1e-9,
            phase_offset: 0.2,
            f_start: fr - 20e6,
            f_stop: fr + 20e6,
            n_points: 40_001,
            seed: 7,
        }
    }
}

impl SyntheticTrace {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.n_points < 2 {
            return Err(AppError::new(2, "Synthetic trace needs at least 2 points."));
        }
        if !(self.f_start.is_finite() && self.f_stop.is_finite() && self.f_stop > self.f_start) {
            return Err(AppError::new(2, "Invalid synthetic frequency range."));
        }
        let positive = [
            ("fr", self.fr),
            ("ql", self.ql),
            ("qc", self.qc),
            ("amplitude", self.amplitude),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(AppError::new(2, format!("Synthetic {name} must be finite and > 0.")));
            }
        }
        if !(self.noise_sigma.is_finite() && self.noise_sigma >= 0.0) {
            return Err(AppError::new(2, "Synthetic noise sigma must be finite and >= 0."));
        }
        Ok(())
    }

    /// Frequencies, real and imaginary parts of the sweep.
    pub fn generate(&self) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>), AppError> {
        self.validate()?;

        let mut rng = StdRng::seed_from_u64(self.seed);
        let noise = Normal::new(0.0, self.noise_sigma)
            .map_err(|e| AppError::new(2, format!("Noise distribution error: {e}")))?;

        let step = (self.f_stop - self.f_start) / (self.n_points - 1) as f64;
        let mut f = Vec::with_capacity(self.n_points);
        let mut re = Vec::with_capacity(self.n_points);
        let mut im = Vec::with_capacity(self.n_points);

        for i in 0..self.n_points {
            let fi = self.f_start + i as f64 * step;
            let background = Complex64::from_polar(self.amplitude, self.phase_slope * fi + self.phase_offset);
            let z = s21(fi, self.fr, self.ql, self.qc, self.phi) * background;
            let (dr, di) = if self.noise_sigma > 0.0 {
                (noise.sample(&mut rng), noise.sample(&mut rng))
            } else {
                (0.0, 0.0)
            };
            f.push(fi);
            re.push(z.re + dr);
            im.push(z.im + di);
        }

        Ok((f, re, im))
    }

    /// Sweep as a `f`/`re`/`im` table.
    pub fn to_table(&self) -> Result<Table, AppError> {
        let (f, re, im) = self.generate()?;
        let mut table = Table::from_columns([("f", f), ("re", re), ("im", im)])?;
        table.give_units([("f", "Hz")]);
        Ok(table)
    }

    pub fn to_record(&self) -> Result<MeasurementRecord, AppError> {
        MeasurementRecord::from_table(self.to_table()?)
    }
}

/// Concatenate several sweeps into one table with a leading grouping column.
pub fn grouped_table(column: &str, traces: &[(f64, SyntheticTrace)]) -> Result<Table, AppError> {
    let mut key = Vec::new();
    let mut f = Vec::new();
    let mut re = Vec::new();
    let mut im = Vec::new();
    for (value, trace) in traces {
        let (tf, tre, tim) = trace.generate()?;
        key.extend(std::iter::repeat_n(*value, tf.len()));
        f.extend(tf);
        re.extend(tre);
        im.extend(tim);
    }
    let mut table = Table::from_columns([(column, key), ("f", f), ("re", re), ("im", im)])?;
    table.give_units([("f", "Hz")]);
    Ok(table)
}
