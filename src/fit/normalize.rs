//! Calibration into canonical coordinates.
//!
//! After background removal, isolation and the circle fit, the phase of the trace around
//! the circle center is fitted with a resonance phase model. Its off-resonant angle `θ0`
//! picks the reference point on the circle; the whole trace is then rescaled and rotated
//! so that point sits at `(1, 0)`.

use std::f64::consts::PI;

use nalgebra::DVector;
use tracing::debug;

use crate::data::MeasurementRecord;
use crate::domain::{CircleParams, LorentzWeight, PhaseModel, PipelineConfig, Stage};
use crate::error::StageError;
use crate::fit::{circle_fit, isolate};
use crate::math::{LeastSquaresProblem, LmOptions, argmin, mean, minimize, unwrap, wrap_pi, wrap_to};
use crate::models::{phase_period, phase_response};

/// What `normalize` did to the record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    /// Fitted circle before the transform, in the record's former coordinates.
    pub raw_circle: CircleParams,
    /// Circle after the transform; it passes through `(1, 0)`.
    pub circle: CircleParams,
    /// Off-resonant reference point before the transform.
    pub reference: (f64, f64),
    /// Magnitude divisor `|reference|`.
    pub rho: f64,
    /// Phase subtracted from every sample, `arg(reference)`.
    pub rotation: f64,
    pub theta0: f64,
    pub freq_res: f64,
    pub ql: f64,
    pub phase_nfev: usize,
}

struct PhaseFit {
    model: PhaseModel,
    f: Vec<f64>,
    theta: Vec<f64>,
    weight: Vec<f64>,
}

impl PhaseFit {
    /// Symmetric wrap of an angle difference into one model period.
    fn fold(&self, x: f64) -> f64 {
        let half = phase_period(self.model) / 2.0;
        wrap_to(x, -half, half)
    }

    /// Starting `θ0` and `fr`.
    ///
    /// The all-pass angle is unwrapped along the sweep and turns by `2π` through the
    /// window, so the mean of its two ends is `θ0 + π` and the resonance is where the
    /// trace crosses that level. The folded model has no such landmark and starts from
    /// the mean angle and `fr_guess`.
    fn seeds(&self, fr_guess: f64) -> (f64, f64) {
        match self.model {
            PhaseModel::AllPass => {
                let (Some(first), Some(last)) = (self.theta.first(), self.theta.last()) else {
                    return (0.0, fr_guess);
                };
                let level = (first + last) / 2.0;
                let distance: Vec<f64> = self.theta.iter().map(|t| (t - level).abs()).collect();
                let fr = argmin(&distance).map_or(fr_guess, |i| self.f[i]);
                (level - PI, fr)
            }
            PhaseModel::HalfAngle => (mean(&self.theta).unwrap_or(0.0), fr_guess),
        }
    }
}

impl LeastSquaresProblem for PhaseFit {
    fn residuals(&self, p: &[f64]) -> Option<DVector<f64>> {
        let (theta0, ql, fr) = (p[0], p[1], p[2]);
        if fr <= 0.0 {
            return None;
        }
        Some(DVector::from_iterator(
            self.f.len(),
            (0..self.f.len()).map(|i| {
                let model = phase_response(self.model, self.f[i], theta0, ql, fr);
                self.weight[i] * self.fold(self.theta[i] - model)
            }),
        ))
    }

    fn residual_delta(&self, index: usize, after: f64, before: f64) -> f64 {
        let w = self.weight[index];
        w * self.fold((after - before) / w)
    }
}

/// Normalize the record (see module docs), running earlier stages as needed.
///
/// `circle_guess` seeds the circle fit. Returns `Ok(None)` when the record is already
/// normalized. A record that failed with a recoverable error may be normalized again.
pub fn normalize(
    record: &mut MeasurementRecord,
    config: &PipelineConfig,
    circle_guess: Option<CircleParams>,
) -> Result<Option<Normalization>, StageError> {
    record.check_not_terminal()?;
    if record.is_normalized() {
        return Ok(None);
    }
    record.check_order(Stage::Normalized)?;
    record.clear_recoverable_failure();

    isolate::prepare(record, config)?;
    seed_guesses(record, config)?;

    let circle = circle_fit(record, circle_guess, config)?.params;

    let estimates = record.estimates();
    let (fr_guess, width) = match (estimates.guess_freq_res, estimates.guess_width) {
        (Some(fr), Some(w)) if fr.is_finite() && w.is_finite() && w > 0.0 => (fr, w),
        _ => {
            let err = StageError::NoResonanceInRange;
            record.fail(&err);
            return Err(err);
        }
    };

    let problem = phase_problem(record, circle, config.phase_model, config.phase_weight, fr_guess, width);
    let (theta0_guess, fr_seed) = problem.seeds(fr_guess);
    let ql_guess = fr_guess / width * config.ql_guess_multiplier;
    let p0 = [theta0_guess, ql_guess, fr_seed];

    let fit = match minimize(&problem, &p0, &LmOptions::with_max_nfev(config.phase_max_nfev)) {
        Ok(fit) => fit,
        Err(e) => {
            let err = StageError::PhaseFitDivergence(e);
            record.fail(&err);
            return Err(err);
        }
    };
    let (theta0, ql, freq_res) = (wrap_pi(fit.params[0]), fit.params[1].abs(), fit.params[2]);

    let reference = (
        circle.xc + circle.r * theta0.cos(),
        circle.yc + circle.r * theta0.sin(),
    );
    let rho = reference.0.hypot(reference.1);
    let rotation = reference.1.atan2(reference.0);

    record.update_polar(|_, mag, theta| {
        *mag /= rho;
        *theta = wrap_pi(*theta - rotation);
    });

    let (cos, sin) = (rotation.cos(), rotation.sin());
    let normalized = CircleParams {
        xc: (circle.xc * cos + circle.yc * sin) / rho,
        yc: (circle.yc * cos - circle.xc * sin) / rho,
        r: circle.r / rho,
    };
    let phi = (normalized.yc / normalized.r).clamp(-1.0, 1.0).asin();

    let estimates = record.estimates_mut();
    estimates.guess_freq_res = Some(freq_res);
    estimates.guess_ql = Some(ql);
    estimates.theta0 = Some(theta0);
    estimates.yc = Some(normalized.yc);
    estimates.r = Some(normalized.r);
    estimates.phi = Some(phi);
    record.mark_complete(Stage::Normalized);

    debug!(
        freq_res,
        ql,
        theta0,
        rho,
        rotation,
        r = normalized.r,
        phi,
        nfev = fit.nfev,
        "normalized"
    );

    Ok(Some(Normalization {
        raw_circle: circle,
        circle: normalized,
        reference,
        rho,
        rotation,
        theta0,
        freq_res,
        ql,
        phase_nfev: fit.nfev,
    }))
}

/// Fill in resonance and width guesses when isolation did not run.
fn seed_guesses(record: &mut MeasurementRecord, config: &PipelineConfig) -> Result<(), StageError> {
    let estimates = record.estimates();
    if estimates.guess_freq_res.is_some() && estimates.guess_width.is_some() {
        return Ok(());
    }
    match isolate::bracket(record, config.isolation_sigma) {
        Some(window) => {
            let estimates = record.estimates_mut();
            estimates.guess_freq_res.get_or_insert(window.freq_res_guess);
            estimates.guess_width.get_or_insert(window.width);
            Ok(())
        }
        None => {
            let err = StageError::NoResonanceInRange;
            record.fail(&err);
            Err(err)
        }
    }
}

fn phase_problem(
    record: &MeasurementRecord,
    circle: CircleParams,
    model: PhaseModel,
    weighting: LorentzWeight,
    fr_guess: f64,
    width: f64,
) -> PhaseFit {
    let mut f = Vec::with_capacity(record.len());
    let mut theta = Vec::with_capacity(record.len());
    let mut weight = Vec::with_capacity(record.len());
    for s in record.samples() {
        let t = (s.im - circle.yc).atan2(s.re - circle.xc);
        if t.is_finite() {
            f.push(s.f);
            theta.push(t);
            weight.push(weighting.weight(s.f, fr_guess, width));
        }
    }
    if model == PhaseModel::AllPass {
        theta = unwrap(&theta);
    }
    PhaseFit {
        model,
        f,
        theta,
        weight,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SyntheticTrace;
    use crate::domain::PipelineState;
    use crate::models::s21;

    fn trace() -> SyntheticTrace {
        SyntheticTrace {
            amplitude: 0.7,
            noise_sigma: 0.003,
            n_points: 3201,
            seed: 21,
            ..SyntheticTrace::default()
        }
    }

    #[test]
    fn reference_point_becomes_one_zero() {
        let truth = trace();
        let mut record = truth.to_record().unwrap();
        let mut uncropped = record.clone();
        crate::fit::remove_background(&mut uncropped).unwrap();
        let config = PipelineConfig::default();
        let norm = normalize(&mut record, &config, None).unwrap().unwrap();

        // A sample 20 MHz below resonance lands next to (1, 0) under the stored transform.
        // The phase tolerance covers the line fit's pull from the resonance.
        let far = uncropped.samples()[0];
        let mag = far.mag / norm.rho;
        let phase = wrap_pi(far.theta - norm.rotation);
        let ideal = s21(far.f, truth.fr, truth.ql, truth.qc, truth.phi);
        assert!((mag - ideal.norm()).abs() < 0.03, "far magnitude {mag}");
        assert!((phase - ideal.arg()).abs() < 0.08, "far phase {phase}");
        let on_circle = (1.0 - norm.circle.xc).hypot(norm.circle.yc);
        assert!((on_circle - norm.circle.r).abs() < 1e-9);

        // Calibrated samples match the ideal response.
        for s in record.samples() {
            let ideal = s21(s.f, truth.fr, truth.ql, truth.qc, truth.phi);
            let err = (s.re - ideal.re).hypot(s.im - ideal.im);
            assert!(err < 0.05, "f {}: calibrated error {err}", s.f);
        }

        let est = record.estimates();
        assert!((est.r.unwrap() - 0.25).abs() < 0.01, "r {:?}", est.r);
        assert!(est.phi.unwrap().abs() < 0.05, "phi {:?}", est.phi);
        assert!((est.guess_freq_res.unwrap() - truth.fr).abs() < 2e4);
        assert!((est.guess_ql.unwrap() / truth.ql - 1.0).abs() < 0.05, "ql {:?}", est.guess_ql);
        assert_eq!(record.state(), PipelineState::Normalized);
        assert!(record.is_sub_lined() && record.is_isolated() && record.is_rejected());
    }

    #[test]
    fn normalize_twice_is_a_no_op() {
        let mut record = trace().to_record().unwrap();
        let config = PipelineConfig::default();
        normalize(&mut record, &config, None).unwrap();
        let before = record.samples().to_vec();
        let estimates = record.estimates().clone();

        assert!(normalize(&mut record, &config, None).unwrap().is_none());
        assert_eq!(record.samples(), before.as_slice());
        assert_eq!(record.estimates(), &estimates);
    }

    #[test]
    fn mismatch_angle_is_recovered() {
        let truth = SyntheticTrace {
            phi: 0.4,
            ..trace()
        };
        let mut record = truth.to_record().unwrap();
        normalize(&mut record, &PipelineConfig::default(), None).unwrap();
        let phi = record.estimates().phi.unwrap();
        assert!((phi - truth.phi).abs() < 0.05, "phi {phi}");
    }

    #[test]
    fn missing_resonance_aborts_without_cropping() {
        let n = 300;
        let f: Vec<f64> = (0..n).map(|i| 8.4e9 + i as f64 * 1e4).collect();
        let mut record = MeasurementRecord::new(f, vec![1.0; n], vec![0.0; n]).unwrap();
        let err = normalize(&mut record, &PipelineConfig::default(), None).unwrap_err();
        assert!(matches!(err, StageError::NoResonanceInRange));
        assert!(!record.contains_resonance());
        assert_eq!(record.len(), n);
        assert!(!record.is_normalized());

        // Terminal: a second attempt is refused.
        assert!(matches!(
            normalize(&mut record, &PipelineConfig::default(), None),
            Err(StageError::AlreadyFailed(_))
        ));
    }

    #[test]
    fn isolation_can_be_skipped() {
        let mut record = trace().to_record().unwrap();
        let n = record.len();
        let config = PipelineConfig {
            isolate: false,
            ..PipelineConfig::default()
        };
        normalize(&mut record, &config, None).unwrap();
        assert!(!record.is_isolated());
        assert!(record.is_normalized());
        assert!(record.estimates().guess_width.is_some());
        // Only outlier rejection removed samples.
        assert!(record.len() > n / 2);
        assert!((record.estimates().r.unwrap() - 0.25).abs() < 0.01);
    }

    #[test]
    fn circle_fit_on_raw_then_normalize() {
        let mut record = trace().to_record().unwrap();
        let config = PipelineConfig::default();

        circle_fit(&mut record, None, &config).unwrap();
        assert!(record.is_sub_lined() && record.is_isolated());
        assert_eq!(record.state(), PipelineState::CircleFitted);

        assert!(normalize(&mut record, &config, None).unwrap().is_some());
        assert_eq!(record.state(), PipelineState::Normalized);
        assert!((record.estimates().r.unwrap() - 0.25).abs() < 0.01);
    }

    #[test]
    fn isolation_requested_after_an_uncropped_circle_fit_is_refused() {
        let mut record = trace().to_record().unwrap();
        let uncropped = PipelineConfig {
            isolate: false,
            ..PipelineConfig::default()
        };
        circle_fit(&mut record, None, &uncropped).unwrap();

        let err = normalize(&mut record, &PipelineConfig::default(), None).unwrap_err();
        assert!(
            matches!(
                err,
                StageError::OutOfOrder {
                    requested: Stage::Isolated,
                    completed: Stage::CircleFitted
                }
            ),
            "{err:?}"
        );
        assert!(!record.failed());

        // The same record still normalizes with the settings it was fitted under.
        assert!(normalize(&mut record, &uncropped, None).unwrap().is_some());
        assert!(!record.is_isolated());
    }
}
