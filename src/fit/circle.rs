//! Circle fit of the complex-plane trace.
//!
//! The trace is recentered on its mean so the origin lies inside the circle, which makes
//! the polar form `ρ(θ)` single valued. The circle is fitted to `(θ, ρ)` pairs, samples
//! further than `rejection_sigma` residual standard deviations from the fit are dropped
//! (once per record), and the circle is refitted on what remains.

use nalgebra::DVector;
use tracing::debug;

use crate::data::MeasurementRecord;
use crate::domain::{CircleParams, PipelineConfig, Stage};
use crate::error::StageError;
use crate::fit::isolate;
use crate::math::{LeastSquaresProblem, LmOptions, mean, minimize, std_dev};
use crate::models::circle_radius;

/// Fewest points the refit accepts (one more than the number of circle parameters).
pub const MIN_CIRCLE_POINTS: usize = 4;

/// Circle fit result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircleFit {
    /// Center and radius in the record's coordinates.
    pub params: CircleParams,
    /// Samples removed by outlier rejection during this call.
    pub rejected: usize,
    /// Population std of the radial residuals of the first fit.
    pub residual_std: f64,
}

struct PolarCircle {
    theta: Vec<f64>,
    rho: Vec<f64>,
}

impl PolarCircle {
    fn model(&self, p: &[f64]) -> impl Iterator<Item = f64> + '_ {
        let (a, b, r) = (p[0], p[1], p[2]);
        self.theta.iter().map(move |&t| circle_radius(t, a, b, r))
    }
}

impl LeastSquaresProblem for PolarCircle {
    fn residuals(&self, p: &[f64]) -> Option<DVector<f64>> {
        let r = DVector::from_iterator(
            self.rho.len(),
            self.rho.iter().zip(self.model(p)).map(|(&rho, m)| rho - m),
        );
        r.iter().all(|v| v.is_finite()).then_some(r)
    }
}

/// Fit a circle to the record's trace.
///
/// Background removal and (with `config.isolate`) spike isolation run first if they have
/// not yet. `guess` is in the record's coordinates; without one, the center starts at the
/// middle of the bounding box and the radius at half the imaginary range.
pub fn circle_fit(
    record: &mut MeasurementRecord,
    guess: Option<CircleParams>,
    config: &PipelineConfig,
) -> Result<CircleFit, StageError> {
    record.check_not_terminal()?;
    record.check_order(Stage::CircleFitted)?;
    record.clear_recoverable_failure();
    isolate::prepare(record, config)?;

    let finite: Vec<bool> = record
        .samples()
        .iter()
        .map(|s| s.re.is_finite() && s.im.is_finite())
        .collect();
    let (re, im): (Vec<f64>, Vec<f64>) = record
        .samples()
        .iter()
        .zip(finite.iter())
        .filter(|(_, k)| **k)
        .map(|(s, _)| (s.re, s.im))
        .unzip();

    let (xoff, yoff) = (mean(&re).unwrap_or(0.0), mean(&im).unwrap_or(0.0));
    let centered = |keep: &[bool], record: &MeasurementRecord| -> PolarCircle {
        let (theta, rho) = record
            .samples()
            .iter()
            .zip(keep.iter())
            .filter(|(_, k)| **k)
            .map(|(s, _)| {
                let (x, y) = (s.re - xoff, s.im - yoff);
                (y.atan2(x), x.hypot(y))
            })
            .unzip();
        PolarCircle { theta, rho }
    };

    let p0 = match guess {
        Some(g) => [g.xc - xoff, g.yc - yoff, g.r],
        None => {
            let (re_min, re_max) = extent(&re);
            let (im_min, im_max) = extent(&im);
            [
                (re_max + re_min) / 2.0 - xoff,
                (im_max + im_min) / 2.0 - yoff,
                (im_max - im_min) / 2.0,
            ]
        }
    };
    let opts = LmOptions::with_max_nfev(config.circle_max_nfev);

    let working = centered(&finite, record);
    let first = match minimize(&working, &p0, &opts) {
        Ok(fit) => fit,
        Err(e) => {
            let err = StageError::CircleFitDivergence(e);
            record.fail(&err);
            return Err(err);
        }
    };

    let diff: Vec<f64> = working
        .rho
        .iter()
        .zip(working.model(&first.params))
        .map(|(&rho, m)| rho - m)
        .collect();
    let residual_std = std_dev(&diff).unwrap_or(0.0);

    let mut keep = finite;
    let mut rejected = 0;
    if config.reject_outliers && !record.is_rejected() {
        let limit = config.rejection_sigma * residual_std;
        let mut within = diff.iter().map(|d| d.abs() <= limit);
        for k in keep.iter_mut().filter(|k| **k) {
            *k = within.next().unwrap_or(false);
        }

        let remaining = keep.iter().filter(|&&k| k).count();
        if remaining < MIN_CIRCLE_POINTS {
            let err = StageError::EmptyAfterRejection {
                remaining,
                required: MIN_CIRCLE_POINTS,
            };
            record.fail(&err);
            return Err(err);
        }
        rejected = record.len() - remaining;
        record.retain(&keep);
        record.mark_rejected();
        keep = vec![true; record.len()];
    }

    let working = centered(&keep, record);
    let refit = match minimize(&working, &first.params, &opts) {
        Ok(fit) => fit,
        Err(e) => {
            let err = StageError::CircleFitDivergence(e);
            record.fail(&err);
            return Err(err);
        }
    };

    let params = CircleParams {
        xc: refit.params[0] + xoff,
        yc: refit.params[1] + yoff,
        r: refit.params[2].abs(),
    };
    record.mark_complete(Stage::CircleFitted);

    debug!(
        xc = params.xc,
        yc = params.yc,
        r = params.r,
        rejected,
        residual_std,
        nfev = first.nfev + refit.nfev,
        "circle fitted"
    );

    Ok(CircleFit {
        params,
        rejected,
        residual_std,
    })
}

fn extent(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, PipelineState};
    use rand::prelude::*;
    use rand::rngs::StdRng;
    use rand_distr::Normal;

    fn noisy_circle(n: usize, c: CircleParams, sigma: f64, seed: u64) -> MeasurementRecord {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, sigma).unwrap();
        let mut re = Vec::with_capacity(n);
        let mut im = Vec::with_capacity(n);
        for i in 0..n {
            // Three quarters of a turn, as a cropped resonance window would give.
            let t = -2.4 + 4.8 * i as f64 / (n - 1) as f64;
            re.push(c.xc + c.r * t.cos() + noise.sample(&mut rng));
            im.push(c.yc + c.r * t.sin() + noise.sample(&mut rng));
        }
        let f = (0..n).map(|i| 8.4e9 + i as f64 * 1e4).collect();
        cropped(MeasurementRecord::new(f, re, im).unwrap())
    }

    /// Mark the stages before the circle fit as done so the samples are fitted as given.
    fn cropped(mut record: MeasurementRecord) -> MeasurementRecord {
        record.mark_complete(Stage::BackgroundRemoved);
        record.mark_complete(Stage::Isolated);
        record
    }

    #[test]
    fn recovers_circle_and_rejects_once() {
        let truth = CircleParams {
            xc: 0.6,
            yc: -0.3,
            r: 0.25,
        };
        let mut record = noisy_circle(400, truth, 0.003, 11);
        let config = PipelineConfig::default();

        let fit = circle_fit(&mut record, None, &config).unwrap();
        assert!((fit.params.xc - truth.xc).abs() < 2e-3, "{:?}", fit.params);
        assert!((fit.params.yc - truth.yc).abs() < 2e-3, "{:?}", fit.params);
        assert!((fit.params.r - truth.r).abs() < 2e-3, "{:?}", fit.params);
        assert!(fit.rejected > 0 && fit.rejected < 200, "rejected {}", fit.rejected);
        assert!(record.is_rejected());
        assert_eq!(record.state(), PipelineState::CircleFitted);

        let len = record.len();
        let again = circle_fit(&mut record, Some(fit.params), &config).unwrap();
        assert_eq!(again.rejected, 0);
        assert_eq!(record.len(), len);
        assert!((again.params.r - fit.params.r).abs() < 1e-3);
    }

    #[test]
    fn fitted_circle_reproduces_the_kept_samples() {
        let truth = CircleParams {
            xc: 0.75,
            yc: 0.05,
            r: 0.25,
        };
        let mut record = noisy_circle(300, truth, 0.005, 3);
        let fit = circle_fit(&mut record, None, &PipelineConfig::default()).unwrap();

        // Every kept sample lies within the rejection band of the refitted circle.
        let xoff = record.samples().iter().map(|s| s.re).sum::<f64>() / record.len() as f64;
        let yoff = record.samples().iter().map(|s| s.im).sum::<f64>() / record.len() as f64;
        let (a, b) = (fit.params.xc - xoff, fit.params.yc - yoff);
        for s in record.samples() {
            let (x, y) = (s.re - xoff, s.im - yoff);
            let model = circle_radius(y.atan2(x), a, b, fit.params.r);
            assert!(
                (x.hypot(y) - model).abs() <= 1.5 * fit.residual_std,
                "residual {}",
                x.hypot(y) - model
            );
        }
    }

    #[test]
    fn rejection_can_be_disabled() {
        let truth = CircleParams {
            xc: 0.0,
            yc: 0.0,
            r: 1.0,
        };
        let mut record = noisy_circle(100, truth, 0.01, 5);
        let config = PipelineConfig {
            reject_outliers: false,
            ..PipelineConfig::default()
        };
        let fit = circle_fit(&mut record, None, &config).unwrap();
        assert_eq!(fit.rejected, 0);
        assert_eq!(record.len(), 100);
        assert!(!record.is_rejected());
    }

    #[test]
    fn too_few_points_is_a_divergence() {
        let mut record = cropped(MeasurementRecord::new(vec![1.0, 2.0], vec![1.0, -1.0], vec![0.0, 0.0]).unwrap());
        let err = circle_fit(&mut record, None, &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, StageError::CircleFitDivergence(_)), "{err:?}");
        assert_eq!(record.state(), PipelineState::Failed(FailureKind::CircleFitDivergence));
    }

    #[test]
    fn rejecting_everything_is_an_error_and_leaves_the_record_alone() {
        let truth = CircleParams {
            xc: 0.75,
            yc: 0.0,
            r: 0.25,
        };
        let mut record = noisy_circle(100, truth, 0.01, 9);
        let config = PipelineConfig {
            rejection_sigma: 1e-9,
            ..PipelineConfig::default()
        };
        let err = circle_fit(&mut record, None, &config).unwrap_err();
        assert!(matches!(err, StageError::EmptyAfterRejection { .. }), "{err:?}");
        assert_eq!(record.len(), 100);
        assert!(!record.is_rejected());
        assert_eq!(record.failure(), Some(FailureKind::CircleFitDivergence));

        // The failure is recoverable: a retry without rejection succeeds.
        let retry = PipelineConfig {
            reject_outliers: false,
            ..PipelineConfig::default()
        };
        assert!(circle_fit(&mut record, None, &retry).is_ok());
        assert!(!record.failed());
    }

    #[test]
    fn rejection_removes_outliers_inside_and_outside_the_circle() {
        let truth = CircleParams {
            xc: 0.75,
            yc: 0.0,
            r: 0.25,
        };
        let clean = noisy_circle(200, truth, 0.002, 13);
        let (inner, outer) = (clean.samples()[60].f, clean.samples()[140].f);
        let (mut f, mut re, mut im) = (Vec::new(), Vec::new(), Vec::new());
        for (i, s) in clean.samples().iter().enumerate() {
            let scale = match i {
                60 => 0.8,
                140 => 1.2,
                _ => 1.0,
            };
            f.push(s.f);
            re.push(truth.xc + scale * (s.re - truth.xc));
            im.push(truth.yc + scale * (s.im - truth.yc));
        }
        let mut record = cropped(MeasurementRecord::new(f, re, im).unwrap());

        circle_fit(&mut record, None, &PipelineConfig::default()).unwrap();
        let kept = record.frequencies();
        assert!(!kept.contains(&inner), "inward outlier kept");
        assert!(!kept.contains(&outer), "outward outlier kept");
    }
}
