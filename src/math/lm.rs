//! Levenberg–Marquardt nonlinear least squares.
//!
//! Minimizes `Σ r_i(p)²` for a residual vector supplied by a [`LeastSquaresProblem`].
//!
//! Implementation notes:
//! - The Jacobian is built by forward differences with the MINPACK step
//!   `h = sqrt(eps) * |p_j|` (or `sqrt(eps)` when `p_j == 0`); a backward step is tried when
//!   the forward point is not finite.
//! - Columns are scaled to unit norm before each step. Parameters here span many orders of
//!   magnitude (a resonance frequency in Hz next to an angle in radians), and the scaled
//!   damping `λ·I` is Marquardt's `λ·diag(JᵀJ)` in the original variables.
//! - Standard errors follow the usual convention for weighted fits: the covariance
//!   `(JᵀJ)⁻¹` is scaled by the reduced chi-square.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e16;

/// Solver failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LmError {
    #[error("residuals are not finite at the initial guess")]
    NonFiniteResidual,
    #[error("normal equations are singular")]
    SingularStep,
    #[error("no convergence after {nfev} residual evaluations")]
    MaxEvaluations { nfev: usize },
    #[error("{n} residuals cannot determine {p} parameters")]
    Underdetermined { n: usize, p: usize },
}

/// A residual vector to minimize.
pub trait LeastSquaresProblem {
    /// Residuals at `params`, or `None` when the model is not finite there.
    fn residuals(&self, params: &[f64]) -> Option<DVector<f64>>;

    /// Difference `after - before` of residual component `index`.
    ///
    /// Residuals that live on a circle (wrapped angles) override this so a finite-difference
    /// step never sees a `2π` jump.
    fn residual_delta(&self, _index: usize, after: f64, before: f64) -> f64 {
        after - before
    }
}

/// Termination settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmOptions {
    /// Cap on residual evaluations (Jacobian columns included).
    pub max_nfev: usize,
    /// Relative reduction of the sum of squares below which we stop.
    pub ftol: f64,
    /// Relative step size below which we stop.
    pub xtol: f64,
    /// Cosine between residual and any Jacobian column below which we stop.
    pub gtol: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_nfev: 2000,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-12,
        }
    }
}

impl LmOptions {
    pub fn with_max_nfev(max_nfev: usize) -> Self {
        Self {
            max_nfev,
            ..Self::default()
        }
    }
}

/// Converged solution with uncertainty estimates.
#[derive(Debug, Clone)]
pub struct LmFit {
    pub params: Vec<f64>,
    /// Standard errors, `None` when the covariance could not be estimated.
    pub stderr: Option<Vec<f64>>,
    pub covariance: Option<DMatrix<f64>>,
    pub chi_square: f64,
    pub reduced_chi_square: f64,
    pub n_residuals: usize,
    pub nfev: usize,
}

impl LmFit {
    /// Whether usable error bars were produced.
    pub fn has_errorbars(&self) -> bool {
        self.stderr
            .as_ref()
            .is_some_and(|s| s.iter().all(|v| v.is_finite() && *v > 0.0))
    }
}

/// Minimize the problem starting from `p0`.
pub fn minimize<P: LeastSquaresProblem>(
    problem: &P,
    p0: &[f64],
    opts: &LmOptions,
) -> Result<LmFit, LmError> {
    let n_par = p0.len();
    let mut nfev = 0usize;

    let mut p = DVector::from_column_slice(p0);
    let mut r = evaluate(problem, &p, &mut nfev).ok_or(LmError::NonFiniteResidual)?;
    let n = r.len();
    if n < n_par {
        return Err(LmError::Underdetermined { n, p: n_par });
    }

    let mut cost = r.norm_squared();
    let mut lambda = LAMBDA_INIT;
    let mut jac = jacobian(problem, &p, &r, &mut nfev)?;

    'outer: loop {
        if cost == 0.0 {
            break;
        }
        if nfev >= opts.max_nfev {
            return Err(LmError::MaxEvaluations { nfev });
        }

        let scale = column_scale(&jac);
        let js = scale_columns(&jac, &scale);
        let g = js.transpose() * &r;
        if g.amax() <= opts.gtol * cost.sqrt() {
            break;
        }
        let jtj = js.transpose() * &js;
        let p_scaled_norm = p.component_mul(&scale).norm();

        loop {
            let mut a = jtj.clone();
            for i in 0..n_par {
                a[(i, i)] += lambda;
            }

            let Some(chol) = a.cholesky() else {
                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    return Err(LmError::SingularStep);
                }
                continue;
            };
            let step_scaled = chol.solve(&(-&g));
            let step = step_scaled.component_div(&scale);
            let p_new = &p + &step;

            if let Some(r_new) = evaluate(problem, &p_new, &mut nfev) {
                let cost_new = r_new.norm_squared();
                if cost_new < cost {
                    let actual = (cost - cost_new) / cost;
                    let predicted_cost = (&r + &js * &step_scaled).norm_squared();
                    let predicted = (cost - predicted_cost) / cost;
                    let small_step =
                        step_scaled.norm() <= opts.xtol * (p_scaled_norm + opts.xtol);

                    p = p_new;
                    r = r_new;
                    cost = cost_new;
                    lambda = (lambda / 10.0).max(LAMBDA_MIN);

                    if (actual <= opts.ftol && predicted.abs() <= opts.ftol) || small_step {
                        break 'outer;
                    }
                    jac = jacobian(problem, &p, &r, &mut nfev)?;
                    continue 'outer;
                }
            }

            lambda *= 10.0;
            if lambda > LAMBDA_MAX {
                // No damped step reduces the cost: we sit at a minimum to working precision.
                break 'outer;
            }
            if nfev >= opts.max_nfev {
                return Err(LmError::MaxEvaluations { nfev });
            }
        }
    }

    let jac = jacobian(problem, &p, &r, &mut nfev)?;
    let dof = n - n_par;
    let reduced_chi_square = if dof > 0 { cost / dof as f64 } else { f64::NAN };
    let covariance = if dof > 0 {
        covariance(&jac, reduced_chi_square)
    } else {
        None
    };
    let stderr = covariance.as_ref().and_then(|cov| {
        let s: Vec<f64> = (0..n_par).map(|i| cov[(i, i)].sqrt()).collect();
        s.iter().all(|v| v.is_finite()).then_some(s)
    });

    Ok(LmFit {
        params: p.iter().copied().collect(),
        stderr,
        covariance,
        chi_square: cost,
        reduced_chi_square,
        n_residuals: n,
        nfev,
    })
}

fn evaluate<P: LeastSquaresProblem>(
    problem: &P,
    p: &DVector<f64>,
    nfev: &mut usize,
) -> Option<DVector<f64>> {
    *nfev += 1;
    let r = problem.residuals(p.as_slice())?;
    r.iter().all(|v| v.is_finite()).then_some(r)
}

fn jacobian<P: LeastSquaresProblem>(
    problem: &P,
    p: &DVector<f64>,
    r: &DVector<f64>,
    nfev: &mut usize,
) -> Result<DMatrix<f64>, LmError> {
    let eps = f64::EPSILON.sqrt();
    let mut jac = DMatrix::<f64>::zeros(r.len(), p.len());

    for j in 0..p.len() {
        let h = if p[j] == 0.0 { eps } else { eps * p[j].abs() };

        let mut shifted = p.clone();
        shifted[j] = p[j] + h;
        let (r_h, h) = match evaluate(problem, &shifted, nfev) {
            Some(r_h) => (r_h, h),
            None => {
                shifted[j] = p[j] - h;
                let r_h = evaluate(problem, &shifted, nfev).ok_or(LmError::NonFiniteResidual)?;
                (r_h, -h)
            }
        };

        for i in 0..r.len() {
            jac[(i, j)] = problem.residual_delta(i, r_h[i], r[i]) / h;
        }
    }

    Ok(jac)
}

fn column_scale(jac: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_iterator(
        jac.ncols(),
        jac.column_iter().map(|c| {
            let norm = c.norm();
            if norm > 0.0 && norm.is_finite() { norm } else { 1.0 }
        }),
    )
}

fn scale_columns(jac: &DMatrix<f64>, scale: &DVector<f64>) -> DMatrix<f64> {
    let mut out = jac.clone();
    for (j, mut col) in out.column_iter_mut().enumerate() {
        col /= scale[j];
    }
    out
}

fn covariance(jac: &DMatrix<f64>, reduced_chi_square: f64) -> Option<DMatrix<f64>> {
    if !reduced_chi_square.is_finite() {
        return None;
    }
    let scale = column_scale(jac);
    let js = scale_columns(jac, &scale);
    let inv = (js.transpose() * &js).cholesky()?.inverse();

    let n_par = jac.ncols();
    let cov = DMatrix::from_fn(n_par, n_par, |i, j| {
        inv[(i, j)] * reduced_chi_square / (scale[i] * scale[j])
    });
    cov.iter().all(|v| v.is_finite()).then_some(cov)
}
