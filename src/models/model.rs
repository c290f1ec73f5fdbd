//! Model evaluation for the circle, phase and magnitude fits.
//!
//! All frequencies are in Hz and all angles in radians.

use std::f64::consts::{FRAC_PI_2, PI};

use num_complex::Complex64;

use crate::domain::PhaseModel;
use crate::math::wrap_to;

/// Radius `ρ(θ)` at angle `θ` of a circle with center `(a, b)` and radius `r`, seen from the
/// origin.
///
/// Takes the outer root of `ρ² - 2ρ(a·cosθ + b·sinθ) + a² + b² - r² = 0`, which is the only
/// root when the origin lies inside the circle. Returns NaN where the ray misses the circle.
pub fn circle_radius(theta: f64, a: f64, b: f64, r: f64) -> f64 {
    let proj = a * theta.cos() + b * theta.sin();
    proj + (proj * proj - a * a - b * b + r * r).sqrt()
}

/// Phase around the circle center as a function of frequency.
pub fn phase_response(model: PhaseModel, f: f64, theta0: f64, ql: f64, fr: f64) -> f64 {
    let detuning = 2.0 * ql * (1.0 - f / fr);
    match model {
        PhaseModel::AllPass => theta0 + PI + 2.0 * detuning.atan(),
        PhaseModel::HalfAngle => wrap_to(theta0 + detuning.atan() - FRAC_PI_2, -FRAC_PI_2, FRAC_PI_2),
    }
}

/// Period on which `phase_response` values are compared.
pub fn phase_period(model: PhaseModel) -> f64 {
    match model {
        PhaseModel::AllPass => 2.0 * PI,
        PhaseModel::HalfAngle => PI,
    }
}

/// Complex notch-type transmission `1 - (Ql/Qc)·e^{-iφ} / (1 + 2i·Ql·(f - fr)/fr)`.
pub fn s21(f: f64, fr: f64, ql: f64, qc: f64, phi: f64) -> Complex64 {
    let coupling = Complex64::from_polar(ql / qc, -phi);
    let denom = Complex64::new(1.0, 2.0 * ql * (f - fr) / fr);
    Complex64::new(1.0, 0.0) - coupling / denom
}

/// Magnitude model of the final fit: `|S21(f)| + offset`.
pub fn s21_magnitude(f: f64, fr: f64, ql: f64, qc: f64, phi: f64, offset: f64) -> f64 {
    s21(f, fr, ql, qc, phi).norm() + offset
}

/// Physical coupling quality factor from the normalized circle.
///
/// The diameter of the normalized resonance circle is `Ql / (Qc·cos φ)`.
pub fn coupling_q(ql: f64, r: f64, phi: f64) -> f64 {
    ql / (2.0 * r * phi.cos())
}
