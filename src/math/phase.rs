//! Angle helpers.

use std::f64::consts::PI;

/// Wrap `x` into the half-open interval `[lo, hi)`.
pub fn wrap_to(x: f64, lo: f64, hi: f64) -> f64 {
    lo + (x - lo).rem_euclid(hi - lo)
}

/// Wrap an angle into `[-π, π)`.
pub fn wrap_pi(x: f64) -> f64 {
    wrap_to(x, -PI, PI)
}

/// Remove `2π` jumps between consecutive samples (NumPy `unwrap` semantics).
///
/// Non-finite values are passed through and do not reset the running correction.
pub fn unwrap(phases: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phases.len());
    let mut correction = 0.0;
    let mut prev: Option<f64> = None;
    for &p in phases {
        if !p.is_finite() {
            out.push(p);
            continue;
        }
        if let Some(q) = prev {
            let jump = p - q;
            let wrapped = wrap_pi(jump);
            // Keep +π rather than folding it to -π.
            let wrapped = if wrapped == -PI && jump > 0.0 { PI } else { wrapped };
            if jump.abs() >= PI {
                correction += wrapped - jump;
            }
        }
        prev = Some(p);
        out.push(p + correction);
    }
    out
}
