//! Linear least squares.
//!
//! Background removal needs a straight-line fit of phase against frequency over the whole
//! sweep. Frequencies sit around `1e9..1e10` Hz with spans that are small in comparison, so
//! the abscissa is centered before building the design matrix.
//!
//! Implementation choices:
//! - We solve with SVD so tall design matrices are handled robustly.
//!   (Nalgebra's `QR::solve` is intended for square systems and will panic for
//!   non-square matrices.)

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if strict solve fails.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Straight line `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    pub slope: f64,
    pub intercept: f64,
}

impl Line {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Ordinary least-squares line through `(x, y)`.
///
/// Returns `None` for mismatched lengths, fewer than two points or non-finite input.
pub fn fit_line(x: &[f64], y: &[f64]) -> Option<Line> {
    let n = x.len();
    if n < 2 || y.len() != n {
        return None;
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return None;
    }

    let x_mean = x.iter().sum::<f64>() / n as f64;
    let design = DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { x[i] - x_mean });
    let beta = solve_least_squares(&design, &DVector::from_column_slice(y))?;

    let slope = beta[1];
    Some(Line {
        slope,
        intercept: beta[0] - slope * x_mean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn fit_line_recovers_ghz_scale_background() {
        // 1 mrad per MHz across a 20 MHz sweep centered at 8.43 GHz.
        let f: Vec<f64> = (0..201).map(|i| 8.42e9 + i as f64 * 1e5).collect();
        let theta: Vec<f64> = f.iter().map(|&v| 1e-9 * v + 0.2).collect();

        let line = fit_line(&f, &theta).unwrap();
        assert!((line.slope - 1e-9).abs() < 1e-15, "slope {}", line.slope);
        for (&fi, &ti) in f.iter().zip(theta.iter()) {
            assert!((line.eval(fi) - ti).abs() < 1e-9);
        }
    }

    #[test]
    fn fit_line_rejects_degenerate_input() {
        assert!(fit_line(&[1.0], &[2.0]).is_none());
        assert!(fit_line(&[1.0, 2.0], &[2.0]).is_none());
        assert!(fit_line(&[1.0, f64::NAN], &[2.0, 3.0]).is_none());
    }
}
