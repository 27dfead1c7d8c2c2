//! Linear least squares solver.
//!
//! Used for linearized seeds (the log-log regression that starts the HV–gain
//! power-law fit) and for inverting the normal matrix of a finished fit.
//!
//! Implementation choices:
//! - We use SVD because the design matrix is tall (more rows than columns).
//!   (Nalgebra's `QR::solve` is intended for square systems and will panic for
//!   non-square matrices.)
//! - Parameter dimension is tiny (≤ 10 columns), so SVD cost is negligible
//!   next to model evaluation.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    // Nearly collinear columns (voltages spanning a narrow log range) need a
    // relaxed cut-off; start strict.
    let svd = x.clone().svd(true, true);

    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Invert a symmetric positive semi-definite matrix, falling back to the
/// pseudo-inverse when it is singular.
pub fn invert_symmetric(a: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if let Some(inv) = a.clone().try_inverse() {
        if inv.iter().all(|v| v.is_finite()) {
            return Some(inv);
        }
    }
    a.clone()
        .pseudo_inverse(1e-12)
        .ok()
        .filter(|m| m.iter().all(|v| v.is_finite()))
}
