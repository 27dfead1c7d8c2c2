//! Diagnostic plots: terminal ASCII and SVG files.

pub mod ascii;
pub mod svg;

pub use ascii::*;
pub use svg::*;

use crate::fit::CurveFit;

/// `n` evenly spaced samples of `f` over `[lo, hi]`.
pub fn sample_curve<F: Fn(f64) -> f64>(f: F, lo: f64, hi: f64, n: usize) -> Vec<(f64, f64)> {
    let n = n.max(2);
    (0..n)
        .map(|i| {
            let x = lo + (hi - lo) * i as f64 / (n as f64 - 1.0);
            (x, f(x))
        })
        .collect()
}

/// Samples of a fitted curve over its own fit range.
pub fn fit_curve_points(fit: &CurveFit, n: usize) -> Vec<(f64, f64)> {
    sample_curve(|x| fit.eval(x), fit.range.0, fit.range.1, n)
}
