//! Numerical utilities on 1-D functions: extrema, level crossings, integrals
//! and error propagation for derived quantities.
//!
//! Extremum searches scan a fixed grid first (default 1000 points) and then
//! refine with golden-section search inside the best grid cell, so narrow
//! peaks on wide ranges are not missed.

use nalgebra::DMatrix;

pub const DEFAULT_NPX: usize = 1000;

const GOLDEN: f64 = 0.618_033_988_749_894_8;

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b { (a, b) } else { (b, a) }
}

fn grid_extremum<F: Fn(f64) -> f64>(f: &F, a: f64, b: f64, npx: usize, maximize: bool) -> f64 {
    let (a, b) = ordered(a, b);
    if a == b {
        return a;
    }
    let n = npx.max(2);
    let dx = (b - a) / n as f64;
    let sign = if maximize { 1.0 } else { -1.0 };

    let mut best_x = a;
    let mut best_y = f64::NEG_INFINITY;
    for i in 0..=n {
        let x = a + dx * i as f64;
        let y = sign * f(x);
        if y.is_finite() && y > best_y {
            best_y = y;
            best_x = x;
        }
    }

    // Golden-section refinement on the neighbouring cells.
    let mut lo = (best_x - dx).max(a);
    let mut hi = (best_x + dx).min(b);
    for _ in 0..60 {
        let x1 = hi - GOLDEN * (hi - lo);
        let x2 = lo + GOLDEN * (hi - lo);
        if sign * f(x1) >= sign * f(x2) {
            hi = x2;
        } else {
            lo = x1;
        }
        if hi - lo < 1e-12 * (1.0 + best_x.abs()) {
            break;
        }
    }
    let refined = 0.5 * (lo + hi);
    if sign * f(refined) >= best_y { refined } else { best_x }
}

/// Abscissa of the maximum of `f` on `[a, b]`.
pub fn maximum_x<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    grid_extremum(&f, a, b, DEFAULT_NPX, true)
}

/// Abscissa of the minimum of `f` on `[a, b]`.
pub fn minimum_x<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    grid_extremum(&f, a, b, DEFAULT_NPX, false)
}

pub fn maximum<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    let x = grid_extremum(&f, a, b, DEFAULT_NPX, true);
    f(x)
}

pub fn minimum<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    let x = grid_extremum(&f, a, b, DEFAULT_NPX, false);
    f(x)
}

/// First `x` in `[a, b]` (scanning from `a`) where `f(x) == target`.
///
/// Returns `None` when `f - target` never changes sign on the grid.
pub fn find_x<F: Fn(f64) -> f64>(f: F, target: f64, a: f64, b: f64) -> Option<f64> {
    if !(a.is_finite() && b.is_finite()) {
        return None;
    }
    let n = DEFAULT_NPX;
    let dx = (b - a) / n as f64;
    let g = |x: f64| f(x) - target;

    let mut x0 = a;
    let mut g0 = g(x0);
    if g0 == 0.0 {
        return Some(x0);
    }
    for i in 1..=n {
        let x1 = a + dx * i as f64;
        let g1 = g(x1);
        if g1 == 0.0 {
            return Some(x1);
        }
        if g0.is_finite() && g1.is_finite() && (g0 < 0.0) != (g1 < 0.0) {
            return Some(bisect(&g, x0, x1, g0));
        }
        x0 = x1;
        g0 = g1;
    }
    None
}

fn bisect<G: Fn(f64) -> f64>(g: &G, mut lo: f64, mut hi: f64, mut g_lo: f64) -> f64 {
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        let g_mid = g(mid);
        if g_mid == 0.0 {
            return mid;
        }
        if (g_mid < 0.0) == (g_lo < 0.0) {
            lo = mid;
            g_lo = g_mid;
        } else {
            hi = mid;
        }
        if (hi - lo).abs() < 1e-12 * (1.0 + mid.abs()) {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Full width at half maximum of a single-peaked function on `[a, b]`.
///
/// Returns `(peak_x, x_low, x_high)`; crossings that do not exist fall back to
/// the range ends.
pub fn half_max_crossings<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> (f64, f64, f64) {
    let peak_x = grid_extremum(&f, a, b, DEFAULT_NPX, true);
    let half = f(peak_x) * 0.5;
    let x1 = find_x(&f, half, a, peak_x).unwrap_or(a);
    let x2 = find_x(&f, half, peak_x, b).unwrap_or(b);
    (peak_x, x1, x2)
}

/// Adaptive Simpson integral of `f` on `[a, b]`.
pub fn integral<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    if a == b {
        return 0.0;
    }
    // Split into panels first so narrow features on wide ranges are resolved.
    let panels = 64;
    let h = (b - a) / panels as f64;
    (0..panels)
        .map(|i| {
            let lo = a + h * i as f64;
            let hi = lo + h;
            let mid = 0.5 * (lo + hi);
            let (flo, fmid, fhi) = (f(lo), f(mid), f(hi));
            let whole = simpson(lo, hi, flo, fmid, fhi);
            adaptive(&f, lo, hi, flo, fmid, fhi, whole, 1e-10, 30)
        })
        .sum()
}

fn simpson(a: f64, b: f64, fa: f64, fm: f64, fb: f64) -> f64 {
    (b - a) / 6.0 * (fa + 4.0 * fm + fb)
}

#[allow(clippy::too_many_arguments)]
fn adaptive<F: Fn(f64) -> f64>(f: &F, a: f64, b: f64, fa: f64, fm: f64, fb: f64, whole: f64, eps: f64, depth: u32) -> f64 {
    let m = 0.5 * (a + b);
    let lm = 0.5 * (a + m);
    let rm = 0.5 * (m + b);
    let flm = f(lm);
    let frm = f(rm);
    let left = simpson(a, m, fa, flm, fm);
    let right = simpson(m, b, fm, frm, fb);
    let delta = left + right - whole;
    if depth == 0 || delta.abs() <= 15.0 * eps * (1.0 + whole.abs()) {
        return left + right + delta / 15.0;
    }
    adaptive(f, a, m, fa, flm, fm, left, eps / 2.0, depth - 1) + adaptive(f, m, b, fm, frm, fb, right, eps / 2.0, depth - 1)
}

/// Mean of `x` weighted by `f` on `[a, b]`.
pub fn mean<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    let norm = integral(&f, a, b);
    if norm == 0.0 {
        return 0.0;
    }
    integral(|x| x * f(x), a, b) / norm
}

/// Variance of `x` weighted by `f` on `[a, b]`.
pub fn variance<F: Fn(f64) -> f64>(f: F, a: f64, b: f64) -> f64 {
    let norm = integral(&f, a, b);
    if norm == 0.0 {
        return 0.0;
    }
    let mu = integral(|x| x * f(x), a, b) / norm;
    integral(|x| (x - mu) * (x - mu) * f(x), a, b) / norm
}

/// Running integral of `f` sampled on `n + 1` evenly spaced points.
pub fn cumulative<F: Fn(f64) -> f64>(f: F, a: f64, b: f64, n: usize) -> Vec<(f64, f64)> {
    let n = n.max(1);
    let h = (b - a) / n as f64;
    let mut out = Vec::with_capacity(n + 1);
    let mut acc = 0.0;
    out.push((a, 0.0));
    for i in 0..n {
        let lo = a + h * i as f64;
        let hi = lo + h;
        acc += simpson(lo, hi, f(lo), f(0.5 * (lo + hi)), f(hi));
        out.push((hi, acc));
    }
    out
}

/// Linear interpolation on tabulated `(x, y)` points sorted by `x`.
///
/// Values outside the table are extrapolated from the end segments.
pub fn interpolate(points: &[(f64, f64)], x: f64) -> f64 {
    match points.len() {
        0 => return 0.0,
        1 => return points[0].1,
        _ => {}
    }
    let idx = points.partition_point(|p| p.0 < x);
    let k = idx.clamp(1, points.len() - 1);
    let (x0, y0) = points[k - 1];
    let (x1, y1) = points[k];
    if x1 == x0 {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Propagate the covariance of `params` to a derived quantity `g(params)`.
///
/// Uses a central-difference gradient with step `eps`. Non-positive variance
/// yields 0.
pub fn derived_error<G: Fn(&[f64]) -> f64>(g: G, params: &[f64], cov: &DMatrix<f64>, eps: f64) -> f64 {
    let n = params.len();
    let mut work = params.to_vec();
    let mut grad = vec![0.0; n];
    for i in 0..n {
        work[i] = params[i] + eps;
        let plus = g(&work);
        work[i] = params[i] - eps;
        let minus = g(&work);
        work[i] = params[i];
        grad[i] = (plus - minus) / (2.0 * eps);
    }
    let mut var = 0.0;
    for i in 0..n.min(cov.nrows()) {
        for j in 0..n.min(cov.ncols()) {
            var += grad[i] * grad[j] * cov[(i, j)];
        }
    }
    if var > 0.0 && var.is_finite() { var.sqrt() } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gauss(x: f64) -> f64 {
        (-0.5 * ((x - 2.0) / 0.5f64).powi(2)).exp()
    }

    #[test]
    fn finds_gaussian_peak_and_fwhm() {
        let (px, x1, x2) = half_max_crossings(gauss, -5.0, 10.0);
        assert!((px - 2.0).abs() < 1e-6);
        let fwhm = x2 - x1;
        assert!((fwhm - 2.0 * (2.0 * 2f64.ln()).sqrt() * 0.5).abs() < 1e-6);
    }

    #[test]
    fn integrates_gaussian() {
        let area = integral(gauss, -5.0, 10.0);
        assert!((area - 0.5 * (2.0 * std::f64::consts::PI).sqrt()).abs() < 1e-8);
        assert!((mean(gauss, -5.0, 10.0) - 2.0).abs() < 1e-8);
        assert!((variance(gauss, -5.0, 10.0) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn find_x_reports_missing_crossing() {
        assert!(find_x(|x| x, 5.0, 0.0, 1.0).is_none());
        let x = find_x(|x| x * x, 2.0, 0.0, 3.0).unwrap();
        assert!((x - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn minimum_of_parabola() {
        assert!((minimum_x(|x| (x - 0.3) * (x - 0.3), -1.0, 1.0) - 0.3).abs() < 1e-6);
    }

    #[test]
    fn interpolation_and_cumulative() {
        let c = cumulative(|_| 1.0, 0.0, 2.0, 4);
        assert_eq!(c.len(), 5);
        assert!((c[4].1 - 2.0).abs() < 1e-12);
        assert!((interpolate(&c, 1.25) - 1.25).abs() < 1e-12);
    }

    #[test]
    fn derived_error_of_linear_combination() {
        let cov = DMatrix::from_row_slice(2, 2, &[4.0, 0.0, 0.0, 9.0]);
        let err = derived_error(|p| p[0] + p[1], &[1.0, 2.0], &cov, 1e-4);
        assert!((err - 13f64.sqrt()).abs() < 1e-6);
    }
}
