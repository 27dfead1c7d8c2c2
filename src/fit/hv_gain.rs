//! Power-law fit of charge against applied high voltage, `charge = b · HV^a`.

use std::sync::LazyLock;

use regex::Regex;

use crate::domain::HvGainFit;
use crate::error::AppError;
use crate::math::{LmOptions, Parameters, minimize, solve_least_squares};
use crate::models::{ModelKind, power_law};

pub const HV_RANGE: (f64, f64) = (1400.0, 2400.0);
pub const SEED_B: f64 = 1.0e-10;
pub const SEED_A: f64 = 5.0;

static CHANNEL_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"_ch(\d+)\.txt").ok());

/// Channel number from `..._ch<N>.txt`, or -1.
pub fn channel_from_filename(name: &str) -> i64 {
    CHANNEL_RE
        .as_ref()
        .and_then(|re| re.captures(name))
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(-1)
}

/// Seed `(b, a)` from a straight-line fit of `ln y` against `ln x`, when at
/// least two positive points are available.
fn log_log_seed(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let pos: Vec<(f64, f64)> = points
        .iter()
        .filter(|(x, y)| *x > 0.0 && *y > 0.0)
        .map(|(x, y)| (x.ln(), y.ln()))
        .collect();
    if pos.len() < 2 {
        return None;
    }
    let x = nalgebra::DMatrix::from_fn(pos.len(), 2, |i, j| if j == 0 { 1.0 } else { pos[i].0 });
    let y = nalgebra::DVector::from_iterator(pos.len(), pos.iter().map(|p| p.1));
    let beta = solve_least_squares(&x, &y)?;
    let (b, a) = (beta[0].exp(), beta[1]);
    (b.is_finite() && a.is_finite() && b > 0.0).then_some((b, a))
}

/// Fit `b · x^a` to the `(voltage, charge)` points inside [`HV_RANGE`].
///
/// Points carry unit weight, and the parameter errors are scaled by
/// `√(χ²/ndf)` as for a graph without point errors.
pub fn fit_hv_gain(points: &[(f64, f64)], ch: i64) -> Result<HvGainFit, AppError> {
    let (lo, hi) = HV_RANGE;
    let used: Vec<(f64, f64)> = points.iter().copied().filter(|(x, _)| *x >= lo && *x <= hi).collect();
    if used.is_empty() {
        return Err(AppError::no_data(format!("ch{ch}: no points in {lo}..{hi} V")));
    }

    let (b0, a0) = log_log_seed(&used).unwrap_or((SEED_B, SEED_A));
    log::debug!("ch{ch}: power-law seed b={b0:e} a={a0:.3}");
    let params = Parameters::new(ModelKind::PowerLaw.param_names(), &[b0, a0]);

    let outcome = minimize(
        |p, out| {
            out.clear();
            out.extend(used.iter().map(|&(x, y)| y - power_law(x, p[0], p[1])));
        },
        &params,
        &LmOptions::default(),
    )?;
    if !outcome.is_usable() {
        return Err(AppError::fit(format!("ch{ch}: power-law fit failed (status {})", outcome.status)));
    }

    let ndf = outcome.ndf();
    let scale = if ndf > 0 { (outcome.chi2 / ndf as f64).sqrt() } else { 1.0 };
    Ok(HvGainFit {
        ch,
        b: outcome.values[0],
        b_err: outcome.errors[0] * scale,
        a: outcome.values[1],
        a_err: outcome.errors[1] * scale,
        chi2: outcome.chi2,
        ndf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_number_from_file_name() {
        assert_eq!(channel_from_filename("out/HV_vs_Charge_ch7.txt"), 7);
        assert_eq!(channel_from_filename("HV_vs_Charge.txt"), -1);
    }

    #[test]
    fn recovers_power_law() {
        let pts: Vec<(f64, f64)> = (0..8)
            .map(|i| {
                let x = 1450.0 + 120.0 * i as f64;
                let jitter = if i % 2 == 0 { 1.01 } else { 0.99 };
                (x, 2.0e-14 * x.powf(5.0) * jitter)
            })
            .chain([(1000.0, 5.0), (3000.0, 1.0e5)])
            .collect();
        let fit = fit_hv_gain(&pts, 3).unwrap();
        assert_eq!(fit.ch, 3);
        assert_eq!(fit.ndf, 6);
        assert!((fit.a - 5.0).abs() < 0.1, "a {}", fit.a);
        assert!(fit.a_err > 0.0);
    }

    #[test]
    fn empty_range_is_no_data() {
        let err = fit_hv_gain(&[(1000.0, 1.0)], 0).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
