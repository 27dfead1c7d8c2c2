//! Chi-square fit of a model shape to a 1-D histogram.
//!
//! Bins are used when their centre lies inside the fit range and their content
//! is positive; each contributes `(content - model) / √content`. This matches
//! the default (Neyman) histogram χ² of the usual HEP fitting tools.

use nalgebra::DMatrix;

use crate::domain::Histogram1D;
use crate::error::AppError;
use crate::math::{LmOptions, Parameters, minimize, status};
use crate::models::ModelKind;

/// Result of a histogram fit.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveFit {
    pub kind: ModelKind,
    pub values: Vec<f64>,
    pub errors: Vec<f64>,
    pub covariance: DMatrix<f64>,
    pub chi2: f64,
    pub ndf: i64,
    pub range: (f64, f64),
    pub status: i32,
}

impl CurveFit {
    pub fn valid(&self) -> bool {
        (self.status == status::CONVERGED || self.status == status::CALL_LIMIT)
            && self.values.iter().all(|v| v.is_finite())
            && self.ndf >= 0
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.kind.eval(x, &self.values)
    }

    pub fn chi2_ndf(&self) -> f64 {
        if self.ndf > 0 { self.chi2 / self.ndf as f64 } else { 0.0 }
    }
}

/// Bin centres and contents used by a fit on `[lo, hi]`.
pub fn fit_points(hist: &Histogram1D, lo: f64, hi: f64) -> Vec<(f64, f64)> {
    (0..hist.nbins)
        .filter_map(|i| {
            let x = hist.bin_center(i);
            let c = hist.bin_content(i);
            (x >= lo && x <= hi && c > 0.0).then_some((x, c))
        })
        .collect()
}

/// Fit `kind` to `hist` on `range`, starting from (and honouring the
/// fix/limit state of) `params`.
pub fn fit_histogram(
    hist: &Histogram1D,
    kind: ModelKind,
    params: &Parameters,
    range: (f64, f64),
    opts: &LmOptions,
) -> Result<CurveFit, AppError> {
    let (lo, hi) = if range.0 <= range.1 { range } else { (range.1, range.0) };
    let points = fit_points(hist, lo, hi);
    if points.is_empty() {
        return Err(AppError::no_data(format!("{}: no filled bins in [{lo}, {hi}]", hist.name)));
    }

    let residuals = |p: &[f64], out: &mut Vec<f64>| {
        out.clear();
        out.extend(points.iter().map(|&(x, c)| (c - kind.eval(x, p)) / c.sqrt()));
    };

    let outcome = minimize(residuals, params, opts)?;
    log::debug!(
        "{} fit of {} on [{lo:.4}, {hi:.4}]: chi2={:.3} ndf={} status={}",
        kind.as_str(),
        hist.name,
        outcome.chi2,
        outcome.ndf(),
        outcome.status
    );

    Ok(CurveFit {
        kind,
        ndf: outcome.ndf(),
        values: outcome.values,
        errors: outcome.errors,
        covariance: outcome.covariance,
        chi2: outcome.chi2,
        range: (lo, hi),
        status: outcome.status,
    })
}

/// Fit and copy the fitted values back into `params` (keeping fix/limit state),
/// the way successive fit stages chain on one function object.
pub fn fit_stage(
    hist: &Histogram1D,
    kind: ModelKind,
    params: &mut Parameters,
    range: (f64, f64),
    opts: &LmOptions,
) -> Result<CurveFit, AppError> {
    let fit = fit_histogram(hist, kind, params, range, opts)?;
    params.set_all(&fit.values);
    Ok(fit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::gaus;

    fn gaussian_hist(amp: f64, mean: f64, sigma: f64) -> Histogram1D {
        let contents = (0..100)
            .map(|i| {
                let x = -5.0 + 0.1 * (i as f64 + 0.5);
                gaus(x, amp, mean, sigma).round()
            })
            .collect();
        Histogram1D::from_contents("g", -5.0, 5.0, contents)
    }

    #[test]
    fn recovers_gaussian_parameters() {
        let h = gaussian_hist(1000.0, 0.5, 0.8);
        let params = Parameters::new(ModelKind::Gaussian.param_names(), &[800.0, 0.3, 1.0]);
        let fit = fit_histogram(&h, ModelKind::Gaussian, &params, (-5.0, 5.0), &LmOptions::default()).unwrap();
        assert!(fit.valid());
        assert!((fit.values[1] - 0.5).abs() < 0.01);
        assert!((fit.values[2].abs() - 0.8).abs() < 0.01);
        assert!(fit.errors[1] > 0.0);
    }

    #[test]
    fn ndf_counts_only_filled_bins_in_range() {
        let h = gaussian_hist(1000.0, 0.0, 0.5);
        let n = fit_points(&h, -1.0, 1.0).len();
        let params = Parameters::new(ModelKind::Gaussian.param_names(), &[900.0, 0.0, 0.5]);
        let fit = fit_histogram(&h, ModelKind::Gaussian, &params, (1.0, -1.0), &LmOptions::default()).unwrap();
        assert_eq!(fit.ndf, n as i64 - 3);
        assert_eq!(fit.range, (-1.0, 1.0));
    }

    #[test]
    fn empty_range_is_an_error() {
        let h = Histogram1D::new("e", "", 10, 0.0, 1.0);
        let params = Parameters::new(ModelKind::Gaussian.param_names(), &[1.0, 0.5, 0.1]);
        let err = fit_histogram(&h, ModelKind::Gaussian, &params, (0.0, 1.0), &LmOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
