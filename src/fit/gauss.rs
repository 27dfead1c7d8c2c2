//! Gaussian fits of charge and pedestal histograms.

use crate::domain::{GaussFitSummary, Histogram1D, HitType, PedestalEntry};
use crate::error::AppError;
use crate::fit::curve::{CurveFit, fit_histogram};
use crate::fit::peaks::rough_peak;
use crate::math::{LmOptions, Parameters};
use crate::models::ModelKind;

pub const MIN_CHARGE_ENTRIES: f64 = 200.0;
pub const MIN_PEDESTAL_ENTRIES: f64 = 100.0;

/// Seed values `(amp, mean, sigma)` from the bins whose centre is in `[lo, hi]`.
fn seed_in_range(hist: &Histogram1D, lo: f64, hi: f64) -> [f64; 3] {
    let mut amp = 0.0;
    let mut peak = 0.5 * (lo + hi);
    let (mut sw, mut swx, mut swx2) = (0.0, 0.0, 0.0);
    for i in 0..hist.nbins {
        let x = hist.bin_center(i);
        if x < lo || x > hi {
            continue;
        }
        let c = hist.bin_content(i);
        if c > amp {
            amp = c;
            peak = x;
        }
        sw += c;
        swx += c * x;
        swx2 += c * x * x;
    }
    let sigma = if sw > 0.0 {
        let m = swx / sw;
        (swx2 / sw - m * m).max(0.0).sqrt()
    } else {
        0.0
    };
    let sigma = if sigma > 0.0 { sigma } else { hist.bin_width() };
    [amp, peak, sigma]
}

/// Single Gaussian fit on `[lo, hi]` with seeds taken from that window.
pub fn fit_gaussian(hist: &Histogram1D, lo: f64, hi: f64) -> Result<CurveFit, AppError> {
    let seeds = seed_in_range(hist, lo, hi);
    let params = Parameters::new(ModelKind::Gaussian.param_names(), &seeds);
    fit_histogram(hist, ModelKind::Gaussian, &params, (lo, hi), &LmOptions::default())
}

fn clamp_range(hist: &Histogram1D, lo: f64, hi: f64) -> (f64, f64) {
    (lo.max(hist.xmin), hi.min(hist.xmax))
}

/// Two-stage Gaussian fit of a charge histogram.
///
/// The prefit covers the maximum bin ± 5 standard deviations, the final fit
/// the prefit mean ± 2σ (both clamped to the axis).
pub fn fit_charge_two_stage(hist: &Histogram1D, ch: usize, kind: HitType, voltage: f64) -> Result<GaussFitSummary, AppError> {
    if hist.entries < MIN_CHARGE_ENTRIES {
        return Err(AppError::no_data(format!("{}: {} entries, need {MIN_CHARGE_ENTRIES}", hist.name, hist.entries)));
    }
    let (rough, _) = rough_peak(hist);
    let rough_sigma = hist.std_dev();
    if rough_sigma == 0.0 {
        return Err(AppError::no_data(format!("{}: zero spread", hist.name)));
    }

    let (lo, hi) = clamp_range(hist, rough - 5.0 * rough_sigma, rough + 5.0 * rough_sigma);
    let pre = fit_gaussian(hist, lo, hi)?;
    let (pre_mean, pre_sigma) = (pre.values[1], pre.values[2].abs());

    let (lo, hi) = clamp_range(hist, pre_mean - 2.0 * pre_sigma, pre_mean + 2.0 * pre_sigma);
    let params = Parameters::new(ModelKind::Gaussian.param_names(), &[pre.values[0], pre_mean, pre_sigma]);
    let fit = fit_histogram(hist, ModelKind::Gaussian, &params, (lo, hi), &LmOptions::default())?;
    if !fit.valid() || fit.ndf <= 0 {
        return Err(AppError::fit(format!("{}: gaussian fit failed (status {}, ndf {})", hist.name, fit.status, fit.ndf)));
    }

    Ok(GaussFitSummary {
        ch,
        kind,
        voltage,
        peak: fit.values[1],
        peak_err: fit.errors[1],
        sigma: fit.values[2].abs(),
        sigma_err: fit.errors[2],
        chi2_ndf: fit.chi2_ndf(),
        rough_sigma,
    })
}

/// Gaussian fit of a pedestal histogram on the maximum bin ± 5 standard
/// deviations.
pub fn fit_pedestal(hist: &Histogram1D, ch: usize, kind: HitType) -> Result<PedestalEntry, AppError> {
    fit_pedestal_curve(hist, ch, kind).map(|(entry, _)| entry)
}

/// [`fit_pedestal`] that also hands back the fitted curve.
pub fn fit_pedestal_curve(hist: &Histogram1D, ch: usize, kind: HitType) -> Result<(PedestalEntry, CurveFit), AppError> {
    if hist.entries < MIN_PEDESTAL_ENTRIES {
        return Err(AppError::no_data(format!("{}: {} entries, need {MIN_PEDESTAL_ENTRIES}", hist.name, hist.entries)));
    }
    let (peak, _) = rough_peak(hist);
    let sd = hist.std_dev();
    let (lo, hi) = if sd > 0.0 { (peak - 5.0 * sd, peak + 5.0 * sd) } else { (hist.xmin, hist.xmax) };
    let fit = fit_gaussian(hist, lo, hi)?;
    if !fit.valid() {
        return Err(AppError::fit(format!("{}: pedestal fit failed (status {})", hist.name, fit.status)));
    }
    let entry = PedestalEntry {
        ch,
        kind,
        mean: fit.values[1],
        err: fit.errors[1],
    };
    Ok((entry, fit))
}

/// Pedestal level as the plain histogram mean and its error.
pub fn pedestal_mean(hist: &Histogram1D, ch: usize, kind: HitType) -> Result<PedestalEntry, AppError> {
    if hist.entries < MIN_PEDESTAL_ENTRIES {
        return Err(AppError::no_data(format!("{}: {} entries, need {MIN_PEDESTAL_ENTRIES}", hist.name, hist.entries)));
    }
    Ok(PedestalEntry {
        ch,
        kind,
        mean: hist.mean(),
        err: hist.mean_error(),
    })
}
