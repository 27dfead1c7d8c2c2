//! Pedestal + single-photoelectron (SPE) charge fit.
//!
//! The 2- and 3-peak fits are staged: the pedestal and 1 pe Gaussians are
//! fitted on their own first, then combined into the full model, and (for
//! three peaks) the 2 pe and backscatter parameters are unlocked a few at a
//! time while the rest stay fixed or tightly limited.
//!
//! The 1-peak mode is a single Gaussian around the dominant peak.

use std::f64::consts::SQRT_2;

use crate::domain::{Histogram1D, HistogramBundle, SpeFitResult, spe_hist_name};
use crate::error::AppError;
use crate::fit::curve::{CurveFit, fit_stage};
use crate::fit::gauss::fit_gaussian;
use crate::fit::peaks::{PeakSearchOptions, search_peaks};
use crate::math::func;
use crate::math::{LmOptions, Parameters};
use crate::models::{ModelKind, gaus, spe_backscatter, spe_one_pe_all};

/// Elementary charge in coulomb; `gain = charge[pC] · 1e-12 / e`.
pub const ELECTRON_CHARGE: f64 = 1.602_176_62e-19;

/// Minimum entry count for the batch SPE fit.
pub const MIN_SPE_ENTRIES: f64 = 100.0;

const AREA_SIGMA_OFFSET: f64 = 0.07;
const ONE_SIGMA_PERCENT: f64 = 34.1;

pub fn gain(charge_pc: f64) -> f64 {
    charge_pc / ELECTRON_CHARGE * 1e-12
}

#[derive(Debug, Clone, Copy)]
pub struct SpeOptions {
    /// 1, 2 or 3.
    pub n_peaks: usize,
    /// Bin grouping applied after the single-peak prefits (0 or 1 = none).
    pub rebin: usize,
    /// Peak positions used when the peak search does not find them.
    pub seeds: [f64; 3],
    pub peak_search: bool,
}

impl Default for SpeOptions {
    fn default() -> Self {
        Self {
            n_peaks: 2,
            rebin: 4,
            seeds: [440.0, 470.0, 500.0],
            peak_search: true,
        }
    }
}

/// Initial peak positions and heights.
fn seed_peaks(hist: &Histogram1D, opts: &SpeOptions) -> ([f64; 3], [f64; 3]) {
    let mut px = opts.seeds;
    let mut py = [
        hist.bin_content_at(px[0]),
        hist.bin_content_at(px[1]),
        hist.bin_content_at(px[1]),
    ];

    if !opts.peak_search {
        return (px, py);
    }

    let found = search_peaks(
        hist,
        &PeakSearchOptions {
            max_peaks: opts.n_peaks.max(1),
            ..Default::default()
        },
    );
    for (i, p) in found.iter().take(opts.n_peaks.min(3)).enumerate() {
        log::debug!("{}: peak {i} at x={:.4} y={:.1}", hist.name, p.x, p.y);
        px[i] = p.x;
        py[i] = p.y;
    }

    if opts.n_peaks == 1 {
        return (px, py);
    }
    if px[0] > px[1] {
        px.swap(0, 1);
        py.swap(0, 1);
    }
    px[2] = px[0] + (px[1] - px[0]) * 2.0;
    py[2] = hist.bin_content_at(px[2]);
    (px, py)
}

/// Fit a pedestal + SPE model and derive gain, resolution and P/V figures.
pub fn fit_ped_pe(hist: &Histogram1D, opts: &SpeOptions) -> Result<SpeFitResult, AppError> {
    let (px, _py) = seed_peaks(hist, opts);
    match opts.n_peaks {
        1 => fit_single_peak(hist, px[0]),
        2 | 3 => fit_staged(hist, px, opts),
        n => Err(AppError::input(format!("Unsupported number of SPE peaks: {n} (expected 1, 2 or 3)."))),
    }
}

fn fit_single_peak(hist: &Histogram1D, p0: f64) -> Result<SpeFitResult, AppError> {
    let fit = fit_gaussian(hist, p0 * 0.8, p0 * 1.2)?;
    if !fit.valid() {
        return Err(AppError::fit(format!("{}: single-peak fit failed (status {})", hist.name, fit.status)));
    }
    let f = |x: f64| fit.eval(x);
    let (xmin, xmax) = (hist.xmin, hist.xmax);
    let peakx = func::maximum_x(f, xmin, xmax);
    let peaky = f(peakx);
    let fwhm_low = peakx - func::find_x(f, peaky * 0.5, xmin, peakx).unwrap_or(xmin);
    let fwhm_high = func::find_x(f, peaky * 0.5, peakx, xmax).unwrap_or(xmax) - peakx;

    Ok(SpeFitResult {
        n_peaks: 1,
        mean: -1.0,
        variance: -1.0,
        peakx,
        peaky,
        fwhm_low,
        fwhm_high,
        fwhm: fwhm_low + fwhm_high,
        sigma_low: -1.0,
        sigma_high: -1.0,
        sigma: fit.values[2].abs(),
        peak1pe_x: -1.0,
        peak1pe_sigma: -1.0,
        peak1pe_x_err: -1.0,
        peak1pe_sigma_err: -1.0,
        valley: -1.0,
        valley_x: -1.0,
        peak: peakx,
        pv: -1.0,
        area_ped: -1.0,
        area_1pe: -1.0,
        area_1pe_all: -1.0,
        area_bs: 0.0,
        area_sigma_low: -1.0,
        area_sigma_high: -1.0,
        area_sigma: -1.0,
        gain_peakx: gain(peakx),
        gain_peak1pe_x: -1.0,
        gain_peak1pe_x_err: -1.0,
        chi2: fit.chi2,
        ndf: fit.ndf as f64,
        params: fit.values,
    })
}

/// One stage of the staged fit. A failing stage keeps the current parameters.
fn stage(hist: &Histogram1D, kind: ModelKind, params: &mut Parameters, range: (f64, f64), last: &mut Option<CurveFit>) {
    match fit_stage(hist, kind, params, range, &LmOptions::default()) {
        Ok(fit) => *last = Some(fit),
        Err(e) => log::warn!("{}: {} stage on [{:.3}, {:.3}] skipped: {e}", hist.name, kind.as_str(), range.0, range.1),
    }
}

/// The 2 pe component has overtaken the 1 pe one, or the 1 pe amplitude went
/// negative.
fn second_peak_dominates(p: &Parameters) -> bool {
    p.value(3) < p.value(6) || p.value(3) < 0.0
}

/// Take the 2 pe amplitude and position as the 1 pe ones and switch the 2 pe
/// Gaussian off.
fn promote_second_peak(p: &mut Parameters) {
    let (amp, mean) = (p.value(6), p.value(7));
    p.set(3, amp);
    p.set(4, mean);
    for i in 6..9 {
        p.fix(i, 0.0);
    }
}

fn fit_staged(hist: &Histogram1D, px: [f64; 3], opts: &SpeOptions) -> Result<SpeFitResult, AppError> {
    let n = opts.n_peaks;
    let gap = px[1] - px[0];
    let ped = fit_gaussian(hist, px[0] * 0.8, px[0] + gap * 0.2)?;
    let pe1 = fit_gaussian(hist, px[1] - gap * 0.2, px[1] + gap * 0.2)?;

    let mut h = hist.clone();
    let mut seeds = vec![
        ped.values[0],
        ped.values[1],
        ped.values[2],
        pe1.values[0],
        pe1.values[1],
        pe1.values[2],
        0.1,
    ];
    if opts.rebin > 1 {
        h.rebin(opts.rebin);
        seeds[0] *= opts.rebin as f64;
        seeds[3] *= opts.rebin as f64;
    }
    let xmin = h.xmin;

    let mut two = Parameters::new(ModelKind::Spe2.param_names(), &seeds);
    two.set_limits(6, 0.0, 1.0);
    let mut last = None;
    stage(&h, ModelKind::Spe2, &mut two, (xmin, px[1] * 1.5), &mut last);

    let (kind, params, last) = if n == 2 {
        (ModelKind::Spe2, two, last)
    } else {
        let (p, last) = fit_three_peaks(&h, &two);
        (ModelKind::Spe3, p, last)
    };
    let Some(last) = last else {
        return Err(AppError::fit(format!("{}: every SPE fit stage failed", hist.name)));
    };

    let one_pe_err = (pe1.errors[1], pe1.errors[2]);
    Ok(derive(&h, kind, n, &params.values(), &last, one_pe_err))
}

fn fit_three_peaks(h: &Histogram1D, two: &Parameters) -> (Parameters, Option<CurveFit>) {
    let (xmin, xmax) = (h.xmin, h.xmax);
    let v = two.values();
    let seeds = [
        v[0],
        v[1],
        v[2],
        v[3],
        v[4],
        v[5],
        v[3] * 0.1,
        v[4] * 2.0 - v[1],
        v[5].abs() * SQRT_2,
        v[6],
    ];
    let mut p = Parameters::new(ModelKind::Spe3.param_names(), &seeds);
    let k = ModelKind::Spe3;
    let mut last = None;

    // 2 pe amplitude and width only.
    p.set_limits(8, p.value(5).abs() * 0.5, p.value(5).abs() * SQRT_2 * 1.2);
    for i in 0..6 {
        p.fix(i, p.value(i));
    }
    p.fix(9, 0.25);
    p.fix(7, p.value(4) * 2.0 - p.value(1));
    stage(h, k, &mut p, (xmin, xmax), &mut last);

    // Everything, with the 2 pe position boxed in and its width pinned.
    p.release_all();
    p.set_limits(7, p.value(7) - p.value(8) * 0.3, p.value(7) + p.value(8) * 0.3);
    p.set_limits(8, p.value(5).abs(), p.value(5).abs());
    p.set_limits(9, 0.15, 0.5);
    stage(h, k, &mut p, (xmin, xmax), &mut last);

    p.fix(7, p.value(4) * 2.0 - p.value(1));
    p.fix(8, p.value(5));
    stage(h, k, &mut p, (-0.3, xmax), &mut last);

    p.release(7);
    p.release(8);
    p.set_limits(8, p.value(8).abs() * 0.1, p.value(8).abs() * 1.7);
    if second_peak_dominates(&p) {
        log::info!("{}: 2 pe component dominates, refitting without it", h.name);
        promote_second_peak(&mut p);
        stage(h, k, &mut p, (-0.3, xmax), &mut last);
    }

    // Backscatter fraction alone.
    for i in 0..3 {
        p.fix(i, p.value(i));
    }
    if second_peak_dominates(&p) {
        for i in 6..9 {
            p.fix(i, 0.0);
        }
    } else {
        for i in 6..9 {
            p.fix(i, p.value(i));
        }
    }
    for i in 3..6 {
        p.fix(i, p.value(i));
    }
    p.set_limits(9, 0.01, 1.0);
    let snapshot = p.values();
    let valley_x = func::minimum_x(|x| k.eval(x, &snapshot), snapshot[1], snapshot[4]);
    let range = (valley_x * 0.9, (p.value(4) - p.value(5)) * 1.2);
    stage(h, k, &mut p, range, &mut last);

    // Final: 1 pe and 2 pe within ±20 %.
    for i in 3..9 {
        p.release(i);
        let v = p.value(i);
        p.set_limits(i, (v * 0.8).min(v * 1.2), (v * 0.8).max(v * 1.2));
    }
    p.fix(9, p.value(9));
    let range = (0.7, p.value(7) + p.value(8) * 2.0);
    stage(h, k, &mut p, range, &mut last);
    if second_peak_dominates(&p) {
        log::info!("{}: final fit failed, refitting without the 2 pe component", h.name);
        for i in 6..9 {
            p.fix(i, 0.0);
        }
        p.fix(9, p.value(9));
        let range = (0.7, p.value(7) + p.value(8) * 2.0);
        stage(h, k, &mut p, range, &mut last);
    }
    p.release_all();

    (p, last)
}

/// Sigma-equivalent widths from the integral of the 1 pe response: the
/// distance from the peak to the points enclosing ±34.1 % of the area.
fn area_sigma<F: Fn(f64) -> f64>(f: F, xmin: f64, xmax: f64, peakx: f64) -> (f64, f64, f64) {
    let cumulative = func::cumulative(&f, xmin, xmax, func::DEFAULT_NPX);
    let total = cumulative.last().map(|p| p.1).unwrap_or(0.0);
    if total == 0.0 || !total.is_finite() {
        return (0.0, 0.0, 0.0);
    }
    let eff: Vec<(f64, f64)> = cumulative
        .iter()
        .map(|&(x, y)| (x, (y / total * 100.0 + AREA_SIGMA_OFFSET) / (100.0 + AREA_SIGMA_OFFSET) * 100.0))
        .collect();
    let inverse: Vec<(f64, f64)> = eff.iter().map(|&(x, y)| (y, x)).collect();

    let center = func::interpolate(&eff, peakx);
    let low = peakx - func::interpolate(&inverse, center - ONE_SIGMA_PERCENT);
    let high = func::interpolate(&inverse, center + ONE_SIGMA_PERCENT) - peakx;
    (low, high, 0.5 * (low + high))
}

/// `one_pe_err` holds the position and width errors of the standalone 1 pe
/// prefit.
fn derive(h: &Histogram1D, kind: ModelKind, n: usize, p: &[f64], last: &CurveFit, one_pe_err: (f64, f64)) -> SpeFitResult {
    let (xmin, xmax) = (h.xmin, h.xmax);
    let total = |x: f64| kind.eval(x, p);
    let one_pe_all = |x: f64| spe_one_pe_all(x, p, n);
    let bs = |x: f64| spe_backscatter(x, p, n);

    let area_ped = func::integral(|x| gaus(x, p[0], p[1], p[2]), p[1] - p[2] * 5.0, p[1] + p[2] * 5.0);
    let area_1pe = func::integral(|x| gaus(x, p[3], p[4], p[5]), xmin, xmax);
    let area_1pe_all = func::integral(one_pe_all, xmin, xmax);
    let area_bs = func::integral(bs, xmin, xmax);

    let mean = func::mean(one_pe_all, xmin, xmax);
    let variance = func::variance(one_pe_all, xmin, xmax);
    let peakx = func::maximum_x(one_pe_all, xmin, xmax);
    let peaky = one_pe_all(peakx);
    let fwhm_low = peakx - func::find_x(one_pe_all, peaky * 0.5, xmin, peakx).unwrap_or(xmin);
    let fwhm_high = func::find_x(one_pe_all, peaky * 0.5, peakx, xmax).unwrap_or(xmax) - peakx;
    let fwhm_to_sigma = 2.0 * (2.0 * 2f64.ln()).sqrt();

    let valley_x = func::minimum_x(total, p[1], p[4]);
    let valley = total(valley_x);
    let peak = func::maximum(total, p[4] - p[5], p[4] + p[5]);
    let (area_sigma_low, area_sigma_high, area_sigma) = area_sigma(one_pe_all, xmin, xmax, peakx);

    SpeFitResult {
        n_peaks: n,
        mean,
        variance,
        peakx,
        peaky,
        fwhm_low,
        fwhm_high,
        fwhm: fwhm_low + fwhm_high,
        sigma_low: fwhm_low / fwhm_to_sigma,
        sigma_high: fwhm_high / fwhm_to_sigma,
        sigma: (fwhm_low + fwhm_high) / fwhm_to_sigma,
        peak1pe_x: p[4],
        peak1pe_sigma: p[5],
        peak1pe_x_err: one_pe_err.0,
        peak1pe_sigma_err: one_pe_err.1,
        valley,
        valley_x,
        peak,
        pv: if valley != 0.0 { peak / valley } else { -1.0 },
        area_ped,
        area_1pe,
        area_1pe_all,
        area_bs,
        area_sigma_low,
        area_sigma_high,
        area_sigma,
        gain_peakx: gain(peakx),
        gain_peak1pe_x: gain(p[4]),
        gain_peak1pe_x_err: gain(one_pe_err.0),
        chi2: last.chi2,
        ndf: last.ndf as f64,
        params: p.to_vec(),
    }
}

/// One `RESULT` line of the batch SPE fit.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeBatchRow {
    pub ch: usize,
    /// 0 = fitted, 1 = missing histogram, too few entries or failed fit.
    pub flag: u8,
    pub gain: f64,
    pub peak: f64,
    pub pv: f64,
    pub fwhm_percent: f64,
    pub sigma_percent: f64,
    pub bs_ratio: f64,
    pub chi2_ndf: f64,
    pub result: Option<SpeFitResult>,
}

impl SpeBatchRow {
    fn failed(ch: usize) -> Self {
        Self {
            ch,
            flag: 1,
            gain: -1.0,
            peak: -1.0,
            pv: -1.0,
            fwhm_percent: -1.0,
            sigma_percent: -1.0,
            bs_ratio: -1.0,
            chi2_ndf: -1.0,
            result: None,
        }
    }
}

/// Fit the SPE histogram of channel `ch` (`all_chNN_hgain`) from a bundle.
pub fn fit_spe_channel(bundle: &HistogramBundle, ch: usize, opts: &SpeOptions) -> SpeBatchRow {
    let name = spe_hist_name(ch);
    let Some(hist) = bundle.get(&name) else {
        log::warn!("Histogram {name} not found, skipping");
        return SpeBatchRow::failed(ch);
    };
    if hist.entries <= MIN_SPE_ENTRIES {
        log::warn!("Channel {ch} has too few entries ({}), skipping fit", hist.entries);
        return SpeBatchRow::failed(ch);
    }
    match fit_ped_pe(hist, opts) {
        Ok(r) => SpeBatchRow {
            ch,
            flag: 0,
            gain: r.gain_peakx,
            peak: r.peakx,
            pv: r.pv,
            fwhm_percent: r.fwhm_percent(),
            sigma_percent: r.sigma_percent(),
            bs_ratio: r.bs_ratio(),
            chi2_ndf: r.chi2_ndf(),
            result: Some(r),
        },
        Err(e) => {
            log::warn!("{name}: {e}");
            SpeBatchRow::failed(ch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{spe2, spe3};

    /// Pedestal at 0 pC and 1 pe at 2.4 pC, 0.02 pC bins.
    fn spe_hist(bs_frac: f64) -> Histogram1D {
        let p = [4000.0, 0.0, 0.08, 120.0, 2.4, 0.9, bs_frac];
        let contents = (0..600)
            .map(|i| {
                let x = -1.0 + 0.02 * (i as f64 + 0.5);
                spe2(x, &p).round()
            })
            .collect();
        Histogram1D::from_contents("all_ch00_hgain", -1.0, 11.0, contents)
    }

    #[test]
    fn gain_of_one_picocoulomb() {
        assert!((gain(1.0) - 6.241_509e6).abs() < 10.0);
    }

    #[test]
    fn two_peak_fit_recovers_one_pe() {
        let h = spe_hist(0.1);
        let opts = SpeOptions { n_peaks: 2, rebin: 1, ..Default::default() };
        let r = fit_ped_pe(&h, &opts).unwrap();
        assert_eq!(r.n_peaks, 2);
        assert!((r.peak1pe_x - 2.4).abs() < 0.1, "1 pe at {}", r.peak1pe_x);
        assert!((r.peak1pe_sigma.abs() - 0.9).abs() < 0.1);
        assert!(r.pv > 1.0);
        assert!(r.area_1pe_all >= r.area_1pe);
        assert!(r.bs_ratio() > 0.0 && r.bs_ratio() < 1.0);
        assert!(r.area_sigma > 0.0);
        assert!(r.fwhm_low > 0.0 && r.fwhm_high > 0.0);
    }

    fn spe3_hist(p: &[f64; 10]) -> Histogram1D {
        let contents = (0..600)
            .map(|i| {
                let x = -1.0 + 0.02 * (i as f64 + 0.5);
                spe3(x, p).round()
            })
            .collect();
        Histogram1D::from_contents("all_ch03_hgain", -1.0, 11.0, contents)
    }

    #[test]
    fn three_peak_fit_recovers_both_photoelectron_peaks() {
        let h = spe3_hist(&[4000.0, 0.0, 0.08, 120.0, 2.4, 0.9, 15.0, 4.8, 1.27, 0.25]);
        let opts = SpeOptions { n_peaks: 3, rebin: 1, ..Default::default() };
        let r = fit_ped_pe(&h, &opts).unwrap();
        assert_eq!(r.n_peaks, 3);
        assert_eq!(r.params.len(), 10);
        assert!((r.peak1pe_x - 2.4).abs() < 0.15, "1 pe at {}", r.peak1pe_x);
        assert!((r.peak1pe_sigma.abs() - 0.9).abs() < 0.15, "1 pe sigma {}", r.peak1pe_sigma);
        assert!((r.params[7] - 4.8).abs() < 0.5, "2 pe at {}", r.params[7]);
        assert!((0.15..=0.5).contains(&r.params[9]), "bs fraction {}", r.params[9]);
        assert!(r.bs_ratio() > 0.1 && r.bs_ratio() < 0.5, "bs ratio {}", r.bs_ratio());
        assert!(r.pv > 1.0);
        assert!(r.peak1pe_x_err > 0.0 && r.peak1pe_x_err < 0.1);
        assert!((r.gain_peak1pe_x_err - gain(r.peak1pe_x_err)).abs() < 1.0);
    }

    #[test]
    fn dominant_second_peak_is_promoted_to_one_pe() {
        let mut p = Parameters::new(ModelKind::Spe3.param_names(), &[4000.0, 0.0, 0.08, 20.0, 2.4, 0.9, 200.0, 4.8, 1.27, 0.25]);
        assert!(second_peak_dominates(&p));
        promote_second_peak(&mut p);
        assert_eq!(p.value(3), 200.0);
        assert_eq!(p.value(4), 4.8);
        for i in 6..9 {
            assert!(p.is_fixed(i));
            assert_eq!(p.value(i), 0.0);
        }
        assert!(!second_peak_dominates(&p));

        p.set(3, -1.0);
        assert!(second_peak_dominates(&p));
    }

    #[test]
    fn three_peak_fit_survives_a_dominant_second_peak() {
        let h = spe3_hist(&[4000.0, 0.0, 0.08, 20.0, 2.4, 0.9, 200.0, 4.8, 1.27, 0.25]);
        let opts = SpeOptions {
            n_peaks: 3,
            rebin: 1,
            seeds: [0.0, 2.4, 4.8],
            peak_search: false,
        };
        let r = fit_ped_pe(&h, &opts).unwrap();
        assert!(r.peak1pe_x.is_finite());
        assert!(r.chi2.is_finite());
        assert!(r.gain_peakx > 0.0);
    }

    #[test]
    fn single_peak_mode_reports_sentinels() {
        let contents = (0..400)
            .map(|i| {
                let x = 400.0 + (i as f64 + 0.5);
                gaus(x, 300.0, 470.0, 12.0).round()
            })
            .collect();
        let h = Histogram1D::from_contents("all_ch01_hgain", 400.0, 800.0, contents);
        let r = fit_ped_pe(&h, &SpeOptions { n_peaks: 1, rebin: 0, ..Default::default() }).unwrap();
        assert!((r.peakx - 470.0).abs() < 0.5);
        assert!((r.sigma - 12.0).abs() < 0.5);
        assert_eq!(r.pv, -1.0);
        assert_eq!(r.area_ped, -1.0);
        assert_eq!(r.bs_ratio(), 0.0);
        assert!((r.sigma_percent() - 12.0 / 470.0 * 100.0).abs() < 0.2);
    }

    #[test]
    fn unsupported_peak_count_is_rejected() {
        let h = spe_hist(0.0);
        let err = fit_ped_pe(&h, &SpeOptions { n_peaks: 4, ..Default::default() }).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn batch_row_flags_missing_histogram() {
        let bundle = HistogramBundle::new("run.json");
        let row = fit_spe_channel(&bundle, 2, &SpeOptions::default());
        assert_eq!(row.flag, 1);
        assert_eq!(row.gain, -1.0);
        assert!(row.result.is_none());
    }
}
