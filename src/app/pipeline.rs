//! Per-bundle analysis steps shared by the subcommands.
//!
//! Each step looks up the channel histograms of one loaded bundle, runs the
//! independent channel/type fits in parallel and returns rows sorted by
//! channel and type. When plots are requested a [`FitPlot`] is collected per
//! fitted histogram; writing them is left to the caller.

use rayon::prelude::*;

use crate::domain::{
    GaussFitSummary, Histogram1D, HistogramBundle, HitType, PeakPosition, PedestalEntry, PedestalMethod,
    TimeFitRow, TimingShape, TtsSummary, candidate_names, pedestal_hist_name,
};
use crate::fit::{
    MIN_CHARGE_ENTRIES, SpeBatchRow, SpeOptions, fit_charge_two_stage, fit_pedestal_curve, fit_spe_channel,
    fit_time_emg, pedestal_mean, perform_tts_fit, rough_peak, shape_model,
};
use crate::models::{ModelKind, gaus};
use crate::plot::{fit_curve_points, sample_curve};

/// Points drawn per fitted curve.
const CURVE_POINTS: usize = 500;

/// A fitted histogram and the curve to draw over it.
#[derive(Debug, Clone)]
pub struct FitPlot {
    pub hist: Histogram1D,
    pub curve: Vec<(f64, f64)>,
    pub info: Vec<String>,
}

/// Rows of one step plus the plots gathered along the way.
#[derive(Debug, Clone)]
pub struct StepOutput<T> {
    pub rows: Vec<T>,
    pub plots: Vec<FitPlot>,
}

impl<T> StepOutput<T> {
    fn from_results(results: Vec<(T, Option<FitPlot>)>) -> Self {
        let mut rows = Vec::with_capacity(results.len());
        let mut plots = Vec::new();
        for (row, plot) in results {
            rows.push(row);
            plots.extend(plot);
        }
        Self { rows, plots }
    }
}

fn jobs(channels: usize, kinds: &[HitType]) -> Vec<(usize, HitType)> {
    (0..channels).flat_map(|ch| kinds.iter().map(move |&k| (ch, k))).collect()
}

fn lookup(bundle: &HistogramBundle, kind: HitType, ch: usize) -> Option<&Histogram1D> {
    bundle.find_any(&candidate_names(kind, ch))
}

/// Gaussian overlay at the fitted peak and width, scaled to the bin content
/// at the peak.
fn gaussian_overlay(hist: &Histogram1D, mean: f64, sigma: f64, nsigma: f64) -> Vec<(f64, f64)> {
    let amp = hist.bin_content_at(mean);
    let lo = hist.xmin.max(mean - nsigma * sigma);
    let hi = hist.xmax.min(mean + nsigma * sigma);
    sample_curve(|x| gaus(x, amp, mean, sigma), lo, hi, CURVE_POINTS)
}

/// Pedestal levels of the `ped_chNN_<type>` histograms for hgain, lgain and tot.
///
/// Missing histograms and histograms below the entry threshold are skipped.
pub fn pedestal_step(bundle: &HistogramBundle, channels: usize, method: PedestalMethod, plots: bool) -> StepOutput<PedestalEntry> {
    let mut results: Vec<(PedestalEntry, Option<FitPlot>)> = jobs(channels, &HitType::CHARGE)
        .into_par_iter()
        .filter_map(|(ch, kind)| {
            let name = pedestal_hist_name(ch, kind);
            let Some(hist) = bundle.get(&name) else {
                log::debug!("{name} not found");
                return None;
            };
            let outcome = match method {
                PedestalMethod::Fit => fit_pedestal_curve(hist, ch, kind).map(|(entry, fit)| {
                    let plot = plots.then(|| FitPlot {
                        hist: hist.clone(),
                        curve: fit_curve_points(&fit, CURVE_POINTS),
                        info: vec![format!("pedestal = {:.3} +/- {:.3}", entry.mean, entry.err)],
                    });
                    (entry, plot)
                }),
                PedestalMethod::Mean => pedestal_mean(hist, ch, kind).map(|entry| (entry, None)),
            };
            match outcome {
                Ok(r) => Some(r),
                Err(e) => {
                    log::info!("skipping {name}: {e}");
                    None
                }
            }
        })
        .collect();
    results.sort_by_key(|(e, _)| (e.ch, e.kind));
    StepOutput::from_results(results)
}

/// Two-stage Gaussian fits of the hgain, lgain and tot histograms.
pub fn gausfit_charge_step(bundle: &HistogramBundle, channels: usize, voltage: f64, plots: bool) -> StepOutput<GaussFitSummary> {
    let mut results: Vec<(GaussFitSummary, Option<FitPlot>)> = jobs(channels, &HitType::CHARGE)
        .into_par_iter()
        .filter_map(|(ch, kind)| {
            let hist = lookup(bundle, kind, ch)?;
            match fit_charge_two_stage(hist, ch, kind, voltage) {
                Ok(fit) => {
                    let plot = plots.then(|| FitPlot {
                        hist: hist.clone(),
                        curve: gaussian_overlay(hist, fit.peak, fit.sigma, 2.0),
                        info: vec![
                            format!("peak = {:.3} +/- {:.3}", fit.peak, fit.peak_err),
                            format!("sigma = {:.3} +/- {:.3}", fit.sigma, fit.sigma_err),
                            format!("chi2/ndf = {:.3}", fit.chi2_ndf),
                        ],
                    });
                    Some((fit, plot))
                }
                Err(e) => {
                    log::info!("skipping {}: {e}", hist.name);
                    None
                }
            }
        })
        .collect();
    results.sort_by_key(|(f, _)| (f.ch, f.kind));
    StepOutput::from_results(results)
}

/// TTS fits of the `time_diff` histograms holding at least
/// [`MIN_CHARGE_ENTRIES`] entries. Failed fits stay in the rows with ndf 0.
pub fn gausfit_time_step(
    bundle: &HistogramBundle,
    channels: usize,
    voltage: f64,
    shape: TimingShape,
    plots: bool,
) -> StepOutput<TtsSummary> {
    let mut results: Vec<(TtsSummary, Option<FitPlot>)> = (0..channels)
        .into_par_iter()
        .filter_map(|ch| {
            let kind = HitType::TimeDiff;
            let hist = lookup(bundle, kind, ch).filter(|h| h.entries >= MIN_CHARGE_ENTRIES)?;
            let fit = perform_tts_fit(hist, shape);
            let plot = (plots && fit.ndf > 0).then(|| {
                let model = shape_model(shape);
                FitPlot {
                    hist: hist.clone(),
                    curve: sample_curve(|x| model.eval(x, &fit.params), hist.xmin, hist.xmax, CURVE_POINTS),
                    info: vec![
                        format!("TTS = {:.4}", fit.tts),
                        format!("FWHM = {:.4}", fit.fwhm),
                        format!("peak = {:.4}", fit.peak),
                    ],
                }
            });
            Some((TtsSummary { ch, kind, voltage, fit }, plot))
        })
        .collect();
    results.sort_by_key(|(t, _)| t.ch);
    StepOutput::from_results(results)
}

/// Maximum-bin position of every non-empty charge histogram.
pub fn peak_step(bundle: &HistogramBundle, channels: usize, voltage: f64) -> Vec<PeakPosition> {
    jobs(channels, &HitType::CHARGE)
        .into_iter()
        .filter_map(|(ch, kind)| {
            let hist = lookup(bundle, kind, ch).filter(|h| h.entries > 0.0)?;
            Some(PeakPosition {
                ch,
                kind,
                voltage,
                peak: rough_peak(hist).0,
            })
        })
        .collect()
}

/// EMG fits of the `time_diff` histograms for the time table.
pub fn mean_time_step(bundle: &HistogramBundle, channels: usize, plots: bool) -> StepOutput<TimeFitRow> {
    let mut results: Vec<(TimeFitRow, Option<FitPlot>)> = (0..channels)
        .into_par_iter()
        .filter_map(|ch| {
            let hist = lookup(bundle, HitType::TimeDiff, ch)?;
            let row = fit_time_emg(hist, ch)?;
            let plot = (plots && row.fitted()).then(|| {
                let p = [row.mu, row.gamma, row.sigma, row.lambda];
                FitPlot {
                    hist: hist.clone(),
                    curve: sample_curve(|x| ModelKind::EmgLambda.eval(x, &p), hist.xmin, hist.xmax, CURVE_POINTS),
                    info: vec![
                        format!("peak = {:.4} +/- {:.4}", row.peak, row.peak_err),
                        format!("FWHM = {:.4} +/- {:.4}", row.fwhm, row.fwhm_err),
                    ],
                }
            });
            Some((row, plot))
        })
        .collect();
    results.sort_by_key(|(r, _)| r.ch);
    StepOutput::from_results(results)
}

/// SPE fits of `all_chNN_hgain` for channels `0..channels`, one row each.
pub fn spe_step(bundle: &HistogramBundle, channels: usize, opts: &SpeOptions, plots: bool) -> StepOutput<SpeBatchRow> {
    let mut results: Vec<(SpeBatchRow, Option<FitPlot>)> = (0..channels)
        .into_par_iter()
        .map(|ch| {
            let row = fit_spe_channel(bundle, ch, opts);
            let plot = match (&row.result, plots) {
                (Some(r), true) => bundle.get(&crate::domain::spe_hist_name(ch)).map(|hist| {
                    let (kind, scale) = match r.n_peaks {
                        1 => (ModelKind::Gaussian, 1.0),
                        2 => (ModelKind::Spe2, opts.rebin.max(1) as f64),
                        _ => (ModelKind::Spe3, opts.rebin.max(1) as f64),
                    };
                    FitPlot {
                        hist: hist.clone(),
                        curve: sample_curve(|x| kind.eval(x, &r.params) / scale, hist.xmin, hist.xmax, CURVE_POINTS),
                        info: vec![
                            format!("gain = {:.3e}", row.gain),
                            format!("P/V = {:.3}", row.pv),
                            format!("chi2/ndf = {:.3}", row.chi2_ndf),
                        ],
                    }
                }),
                _ => None,
            };
            (row, plot)
        })
        .collect();
    results.sort_by_key(|(r, _)| r.ch);
    StepOutput::from_results(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{eventhist_bundle, pedestal_bundle, spe_bundle};

    #[test]
    fn pedestal_step_orders_rows_and_collects_plots() {
        let bundle = pedestal_bundle(2, 7).unwrap();
        let out = pedestal_step(&bundle, 3, PedestalMethod::Fit, true);
        assert_eq!(out.rows.len(), 4);
        let keys: Vec<(usize, HitType)> = out.rows.iter().map(|e| (e.ch, e.kind)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(out.plots.len(), 4);

        let means = pedestal_step(&bundle, 2, PedestalMethod::Mean, true);
        assert_eq!(means.rows.len(), 4);
        assert!(means.plots.is_empty());
    }

    #[test]
    fn eventhist_steps_cover_every_channel() {
        let bundle = eventhist_bundle(2, 11).unwrap();
        let charge = gausfit_charge_step(&bundle, 2, 1800.0, false);
        assert!(charge.rows.iter().all(|r| r.voltage == 1800.0));
        assert!(charge.rows.iter().any(|r| r.kind == HitType::Hgain));

        let tts = gausfit_time_step(&bundle, 2, 1800.0, TimingShape::Emg, true);
        assert_eq!(tts.rows.len(), 2);
        assert!(tts.rows.iter().all(|r| r.fit.ndf > 0));
        assert_eq!(tts.plots.len(), 2);

        let peaks = peak_step(&bundle, 2, 1800.0);
        assert_eq!(peaks.len(), 6);

        let times = mean_time_step(&bundle, 2, false);
        assert_eq!(times.rows.iter().map(|r| r.ch).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn spe_step_flags_missing_channels() {
        let bundle = spe_bundle(1, 5).unwrap();
        let out = spe_step(&bundle, 2, &SpeOptions::default(), false);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.rows[0].flag, 0);
        assert_eq!(out.rows[1].flag, 1);
    }
}
