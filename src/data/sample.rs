//! Synthetic calibration data.
//!
//! Every generator takes an explicit seed so the same call always produces
//! the same histogram or table. Shapes follow the fitted models:
//! - charge: Gaussian pedestal, Gaussian n-pe peaks, flat backscatter
//! - timing: Gaussian jitter plus an exponential tail
//! - reconstruction: hits of a point source seen by the 4-PMT stand

use nalgebra::Vector3;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Exp, Normal, Poisson};

use crate::domain::{
    Conversion, Histogram1D, HistogramBundle, HitType, ProcessedHit, RawHit, RawHitKind, event_hist_name,
    pedestal_hist_name, spe_hist_name,
};
use crate::error::AppError;
use crate::reco::{C_LIGHT, PMT_POSITIONS, SIGMA_TIME, TIME_CORRECTION, expected_charge, pmt_placement};

/// Channel of the trigger hit in generated raw events.
pub const TRIGGER_CHANNEL: usize = 15;

fn normal(mean: f64, sigma: f64) -> Result<Normal<f64>, AppError> {
    Normal::new(mean, sigma).map_err(|e| AppError::new(2, format!("Invalid normal distribution ({mean}, {sigma}): {e}")))
}

/// Low-light charge spectrum settings, in ADC counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeConfig {
    pub entries: usize,
    pub pedestal: f64,
    pub pedestal_sigma: f64,
    /// 1 pe peak position.
    pub one_pe: f64,
    pub one_pe_sigma: f64,
    /// Mean number of photoelectrons per event.
    pub occupancy: f64,
    /// Share of photoelectron signals spread flat between pedestal and peak.
    pub backscatter: f64,
    pub nbins: usize,
    pub range: (f64, f64),
}

impl Default for SpeConfig {
    fn default() -> Self {
        Self {
            entries: 50_000,
            pedestal: 440.0,
            pedestal_sigma: 3.0,
            one_pe: 470.0,
            one_pe_sigma: 8.0,
            occupancy: 0.1,
            backscatter: 0.05,
            nbins: 400,
            range: (400.0, 800.0),
        }
    }
}

/// Pedestal + SPE charge histogram.
pub fn spe_histogram(name: &str, cfg: &SpeConfig, seed: u64) -> Result<Histogram1D, AppError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let ped = normal(cfg.pedestal, cfg.pedestal_sigma)?;
    let unit = normal(0.0, 1.0)?;
    let poisson = Poisson::new(cfg.occupancy.max(1e-12))
        .map_err(|e| AppError::new(2, format!("Invalid occupancy {}: {e}", cfg.occupancy)))?;
    let gain = cfg.one_pe - cfg.pedestal;

    let mut h = Histogram1D::new(name, "Synthetic SPE spectrum", cfg.nbins, cfg.range.0, cfg.range.1);
    for _ in 0..cfg.entries {
        let n_pe = poisson.sample(&mut rng) as u32;
        let mut x = ped.sample(&mut rng);
        for _ in 0..n_pe {
            x += if rng.gen_bool(cfg.backscatter.clamp(0.0, 1.0)) {
                rng.gen_range(0.0..gain)
            } else {
                gain + cfg.one_pe_sigma * unit.sample(&mut rng)
            };
        }
        h.fill(x);
    }
    Ok(h)
}

/// Timing histogram: Gaussian `(mu, sigma)` convolved with an exponential
/// tail of mean `tau`.
pub fn emg_histogram(
    name: &str,
    (mu, sigma, tau): (f64, f64, f64),
    entries: usize,
    nbins: usize,
    range: (f64, f64),
    seed: u64,
) -> Result<Histogram1D, AppError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let jitter = normal(mu, sigma)?;
    let tail = Exp::new(1.0 / tau).map_err(|e| AppError::new(2, format!("Invalid tail constant {tau}: {e}")))?;
    let mut h = Histogram1D::new(name, "Synthetic timing", nbins, range.0, range.1);
    for _ in 0..entries {
        h.fill(jitter.sample(&mut rng) + tail.sample(&mut rng));
    }
    Ok(h)
}

/// Gaussian histogram, used for pedestals and single charge peaks.
pub fn gaussian_histogram(
    name: &str,
    (mean, sigma): (f64, f64),
    entries: usize,
    nbins: usize,
    range: (f64, f64),
    seed: u64,
) -> Result<Histogram1D, AppError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dist = normal(mean, sigma)?;
    let mut h = Histogram1D::new(name, "Synthetic peak", nbins, range.0, range.1);
    for _ in 0..entries {
        h.fill(dist.sample(&mut rng));
    }
    Ok(h)
}

/// `all_chNN_hgain` histograms for channels `0..channels`, the gain rising
/// slightly with the channel number.
pub fn spe_bundle(channels: usize, seed: u64) -> Result<HistogramBundle, AppError> {
    let mut bundle = HistogramBundle::new(format!("simulate spe seed={seed}"));
    for ch in 0..channels {
        let cfg = SpeConfig {
            one_pe: 470.0 + 2.0 * ch as f64,
            ..SpeConfig::default()
        };
        bundle.push(spe_histogram(&spe_hist_name(ch), &cfg, seed.wrapping_add(ch as u64))?);
    }
    Ok(bundle)
}

/// `ped_chNN_hgain` / `ped_chNN_lgain` histograms.
pub fn pedestal_bundle(channels: usize, seed: u64) -> Result<HistogramBundle, AppError> {
    let mut bundle = HistogramBundle::new(format!("simulate pedestal seed={seed}"));
    for ch in 0..channels {
        let s = seed.wrapping_add(2 * ch as u64);
        let hgain = 100.0 + ch as f64;
        bundle.push(gaussian_histogram(&pedestal_hist_name(ch, HitType::Hgain), (hgain, 2.0), 20_000, 200, (50.0, 150.0), s)?);
        bundle.push(gaussian_histogram(&pedestal_hist_name(ch, HitType::Lgain), (20.0, 1.0), 20_000, 100, (0.0, 40.0), s + 1)?);
    }
    Ok(bundle)
}

/// Event histograms `h_<type>_chN` as written by `hist`, for the charge and
/// timing commands.
pub fn eventhist_bundle(channels: usize, seed: u64) -> Result<HistogramBundle, AppError> {
    let mut bundle = HistogramBundle::new(format!("simulate eventhist seed={seed}"));
    for ch in 0..channels {
        let s = seed.wrapping_add(10 * ch as u64);
        let n = 20_000;
        let hgain = 1000.0 + 100.0 * ch as f64;
        bundle.push(gaussian_histogram(&event_hist_name(HitType::Hgain, ch), (hgain, 60.0), n, 400, (0.0, 4000.0), s)?);
        bundle.push(gaussian_histogram(&event_hist_name(HitType::Lgain, ch), (hgain / 8.0, 8.0), n, 400, (0.0, 500.0), s + 1)?);
        bundle.push(gaussian_histogram(&event_hist_name(HitType::Tot, ch), (40.0, 3.0), n, 200, (0.0, 100.0), s + 2)?);
        bundle.push(emg_histogram(&event_hist_name(HitType::TimeDiff, ch), (200.0, 1.0, 1.5), n, 400, (190.0, 230.0), s + 3)?);
    }
    Ok(bundle)
}

/// Raw event table: one trigger hit and one hit per channel per event.
pub fn raw_events(channels: usize, events: usize, seed: u64) -> Result<Vec<RawHit>, AppError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let adc = normal(1000.0, 60.0)?;
    let delay = normal(2.0e-7, 2.0e-9)?;
    let mut rows = Vec::with_capacity(events * (channels + 1));
    for event in 0..events {
        let t0 = 1.0e-3 * event as f64;
        let tdc0 = 1.0e6 * event as f64;
        rows.push(RawHit {
            event: event as i64,
            kind: RawHitKind::Trigger,
            channel: TRIGGER_CHANNEL,
            hgain: 0.0,
            lgain: 0.0,
            tot: 0.0,
            tdc: tdc0,
            time: t0,
        });
        for ch in 0..channels {
            let hgain = adc.sample(&mut rng);
            let dt = delay.sample(&mut rng);
            rows.push(RawHit {
                event: event as i64,
                kind: RawHitKind::Normal,
                channel: ch,
                hgain,
                lgain: hgain / 8.0,
                tot: hgain / 25.0,
                tdc: tdc0 + dt * 1e9,
                time: t0 + dt,
            });
        }
    }
    Ok(rows)
}

/// Processed hits of a point source at `source` emitting at `t0`, seen by the
/// 4-PMT stand with zero pedestals and the given conversion.
///
/// `yield_a` is the light-yield scale of the charge model. Charges get a
/// √q smearing, times a Gaussian jitter of the stand resolution.
pub fn light_source_hits(
    source: Vector3<f64>,
    t0: f64,
    yield_a: f64,
    events: usize,
    conv: &Conversion,
    seed: u64,
) -> Result<Vec<ProcessedHit>, AppError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let unit = normal(0.0, 1.0)?;
    let mut hits = Vec::with_capacity(events * PMT_POSITIONS.len());
    for event in 0..events {
        for ch in 0..PMT_POSITIONS.len() {
            let Some((pos, dir)) = pmt_placement(ch) else {
                continue;
            };
            let to_src = source - pos;
            let d = to_src.norm();
            let cos = to_src.dot(&dir) / d.max(1e-9);
            let q = expected_charge(yield_a, 0.0, d, cos);
            let q = (q + q.sqrt() * unit.sample(&mut rng)).max(0.0);
            let t = t0 + d / C_LIGHT + TIME_CORRECTION[ch] + SIGMA_TIME * unit.sample(&mut rng);
            let hgain = q / conv.k_hgain;
            hits.push(ProcessedHit {
                event_id: event as i64,
                ch,
                hgain,
                lgain: q / conv.k_lgain,
                tot: 0.0,
                tdc_diff: t,
                time_diff: t,
            });
        }
    }
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::{SpeOptions, fit_charge_two_stage, fit_ped_pe, fit_time_emg};

    #[test]
    fn generators_are_reproducible() {
        let a = spe_histogram("a", &SpeConfig::default(), 7).unwrap();
        let b = spe_histogram("a", &SpeConfig::default(), 7).unwrap();
        let c = spe_histogram("a", &SpeConfig::default(), 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.contents, c.contents);
        assert_eq!(a.entries, 50_000.0);
    }

    #[test]
    fn generated_charge_peak_is_recovered() {
        let h = gaussian_histogram("h_hgain_ch0", (1200.0, 60.0), 20_000, 400, (0.0, 4000.0), 42).unwrap();
        let fit = fit_charge_two_stage(&h, 0, HitType::Hgain, 1500.0).unwrap();
        assert!((fit.peak - 1200.0).abs() < 3.0, "peak {}", fit.peak);
        assert!((fit.sigma - 60.0).abs() < 6.0, "sigma {}", fit.sigma);
    }

    #[test]
    fn generated_timing_fits_as_emg() {
        let h = emg_histogram("h_time_diff_ch0", (200.0, 1.0, 1.5), 20_000, 400, (190.0, 230.0), 3).unwrap();
        let row = fit_time_emg(&h, 0).unwrap();
        assert!(row.fitted());
        assert!((row.mu - 200.0).abs() < 0.3, "mu {}", row.mu);
        assert!((1.0 / row.lambda - 1.5).abs() < 0.3, "tau {}", 1.0 / row.lambda);
    }

    #[test]
    fn generated_spe_spectrum_has_a_single_pe_peak() {
        let h = spe_histogram("all_ch00_hgain", &SpeConfig::default(), 11).unwrap();
        let r = fit_ped_pe(&h, &SpeOptions { n_peaks: 2, ..SpeOptions::default() }).unwrap();
        assert!((r.peak1pe_x - 470.0).abs() < 8.0, "1pe at {}", r.peak1pe_x);
        assert!(r.pv > 1.0);
    }

    #[test]
    fn raw_events_carry_one_trigger_each() {
        let rows = raw_events(3, 5, 1).unwrap();
        assert_eq!(rows.len(), 20);
        assert_eq!(rows.iter().filter(|r| r.kind == RawHitKind::Trigger).count(), 5);
    }

    #[test]
    fn light_source_hits_follow_the_stand_layout() {
        let hits = light_source_hits(Vector3::new(0.0, 0.0, 150.0), 5.0, 4.0e6, 2, &Conversion::default(), 9).unwrap();
        assert_eq!(hits.len(), 8);
        assert_eq!(hits.iter().map(|h| h.ch).collect::<Vec<_>>(), vec![0, 1, 2, 3, 0, 1, 2, 3]);
        assert!(hits.iter().all(|h| h.hgain > 0.0 && h.time_diff > 200.0));
    }
}
