//! Charge means per channel, with conversion of the ADC mean to pC.
//!
//! The high-gain ADC is used unless its histogram shows a saturation spike,
//! in which case the low-gain mean is converted instead.

use crate::domain::{
    ChargeMeanRow, Conversion, Histogram1D, HistogramBundle, HitType, MeanLabel, PedestalTable, candidate_names,
    event_hist_name,
};

/// Ratio between the last and previous filled bins above which a histogram is
/// considered saturated.
pub const SATURATION_RATIO: f64 = 5.0;

/// The last filled bin holds more than [`SATURATION_RATIO`] times the content
/// of the filled bin before it (empty bins in between are skipped).
pub fn is_saturated(hist: &Histogram1D) -> bool {
    let Some(last) = hist.last_bin_above(0.0) else {
        return false;
    };
    let Some(prev) = hist.contents[..last].iter().rposition(|&c| c > 0.0) else {
        return false;
    };
    hist.contents[last] > hist.contents[prev] * SATURATION_RATIO
}

/// Mean rows for hgain/lgain/tot plus one converted pC row per channel.
pub fn charge_means(
    bundle: &HistogramBundle,
    channels: usize,
    peds: &PedestalTable,
    conv: &Conversion,
) -> Vec<ChargeMeanRow> {
    let mut rows = Vec::new();
    for ch in 0..channels {
        for kind in HitType::CHARGE {
            if let Some(h) = bundle.get(&event_hist_name(kind, ch)).filter(|h| h.entries > 0.0) {
                rows.push(ChargeMeanRow {
                    ch,
                    label: MeanLabel::Raw(kind),
                    mean: h.mean(),
                    mean_err: h.mean_error(),
                    rms: h.std_dev(),
                    source: bundle.source.clone(),
                });
            }
        }
        if let Some(row) = converted_mean(bundle, ch, peds, conv) {
            rows.push(row);
        }
    }
    rows
}

fn converted_mean(bundle: &HistogramBundle, ch: usize, peds: &PedestalTable, conv: &Conversion) -> Option<ChargeMeanRow> {
    let saturated = bundle
        .find_any(&candidate_names(HitType::Hgain, ch))
        .map(is_saturated)
        .unwrap_or(false);
    let (label, kind, k) = if saturated {
        log::info!("ch{ch}: high gain saturated, converting low gain");
        (MeanLabel::PcByL, HitType::Lgain, conv.k_lgain)
    } else {
        (MeanLabel::PcByH, HitType::Hgain, conv.k_hgain)
    };

    let (adc_mean, adc_err, adc_rms) = bundle
        .get(&event_hist_name(kind, ch))
        .map(|h| (h.mean(), h.mean_error(), h.std_dev()))
        .unwrap_or((0.0, 0.0, 0.0));
    if k <= 0.0 || adc_mean == 0.0 {
        return None;
    }
    let (ped, ped_err) = peds.level(ch, kind);

    Some(ChargeMeanRow {
        ch,
        label,
        mean: (adc_mean - ped) * k,
        mean_err: adc_err.hypot(ped_err) * k,
        rms: adc_rms * k,
        source: bundle.source.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PedestalEntry;

    fn hist(kind: HitType, ch: usize, contents: Vec<f64>) -> Histogram1D {
        let n = contents.len() as f64;
        Histogram1D::from_contents(event_hist_name(kind, ch), 0.0, n * 100.0, contents)
    }

    #[test]
    fn saturation_spike_detection() {
        let h = Histogram1D::from_contents("h", 0.0, 5.0, vec![5.0, 10.0, 2.0, 0.0, 11.0]);
        assert!(is_saturated(&h));
        let h = Histogram1D::from_contents("h", 0.0, 5.0, vec![5.0, 10.0, 2.0, 0.0, 10.0]);
        assert!(!is_saturated(&h));
        let h = Histogram1D::from_contents("h", 0.0, 3.0, vec![0.0, 7.0, 0.0]);
        assert!(!is_saturated(&h));
    }

    #[test]
    fn converts_high_gain_when_not_saturated() {
        let mut b = HistogramBundle::new("run_1800V_eventhist.json");
        b.push(hist(HitType::Hgain, 0, vec![0.0, 10.0, 10.0, 0.0]));
        b.push(hist(HitType::Lgain, 0, vec![10.0, 0.0, 0.0, 0.0]));
        let mut peds = PedestalTable::new();
        peds.insert(PedestalEntry { ch: 0, kind: HitType::Hgain, mean: 50.0, err: 0.0 });

        let rows = charge_means(&b, 1, &peds, &Conversion::default());
        assert_eq!(rows.len(), 3);
        let pc = &rows[2];
        assert_eq!(pc.label, MeanLabel::PcByH);
        assert!((pc.mean - (200.0 - 50.0) * 0.073).abs() < 1e-9);
        assert_eq!(pc.source, "run_1800V_eventhist.json");
    }

    #[test]
    fn converts_low_gain_when_saturated() {
        let mut b = HistogramBundle::new("x");
        b.push(hist(HitType::Hgain, 1, vec![0.0, 1.0, 0.0, 50.0]));
        b.push(hist(HitType::Lgain, 1, vec![0.0, 4.0, 0.0, 0.0]));
        let rows = charge_means(&b, 2, &PedestalTable::new(), &Conversion::default());
        let pc = rows.iter().find(|r| r.label == MeanLabel::PcByL).unwrap();
        assert_eq!(pc.ch, 1);
        assert!((pc.mean - 150.0 * 0.599).abs() < 1e-9);
    }
}
