//! High/low gain selection for HV-vs-charge curves.
//!
//! `select_gain` works on the peak positions of the two-stage Gaussian fits,
//! `select_gain_mean` on the pedestal-subtracted histogram means.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::{Conversion, GaussFitSummary, HitType, PedestalTable};

/// Peak above this ADC value means the high-gain fit sits on the saturation
/// edge.
pub const HGAIN_PEAK_LIMIT: f64 = 4150.0;
/// Fitted σ below this fraction of the histogram RMS flags a saturation spike.
pub const MIN_WIDTH_RATIO: f64 = 0.3;

/// One `volt charge flag` line of `HV_vs_Charge_ch<N>.txt`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HvChargePoint {
    pub voltage: f64,
    pub charge: f64,
    /// 1 when taken from high gain, 0 from low gain.
    pub flag: u8,
}

/// A summary row `ch,type,voltage,mean,mean_err,rms` collected over runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageMeanRow {
    pub ch: usize,
    pub kind: HitType,
    pub voltage: f64,
    pub mean: f64,
    pub mean_err: f64,
    pub rms: f64,
}

/// Output line `ch,voltage,value,err` of the mean summaries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageValue {
    pub ch: usize,
    pub voltage: f64,
    pub value: f64,
    pub err: f64,
}

pub fn is_suspicious(fit: &GaussFitSummary) -> bool {
    let narrow = fit.rough_sigma > 1e-6 && fit.sigma / fit.rough_sigma < MIN_WIDTH_RATIO;
    narrow || fit.peak > HGAIN_PEAK_LIMIT
}

// Runs are grouped by voltage rounded to 1 mV.
fn voltage_key(v: f64) -> i64 {
    (v * 1000.0).round() as i64
}

/// Charge per channel and voltage, preferring high gain.
///
/// Voltages where neither usable gain exists are left out. The result is keyed
/// by channel, points ordered by voltage.
pub fn select_gain(
    fits: &[GaussFitSummary],
    peds: &PedestalTable,
    conv: &Conversion,
) -> BTreeMap<usize, Vec<HvChargePoint>> {
    let mut grouped: BTreeMap<usize, BTreeMap<i64, (f64, Option<&GaussFitSummary>, Option<&GaussFitSummary>)>> =
        BTreeMap::new();
    for fit in fits {
        let slot = grouped
            .entry(fit.ch)
            .or_default()
            .entry(voltage_key(fit.voltage))
            .or_insert((fit.voltage, None, None));
        match fit.kind {
            HitType::Hgain => slot.1 = Some(fit),
            HitType::Lgain => slot.2 = Some(fit),
            _ => {}
        }
    }

    grouped
        .into_iter()
        .map(|(ch, by_volt)| {
            let (ped_h, _) = peds.level(ch, HitType::Hgain);
            let (ped_l, _) = peds.level(ch, HitType::Lgain);
            let from_lgain = |l: &GaussFitSummary| HvChargePoint {
                voltage: l.voltage,
                charge: (l.peak - ped_l) * conv.k_lgain,
                flag: 0,
            };
            let points = by_volt
                .into_values()
                .filter_map(|(voltage, h, l)| match (h, l) {
                    (Some(h), _) if !is_suspicious(h) => Some(HvChargePoint {
                        voltage,
                        charge: (h.peak - ped_h) * conv.k_hgain,
                        flag: 1,
                    }),
                    (Some(h), Some(l)) => {
                        log::debug!("ch{ch} {voltage} V: high gain suspicious (peak {:.1}), using low gain", h.peak);
                        Some(from_lgain(l))
                    }
                    (None, Some(l)) => Some(from_lgain(l)),
                    _ => None,
                })
                .collect();
            (ch, points)
        })
        .collect()
}

/// Pedestal-subtracted means per channel and voltage.
///
/// Returns `(charge, tot)`. Charge holds every hgain row plus the lgain rows
/// whose channel/voltage has no hgain row. Both are ordered by channel then
/// voltage.
pub fn select_gain_mean(rows: &[VoltageMeanRow], peds: &PedestalTable) -> (Vec<VoltageValue>, Vec<VoltageValue>) {
    let mut by_kind: BTreeMap<HitType, BTreeMap<(usize, i64), &VoltageMeanRow>> = BTreeMap::new();
    for row in rows {
        by_kind
            .entry(row.kind)
            .or_default()
            .insert((row.ch, voltage_key(row.voltage)), row);
    }
    let subtract = |row: &VoltageMeanRow| {
        let (ped, ped_err) = peds.level(row.ch, row.kind);
        VoltageValue {
            ch: row.ch,
            voltage: row.voltage,
            value: row.mean - ped,
            err: row.mean_err.hypot(ped_err),
        }
    };

    let empty = BTreeMap::new();
    let hgain = by_kind.get(&HitType::Hgain).unwrap_or(&empty);
    let lgain = by_kind.get(&HitType::Lgain).unwrap_or(&empty);
    let mut charge: BTreeMap<(usize, i64), VoltageValue> = hgain.iter().map(|(k, r)| (*k, subtract(r))).collect();
    for (key, row) in lgain {
        charge.entry(*key).or_insert_with(|| subtract(row));
    }

    let tot = by_kind
        .get(&HitType::Tot)
        .map(|m| m.values().map(|r| subtract(r)).collect())
        .unwrap_or_default();
    (charge.into_values().collect(), tot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PedestalEntry;

    fn fit(ch: usize, kind: HitType, voltage: f64, peak: f64, sigma: f64, rough: f64) -> GaussFitSummary {
        GaussFitSummary {
            ch,
            kind,
            voltage,
            peak,
            peak_err: 1.0,
            sigma,
            sigma_err: 0.1,
            chi2_ndf: 1.0,
            rough_sigma: rough,
        }
    }

    #[test]
    fn suspicious_high_gain_falls_back_to_low_gain() {
        let fits = vec![
            fit(0, HitType::Hgain, 1500.0, 1000.0, 50.0, 60.0),
            fit(0, HitType::Lgain, 1500.0, 200.0, 10.0, 12.0),
            fit(0, HitType::Hgain, 1800.0, 4160.0, 50.0, 60.0),
            fit(0, HitType::Lgain, 1800.0, 500.0, 10.0, 12.0),
            fit(0, HitType::Hgain, 1900.0, 3000.0, 5.0, 60.0),
        ];
        let mut peds = PedestalTable::new();
        peds.insert(PedestalEntry { ch: 0, kind: HitType::Hgain, mean: 100.0, err: 0.0 });
        peds.insert(PedestalEntry { ch: 0, kind: HitType::Lgain, mean: 20.0, err: 0.0 });

        let out = select_gain(&fits, &peds, &Conversion::default());
        let pts = &out[&0];
        assert_eq!(pts.len(), 2);
        assert_eq!(pts[0].flag, 1);
        assert!((pts[0].charge - 900.0 * 0.073).abs() < 1e-9);
        assert_eq!(pts[1].flag, 0);
        assert!((pts[1].charge - 480.0 * 0.599).abs() < 1e-9);
        assert_eq!(pts[1].voltage, 1800.0);
    }

    #[test]
    fn low_gain_only_rows_are_used() {
        let fits = vec![fit(2, HitType::Lgain, 1600.0, 300.0, 10.0, 12.0)];
        let out = select_gain(&fits, &PedestalTable::new(), &Conversion::default());
        assert_eq!(out[&2], vec![HvChargePoint { voltage: 1600.0, charge: 300.0 * 0.599, flag: 0 }]);
    }

    #[test]
    fn mean_selection_prefers_high_gain_rows() {
        let row = |ch, kind, voltage, mean| VoltageMeanRow { ch, kind, voltage, mean, mean_err: 3.0, rms: 1.0 };
        let rows = vec![
            row(1, HitType::Lgain, 1500.0, 90.0),
            row(1, HitType::Hgain, 1500.0, 500.0),
            row(1, HitType::Lgain, 1400.0, 80.0),
            row(0, HitType::Tot, 1500.0, 40.0),
        ];
        let mut peds = PedestalTable::new();
        peds.insert(PedestalEntry { ch: 1, kind: HitType::Hgain, mean: 100.0, err: 4.0 });

        let (charge, tot) = select_gain_mean(&rows, &peds);
        assert_eq!(charge.len(), 2);
        assert_eq!(charge[0].voltage, 1400.0);
        assert_eq!(charge[0].value, 80.0);
        assert_eq!(charge[1].value, 400.0);
        assert!((charge[1].err - 5.0).abs() < 1e-12);
        assert_eq!(tot.len(), 1);
        assert_eq!(tot[0].ch, 0);
    }
}
