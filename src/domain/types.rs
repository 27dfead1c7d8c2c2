//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - exported to CSV/JSON
//! - reloaded later by the downstream summary commands

use std::collections::BTreeMap;

use clap::ValueEnum;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Per-hit quantity a histogram is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum HitType {
    /// High-gain ADC.
    Hgain,
    /// Low-gain ADC.
    Lgain,
    /// Time over threshold.
    Tot,
    /// Hit TDC minus trigger TDC.
    TdcDiff,
    /// Hit time minus trigger time.
    TimeDiff,
}

impl HitType {
    pub const CHARGE: [HitType; 3] = [HitType::Hgain, HitType::Lgain, HitType::Tot];

    pub fn as_str(&self) -> &'static str {
        match self {
            HitType::Hgain => "hgain",
            HitType::Lgain => "lgain",
            HitType::Tot => "tot",
            HitType::TdcDiff => "tdc_diff",
            HitType::TimeDiff => "time_diff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "hgain" => Some(HitType::Hgain),
            "lgain" => Some(HitType::Lgain),
            "tot" => Some(HitType::Tot),
            "tdc_diff" => Some(HitType::TdcDiff),
            "time_diff" => Some(HitType::TimeDiff),
            _ => None,
        }
    }
}

/// Which part of an event histogram file to analyse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    Charge,
    Time,
    All,
}

impl AnalysisMode {
    pub fn wants_charge(&self) -> bool {
        matches!(self, AnalysisMode::Charge | AnalysisMode::All)
    }

    pub fn wants_time(&self) -> bool {
        matches!(self, AnalysisMode::Time | AnalysisMode::All)
    }
}

/// How a pedestal level is extracted from a pedestal histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PedestalMethod {
    /// Gaussian fit around the maximum bin.
    Fit,
    /// Plain histogram mean and its error.
    Mean,
}

/// Peak shape used for the transit-time-spread fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TimingShape {
    /// Exponentially modified Gaussian (τ parameterisation).
    Emg,
    /// Gaussian with independent left/right widths.
    AsymGaus,
    /// Gaussian convolved with an exponential tail (erf form).
    ExpGaus,
}

/// ADC-to-charge conversion settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    /// High-gain pC per ADC count.
    pub k_hgain: f64,
    /// Low-gain pC per ADC count.
    pub k_lgain: f64,
    /// High-gain ADC value at and above which the low-gain channel is used.
    pub saturation: f64,
}

impl Default for Conversion {
    fn default() -> Self {
        Self {
            k_hgain: 0.073,
            k_lgain: 0.599,
            saturation: 4000.0,
        }
    }
}

/// Two-stage Gaussian fit of a charge histogram (one `_gausfit.txt` row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussFitSummary {
    pub ch: usize,
    pub kind: HitType,
    pub voltage: f64,
    pub peak: f64,
    pub peak_err: f64,
    pub sigma: f64,
    pub sigma_err: f64,
    pub chi2_ndf: f64,
    pub rough_sigma: f64,
}

/// Pedestal level for one channel and ADC type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PedestalEntry {
    pub ch: usize,
    pub kind: HitType,
    pub mean: f64,
    pub err: f64,
}

/// Pedestal levels keyed by channel and ADC type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PedestalTable {
    entries: BTreeMap<(usize, HitType), PedestalEntry>,
}

impl PedestalTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the level for `(entry.ch, entry.kind)`.
    pub fn insert(&mut self, entry: PedestalEntry) {
        self.entries.insert((entry.ch, entry.kind), entry);
    }

    pub fn get(&self, ch: usize, kind: HitType) -> Option<&PedestalEntry> {
        self.entries.get(&(ch, kind))
    }

    /// `(mean, err)` for the channel, `(0, 0)` when unknown.
    pub fn level(&self, ch: usize, kind: HitType) -> (f64, f64) {
        self.get(ch, kind).map(|e| (e.mean, e.err)).unwrap_or((0.0, 0.0))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PedestalEntry> {
        self.entries.values()
    }
}

/// Result of the transit-time-spread fit. All zeros (ndf 0) means "no fit".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsFitResult {
    pub tts: f64,
    pub sigma: f64,
    pub fwhm: f64,
    pub peak: f64,
    pub chi2: f64,
    pub ndf: i64,
    pub tau: f64,
    /// Final parameters of the peak shape, for drawing.
    pub params: [f64; 4],
}

/// Transit-time-spread fit of one timing histogram (one `_ttsfit.txt` row).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TtsSummary {
    pub ch: usize,
    pub kind: HitType,
    pub voltage: f64,
    pub fit: TtsFitResult,
}

/// Maximum-bin position of one charge histogram (one `_peak.txt` row).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakPosition {
    pub ch: usize,
    pub kind: HitType,
    pub voltage: f64,
    pub peak: f64,
}

/// One row of the EMG time-fit table (`_timefit.txt`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeFitRow {
    pub ch: usize,
    pub peak: f64,
    pub peak_err: f64,
    pub fwhm: f64,
    pub mu: f64,
    pub gamma: f64,
    pub sigma: f64,
    pub lambda: f64,
    pub fwhm_err: f64,
    pub chi2: f64,
    pub ndf: i64,
    pub mean: f64,
    pub mean_err: f64,
    pub rms: f64,
    pub rms_err: f64,
}

impl TimeFitRow {
    /// Value written for quantities that could not be fitted.
    pub const NO_FIT: f64 = -9999.0;

    pub fn fitted(&self) -> bool {
        self.ndf > 0
    }
}

/// Label of a charge-mean row: a raw histogram type, or a converted pC value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeanLabel {
    Raw(HitType),
    /// Converted from high gain.
    PcByH,
    /// Converted from low gain (high gain saturated).
    PcByL,
}

impl MeanLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeanLabel::Raw(t) => t.as_str(),
            MeanLabel::PcByH => "pc_by_h",
            MeanLabel::PcByL => "pc_by_l",
        }
    }
}

/// One row of the charge-mean table (`_mean.txt`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeMeanRow {
    pub ch: usize,
    pub label: MeanLabel,
    pub mean: f64,
    pub mean_err: f64,
    pub rms: f64,
    pub source: String,
}

/// Derived quantities of a pedestal + single-photoelectron fit.
///
/// Fields that a 1-peak fit cannot determine are set to `-1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeFitResult {
    pub n_peaks: usize,
    pub mean: f64,
    pub variance: f64,
    pub peakx: f64,
    pub peaky: f64,
    pub fwhm_low: f64,
    pub fwhm_high: f64,
    pub fwhm: f64,
    pub sigma_low: f64,
    pub sigma_high: f64,
    pub sigma: f64,
    pub peak1pe_x: f64,
    pub peak1pe_sigma: f64,
    pub peak1pe_x_err: f64,
    pub peak1pe_sigma_err: f64,
    pub valley: f64,
    pub valley_x: f64,
    pub peak: f64,
    pub pv: f64,
    pub area_ped: f64,
    pub area_1pe: f64,
    pub area_1pe_all: f64,
    pub area_bs: f64,
    pub area_sigma_low: f64,
    pub area_sigma_high: f64,
    pub area_sigma: f64,
    pub gain_peakx: f64,
    pub gain_peak1pe_x: f64,
    pub gain_peak1pe_x_err: f64,
    pub chi2: f64,
    pub ndf: f64,
    /// Final fitted parameter vector of the total model.
    pub params: Vec<f64>,
}

impl SpeFitResult {
    pub fn fwhm_percent(&self) -> f64 {
        if self.peakx != 0.0 { self.fwhm / self.peakx * 100.0 } else { -1.0 }
    }

    /// 1 pe resolution in percent. For 1-peak fits this is the Gaussian width
    /// relative to the fitted peak.
    pub fn sigma_percent(&self) -> f64 {
        if self.n_peaks == 1 {
            if self.peakx != 0.0 { self.sigma / self.peakx * 100.0 } else { -1.0 }
        } else if self.peak1pe_x != 0.0 {
            self.peak1pe_sigma / self.peak1pe_x * 100.0
        } else {
            0.0
        }
    }

    pub fn bs_ratio(&self) -> f64 {
        if self.area_1pe_all > 0.0 { self.area_bs / self.area_1pe_all } else { 0.0 }
    }

    pub fn chi2_ndf(&self) -> f64 {
        if self.ndf != 0.0 { self.chi2 / self.ndf } else { 0.0 }
    }

    /// Share of 1 pe events among pedestal + 1 pe, in percent.
    pub fn occupancy(&self) -> f64 {
        let total = self.area_1pe_all + self.area_ped;
        if total != 0.0 { self.area_1pe_all / total * 100.0 } else { -1.0 }
    }
}

/// Power-law fit `charge = b · HV^a`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HvGainFit {
    pub ch: i64,
    pub b: f64,
    pub b_err: f64,
    pub a: f64,
    pub a_err: f64,
    pub chi2: f64,
    pub ndf: i64,
}

/// Reconstructed light-source position and emission time for one event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightSourceFit {
    pub event_id: i64,
    pub nhits: usize,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub t: f64,
    pub err_x: f64,
    pub err_y: f64,
    pub err_z: f64,
    pub err_t: f64,
    /// Light-yield scale of the angular acceptance term.
    pub a: f64,
    /// Isotropic light-yield term.
    pub b: f64,
    pub chi2: f64,
    pub ndf: i64,
    pub status: i32,
}

impl LightSourceFit {
    /// Minimizer converged (or hit its call limit) on at least one hit.
    pub fn succeeded(&self) -> bool {
        self.nhits >= 1 && (self.status == 0 || self.status == 4)
    }
}

/// Kind of a raw hit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawHitKind {
    Trigger,
    Normal,
}

/// One row of the raw event table (`event,kind,channel,hgain,lgain,tot,tdc,time`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawHit {
    pub event: i64,
    pub kind: RawHitKind,
    pub channel: usize,
    pub hgain: f64,
    pub lgain: f64,
    pub tot: f64,
    pub tdc: f64,
    pub time: f64,
}

/// A hit relative to its event trigger (`processed_hits` row).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessedHit {
    #[serde(rename = "eventID")]
    pub event_id: i64,
    pub ch: usize,
    pub hgain: f64,
    pub lgain: f64,
    pub tot: f64,
    pub tdc_diff: f64,
    pub time_diff: f64,
}

/// A converted hit ready for the light-source fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PmtHit {
    pub event_id: i64,
    pub ch: usize,
    /// Hit time in ns.
    pub time: f64,
    /// Charge in pC, never negative.
    pub charge: f64,
    pub pos: Vector3<f64>,
    pub dir: Vector3<f64>,
}

/// One PMT hit of a multi-PMT module event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MpmtHit {
    pub event: i64,
    pub mpmt_id: i64,
    pub pmt_id: i64,
    pub pos: Vector3<f64>,
    /// Detected light.
    pub l: f64,
    pub t: f64,
    pub ori: Vector3<f64>,
    pub center: Vector3<f64>,
}

/// Direction/time summary of one multi-PMT module, input to the
/// multi-module light-source fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MpmtSensor {
    pub id: i64,
    pub pos: Vector3<f64>,
    pub dir: Vector3<f64>,
    pub time: f64,
    pub sigma_sin_theta: f64,
    pub sigma_time: f64,
}

/// Multi-module light-source fit result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MpmtFitResult {
    pub pos: Vector3<f64>,
    pub t_light: f64,
    pub err: Vector3<f64>,
    pub t_error: f64,
    pub chi2: f64,
    pub dir_chi2: f64,
    pub time_chi2: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_type_round_trips_through_str() {
        for t in [HitType::Hgain, HitType::Lgain, HitType::Tot, HitType::TdcDiff, HitType::TimeDiff] {
            assert_eq!(HitType::parse(t.as_str()), Some(t));
        }
        assert_eq!(HitType::parse("pc_by_h"), None);
    }

    #[test]
    fn pedestal_table_defaults_to_zero() {
        let mut t = PedestalTable::new();
        t.insert(PedestalEntry { ch: 1, kind: HitType::Hgain, mean: 100.0, err: 0.5 });
        assert_eq!(t.level(1, HitType::Hgain), (100.0, 0.5));
        assert_eq!(t.level(1, HitType::Lgain), (0.0, 0.0));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn spe_ratios_guard_zero_denominators() {
        let r = SpeFitResult {
            n_peaks: 2,
            mean: 0.0,
            variance: 0.0,
            peakx: 0.0,
            peaky: 0.0,
            fwhm_low: 0.0,
            fwhm_high: 0.0,
            fwhm: 1.0,
            sigma_low: 0.0,
            sigma_high: 0.0,
            sigma: 0.0,
            peak1pe_x: 0.0,
            peak1pe_sigma: 1.0,
            peak1pe_x_err: 0.0,
            peak1pe_sigma_err: 0.0,
            valley: 0.0,
            valley_x: 0.0,
            peak: 0.0,
            pv: -1.0,
            area_ped: 0.0,
            area_1pe: 0.0,
            area_1pe_all: 0.0,
            area_bs: 1.0,
            area_sigma_low: 0.0,
            area_sigma_high: 0.0,
            area_sigma: 0.0,
            gain_peakx: 0.0,
            gain_peak1pe_x: 0.0,
            gain_peak1pe_x_err: 0.0,
            chi2: 3.0,
            ndf: 0.0,
            params: vec![],
        };
        assert_eq!(r.fwhm_percent(), -1.0);
        assert_eq!(r.sigma_percent(), 0.0);
        assert_eq!(r.bs_ratio(), 0.0);
        assert_eq!(r.chi2_ndf(), 0.0);
        assert_eq!(r.occupancy(), -1.0);
    }
}
