//! Uniformly binned 1-D histograms and named histogram bundles.
//!
//! A `HistogramBundle` is the on-disk unit of analysis: one JSON file per run
//! (e.g. `run_1800V_eventhist.json`) holding every per-channel histogram by
//! name. Statistics (`mean`, `std_dev`, ...) are computed from in-range bin
//! centers weighted by content, so they are reproducible from the file alone.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::domain::HitType;

/// A uniformly binned 1-D histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram1D {
    pub name: String,
    #[serde(default)]
    pub title: String,
    pub nbins: usize,
    pub xmin: f64,
    pub xmax: f64,
    /// In-range bin contents, `contents.len() == nbins`.
    pub contents: Vec<f64>,
    #[serde(default)]
    pub underflow: f64,
    #[serde(default)]
    pub overflow: f64,
    /// Number of fills (including under/overflow).
    #[serde(default)]
    pub entries: f64,
    /// Sum of squared weights per bin. Empty means unit weights.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sumw2: Vec<f64>,
}

impl Histogram1D {
    pub fn new(name: impl Into<String>, title: impl Into<String>, nbins: usize, xmin: f64, xmax: f64) -> Self {
        let nbins = nbins.max(1);
        let (xmin, xmax) = if xmax > xmin { (xmin, xmax) } else { (xmin, xmin + 1.0) };
        Self {
            name: name.into(),
            title: title.into(),
            nbins,
            xmin,
            xmax,
            contents: vec![0.0; nbins],
            underflow: 0.0,
            overflow: 0.0,
            entries: 0.0,
            sumw2: Vec::new(),
        }
    }

    /// Build a histogram directly from bin contents (entries = sum of contents).
    pub fn from_contents(name: impl Into<String>, xmin: f64, xmax: f64, contents: Vec<f64>) -> Self {
        let mut h = Self::new(name, "", contents.len(), xmin, xmax);
        h.entries = contents.iter().sum();
        h.contents = contents;
        h
    }

    pub fn fill(&mut self, x: f64) {
        self.fill_weighted(x, 1.0);
    }

    pub fn fill_weighted(&mut self, x: f64, w: f64) {
        self.entries += 1.0;
        if !x.is_finite() {
            return;
        }
        if x < self.xmin {
            self.underflow += w;
            return;
        }
        if x >= self.xmax {
            self.overflow += w;
            return;
        }
        let Some(i) = self.find_bin(x) else {
            return;
        };
        let Some(c) = self.contents.get_mut(i) else {
            return;
        };
        *c += w;
        if w != 1.0 && self.sumw2.is_empty() {
            self.sumw2 = self.contents.clone();
            if let Some(s) = self.sumw2.get_mut(i) {
                *s += w * w - w;
            }
        } else if let Some(s) = self.sumw2.get_mut(i) {
            *s += w * w;
        }
    }

    pub fn bin_width(&self) -> f64 {
        (self.xmax - self.xmin) / self.nbins as f64
    }

    /// Center of in-range bin `i` (0-based).
    pub fn bin_center(&self, i: usize) -> f64 {
        self.xmin + (i as f64 + 0.5) * self.bin_width()
    }

    /// 0-based in-range bin index containing `x`.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        if !(x >= self.xmin && x < self.xmax) {
            return None;
        }
        let last = self.nbins.checked_sub(1)?;
        let i = ((x - self.xmin) / self.bin_width()).floor() as usize;
        Some(i.min(last))
    }

    pub fn bin_content(&self, i: usize) -> f64 {
        self.contents.get(i).copied().unwrap_or(0.0)
    }

    /// Content of the bin containing `x` (0 outside the axis).
    pub fn bin_content_at(&self, x: f64) -> f64 {
        self.find_bin(x).map(|i| self.bin_content(i)).unwrap_or(0.0)
    }

    /// Squared error of bin `i` (content for unit weights).
    pub fn bin_error2(&self, i: usize) -> f64 {
        if self.sumw2.is_empty() {
            self.bin_content(i)
        } else {
            self.sumw2.get(i).copied().unwrap_or(0.0)
        }
    }

    /// First bin holding the maximal content.
    pub fn maximum_bin(&self) -> usize {
        let mut best = 0usize;
        for (i, &c) in self.contents.iter().enumerate() {
            if c > self.contents[best] {
                best = i;
            }
        }
        best
    }

    pub fn maximum(&self) -> f64 {
        self.contents.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Last in-range bin with content strictly above `threshold`.
    pub fn last_bin_above(&self, threshold: f64) -> Option<usize> {
        self.contents.iter().rposition(|&c| c > threshold)
    }

    pub fn integral(&self) -> f64 {
        self.contents.iter().sum()
    }

    fn moments(&self) -> (f64, f64, f64, f64) {
        let mut sw = 0.0;
        let mut sw2 = 0.0;
        let mut swx = 0.0;
        let mut swx2 = 0.0;
        for (i, &c) in self.contents.iter().enumerate() {
            let x = self.bin_center(i);
            sw += c;
            swx += c * x;
            swx2 += c * x * x;
            sw2 += self.bin_error2(i);
        }
        (sw, sw2, swx, swx2)
    }

    pub fn mean(&self) -> f64 {
        let (sw, _, swx, _) = self.moments();
        if sw == 0.0 { 0.0 } else { swx / sw }
    }

    /// Standard deviation of the binned distribution (ROOT's `GetRMS`).
    pub fn std_dev(&self) -> f64 {
        let (sw, _, swx, swx2) = self.moments();
        if sw == 0.0 {
            return 0.0;
        }
        let mean = swx / sw;
        (swx2 / sw - mean * mean).max(0.0).sqrt()
    }

    /// Effective number of entries `(Σw)² / Σw²`.
    pub fn effective_entries(&self) -> f64 {
        let (sw, sw2, _, _) = self.moments();
        if sw2 <= 0.0 { 0.0 } else { sw * sw / sw2 }
    }

    pub fn mean_error(&self) -> f64 {
        let neff = self.effective_entries();
        if neff <= 0.0 { 0.0 } else { self.std_dev() / neff.sqrt() }
    }

    pub fn std_dev_error(&self) -> f64 {
        let neff = self.effective_entries();
        if neff <= 0.0 { 0.0 } else { self.std_dev() / (2.0 * neff).sqrt() }
    }

    /// Check the binning invariants a deserialized histogram may violate.
    pub fn validate(&self) -> Result<(), String> {
        if self.nbins == 0 {
            return Err(format!("{}: nbins must be at least 1", self.name));
        }
        if self.contents.len() != self.nbins {
            return Err(format!(
                "{}: {} bin contents for {} bins",
                self.name,
                self.contents.len(),
                self.nbins
            ));
        }
        if !(self.xmin.is_finite() && self.xmax.is_finite() && self.xmax > self.xmin) {
            return Err(format!("{}: invalid axis [{}, {}]", self.name, self.xmin, self.xmax));
        }
        if !self.sumw2.is_empty() && self.sumw2.len() != self.nbins {
            return Err(format!("{}: {} sumw2 entries for {} bins", self.name, self.sumw2.len(), self.nbins));
        }
        Ok(())
    }

    /// Merge `group` adjacent bins. Trailing bins that don't fill a group are
    /// folded into the overflow, and the axis shrinks accordingly.
    pub fn rebin(&mut self, group: usize) {
        if group <= 1 || group > self.nbins || self.validate().is_err() {
            return;
        }
        let new_n = self.nbins / group;
        let width = self.bin_width();
        let mut contents = Vec::with_capacity(new_n);
        let mut sumw2 = Vec::new();
        for k in 0..new_n {
            let s = &self.contents[k * group..(k + 1) * group];
            contents.push(s.iter().sum());
            if !self.sumw2.is_empty() {
                sumw2.push(self.sumw2[k * group..(k + 1) * group].iter().sum());
            }
        }
        let dropped: f64 = self.contents[new_n * group..].iter().sum();
        self.overflow += dropped;
        self.xmax = self.xmin + width * (new_n * group) as f64;
        self.nbins = new_n;
        self.contents = contents;
        self.sumw2 = sumw2;
    }
}

/// A named collection of histograms produced from one input run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramBundle {
    /// Input file the histograms were built from.
    pub source: String,
    pub created: DateTime<Local>,
    pub histograms: Vec<Histogram1D>,
}

impl HistogramBundle {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            created: Local::now(),
            histograms: Vec::new(),
        }
    }

    pub fn push(&mut self, hist: Histogram1D) {
        match self.histograms.iter_mut().find(|h| h.name == hist.name) {
            Some(existing) => *existing = hist,
            None => self.histograms.push(hist),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Histogram1D> {
        self.histograms.iter().find(|h| h.name == name)
    }

    /// First histogram present among `names`, in order.
    pub fn find_any<S: AsRef<str>>(&self, names: &[S]) -> Option<&Histogram1D> {
        names.iter().find_map(|n| self.get(n.as_ref()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.histograms.iter().map(|h| h.name.as_str()).collect()
    }
}

/// `h_<type>_ch<ch>`: per-channel signal histograms.
pub fn event_hist_name(kind: HitType, ch: usize) -> String {
    format!("h_{}_ch{ch}", kind.as_str())
}

/// `ped_ch<NN>_<type>`: pedestal-run histograms.
pub fn pedestal_hist_name(ch: usize, kind: HitType) -> String {
    format!("ped_ch{ch:02}_{}", kind.as_str())
}

/// `all_ch<NN>_hgain`: low-light SPE histograms.
pub fn spe_hist_name(ch: usize) -> String {
    format!("all_ch{ch:02}_hgain")
}

/// Candidate names tried when locating a channel histogram whose naming
/// convention varies between acquisition setups.
pub fn candidate_names(kind: HitType, ch: usize) -> Vec<String> {
    let t = kind.as_str();
    vec![
        format!("h_{t}_ch{ch}"),
        format!("h_{t}_ch{ch:02}"),
        format!("{t}_ch{ch}"),
        format!("{t}_ch{ch:02}"),
        format!("ch{ch:02}_{t}"),
    ]
}
