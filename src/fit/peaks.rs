//! Peak search on histograms.
//!
//! The search smooths the bin contents with a Gaussian kernel and then runs
//! [`find_peaks::PeakFinder`] with a minimum height relative to the smoothed
//! maximum. Peaks are reported by decreasing smoothed height, which mirrors
//! how spectrum peak searchers hand back the dominant peaks first.

use find_peaks::PeakFinder;

use crate::domain::Histogram1D;

/// A found peak: bin centre and raw bin content.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FoundPeak {
    pub bin: usize,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PeakSearchOptions {
    /// Gaussian smoothing width in bins.
    pub sigma_bins: f64,
    /// Minimum height relative to the highest smoothed bin.
    pub threshold: f64,
    pub max_peaks: usize,
}

impl Default for PeakSearchOptions {
    fn default() -> Self {
        Self {
            sigma_bins: 4.0,
            threshold: 0.001,
            max_peaks: 3,
        }
    }
}

fn smooth(contents: &[f64], sigma_bins: f64) -> Vec<f64> {
    if sigma_bins <= 0.0 {
        return contents.to_vec();
    }
    let half = (3.0 * sigma_bins).ceil() as isize;
    let kernel: Vec<f64> = (-half..=half)
        .map(|k| (-0.5 * (k as f64 / sigma_bins).powi(2)).exp())
        .collect();
    let n = contents.len() as isize;
    (0..n)
        .map(|i| {
            let mut acc = 0.0;
            let mut norm = 0.0;
            for (j, w) in (-half..=half).zip(&kernel) {
                let k = i + j;
                if k >= 0 && k < n {
                    acc += w * contents[k as usize];
                    norm += w;
                }
            }
            if norm > 0.0 { acc / norm } else { 0.0 }
        })
        .collect()
}

/// Search for up to `opts.max_peaks` peaks in `hist`.
pub fn search_peaks(hist: &Histogram1D, opts: &PeakSearchOptions) -> Vec<FoundPeak> {
    let smoothed = smooth(&hist.contents, opts.sigma_bins);
    let top = smoothed.iter().copied().fold(0.0_f64, f64::max);
    if top <= 0.0 || opts.max_peaks == 0 {
        return Vec::new();
    }

    let mut finder = PeakFinder::new(&smoothed);
    finder.with_min_height(opts.threshold * top);
    let mut peaks: Vec<(usize, f64)> = finder
        .find_peaks()
        .iter()
        .map(|p| {
            let bin = p.middle_position();
            (bin, smoothed[bin])
        })
        .collect();

    peaks.sort_by(|a, b| b.1.total_cmp(&a.1));
    peaks.truncate(opts.max_peaks);
    log::debug!("{}: {} peak(s) found", hist.name, peaks.len());

    peaks
        .into_iter()
        .map(|(bin, _)| FoundPeak {
            bin,
            x: hist.bin_center(bin),
            y: hist.bin_content(bin),
        })
        .collect()
}

/// Centre and content of the maximum bin.
pub fn rough_peak(hist: &Histogram1D) -> (f64, f64) {
    let bin = hist.maximum_bin();
    (hist.bin_center(bin), hist.bin_content(bin))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::gaus;

    fn two_peak_hist() -> Histogram1D {
        let contents = (0..200)
            .map(|i| {
                let x = -1.0 + 0.05 * (i as f64 + 0.5);
                (gaus(x, 5000.0, 0.0, 0.1) + gaus(x, 300.0, 2.5, 0.6)).round()
            })
            .collect();
        Histogram1D::from_contents("spe", -1.0, 9.0, contents)
    }

    #[test]
    fn finds_pedestal_then_one_pe() {
        let h = two_peak_hist();
        let peaks = search_peaks(&h, &PeakSearchOptions { max_peaks: 2, ..Default::default() });
        assert_eq!(peaks.len(), 2);
        assert!(peaks[0].x.abs() < 0.1);
        assert!((peaks[1].x - 2.5).abs() < 0.2);
        assert!(peaks[0].y > peaks[1].y);
    }

    #[test]
    fn max_peaks_truncates() {
        let h = two_peak_hist();
        let peaks = search_peaks(&h, &PeakSearchOptions { max_peaks: 1, ..Default::default() });
        assert_eq!(peaks.len(), 1);
    }

    #[test]
    fn empty_histogram_has_no_peaks() {
        let h = Histogram1D::new("e", "", 50, 0.0, 1.0);
        assert!(search_peaks(&h, &PeakSearchOptions::default()).is_empty());
    }

    #[test]
    fn rough_peak_is_max_bin() {
        let h = Histogram1D::from_contents("r", 0.0, 4.0, vec![1.0, 7.0, 3.0, 2.0]);
        assert_eq!(rough_peak(&h), (1.5, 7.0));
    }
}
