//! Terminal text blocks: run header, SPE results and timing tables.
//!
//! We keep formatting code in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized

use chrono::{DateTime, Local};

use crate::domain::{HvGainFit, SpeFitResult, TimeFitRow, TtsSummary};
use crate::fit::SpeBatchRow;

/// Header printed once per command run.
pub fn format_run_header(command: &str, inputs: &[String], at: DateTime<Local>) -> String {
    let mut out = String::new();
    out.push_str(&format!("=== pmtcal {command} ===\n"));
    out.push_str(&format!("Run: {}\n", at.format("%Y-%m-%d %H:%M:%S")));
    match inputs {
        [] => {}
        [one] => out.push_str(&format!("Input: {one}\n")),
        many => out.push_str(&format!("Inputs: {} file(s), first {}\n", many.len(), many[0])),
    }
    out
}

/// The `RESULT` block of one SPE fit.
pub fn format_spe_result(r: &SpeFitResult) -> String {
    let mut out = String::new();
    out.push_str("=========== RESULT ==========\n");
    out.push_str(&format!(" peakx            =  {}\n", r.peakx));
    out.push_str(&format!(" FWHM             =  {}  ({} [%])\n", r.fwhm, r.fwhm_percent()));
    if r.n_peaks == 1 {
        out.push_str(&format!(" sigma            =  {}  ({} [%])\n", r.sigma, r.sigma_percent()));
    } else {
        out.push_str(&format!(" FWHM low/high    =  {} / {}\n", r.fwhm_low, r.fwhm_high));
        out.push_str(&format!(
            " 1pe peak         =  {} +- {}\n",
            r.peak1pe_x, r.peak1pe_x_err
        ));
        out.push_str(&format!(
            " 1pe sigma        =  {} +- {}  ({} [%])\n",
            r.peak1pe_sigma,
            r.peak1pe_sigma_err,
            r.sigma_percent()
        ));
        out.push_str(&format!(" valley           =  {} at {}\n", r.valley, r.valley_x));
        out.push_str(&format!(" P/V              =  {}\n", r.pv));
        out.push_str(&format!(" area sigma       =  {} ({} / {})\n", r.area_sigma, r.area_sigma_low, r.area_sigma_high));
        out.push_str(&format!(" BS ratio         =  {}\n", r.bs_ratio()));
        out.push_str(&format!(" occupancy        =  {} [%]\n", r.occupancy()));
        out.push_str(&format!(" Gain (1pe peak)  =  {} +- {}\n", r.gain_peak1pe_x, r.gain_peak1pe_x_err));
    }
    out.push_str(&format!(" Gain             =  {}\n", r.gain_peakx));
    out.push_str(&format!(" Chi2/NDF         =  {}\n", r.chi2_ndf()));
    out.push_str(&format!(" params           =  {}\n", fmt_vec(&r.params)));
    out.push_str("=============================\n");
    out
}

/// One batch line `RESULT : NN, flag, gain, peak, pv, fwhm%, sigma%, bsratio, chi2ndf`.
pub fn spe_result_line(row: &SpeBatchRow) -> String {
    format!(
        "RESULT : {:02}, {}, {}, {}, {}, {}, {}, {}, {}",
        row.ch, row.flag, row.gain, row.peak, row.pv, row.fwhm_percent, row.sigma_percent, row.bs_ratio, row.chi2_ndf
    )
}

/// EMG time-fit rows as an aligned table.
pub fn format_timing_table(rows: &[TimeFitRow]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:>4} {:>12} {:>10} {:>12} {:>10} {:>10} {:>8} {:>12} {:>10}\n",
        "ch", "peak", "peak_err", "tts(fwhm)", "tts_err", "chi2", "ndf", "mean", "rms"
    ));
    out.push_str(&format!(
        "{:-<4} {:-<12} {:-<10} {:-<12} {:-<10} {:-<10} {:-<8} {:-<12} {:-<10}\n",
        "", "", "", "", "", "", "", "", ""
    ));
    for r in rows {
        if r.fitted() {
            out.push_str(&format!(
                "{:>4} {:>12.4} {:>10.4} {:>12.4} {:>10.4} {:>10.2} {:>8} {:>12.4} {:>10.4}\n",
                r.ch, r.peak, r.peak_err, r.fwhm, r.fwhm_err, r.chi2, r.ndf, r.mean, r.rms
            ));
        } else {
            out.push_str(&format!(
                "{:>4} {:>12} {:>10} {:>12} {:>10} {:>10} {:>8} {:>12.4} {:>10.4}\n",
                r.ch, "-", "-", "-", "-", "-", "-", r.mean, r.rms
            ));
        }
    }
    out
}

/// Transit-time-spread fits as an aligned table.
pub fn format_tts_table(rows: &[TtsSummary]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:>4} {:<10} {:>12} {:>10} {:>10} {:>10} {:>10}\n",
        "ch", "type", "peak", "tts", "sigma", "tau", "chi2/ndf"
    ));
    for r in rows.iter().filter(|r| r.fit.ndf > 0) {
        let f = &r.fit;
        out.push_str(&format!(
            "{:>4} {:<10} {:>12.4} {:>10.4} {:>10.4} {:>10.4} {:>10.3}\n",
            r.ch,
            r.kind.as_str(),
            f.peak,
            f.tts,
            f.sigma,
            f.tau,
            f.chi2 / f.ndf as f64
        ));
    }
    out
}

pub fn format_hv_gain(fit: &HvGainFit) -> String {
    format!(
        "ch {}: charge = ({:.4e} +- {:.2e}) * HV^({:.4} +- {:.4})  chi2/ndf = {:.3}/{}\n",
        fit.ch, fit.b, fit.b_err, fit.a, fit.a_err, fit.chi2, fit.ndf
    )
}

fn fmt_vec(v: &[f64]) -> String {
    let parts: Vec<String> = v.iter().map(|x| format!("{x:.6}")).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_header_shows_timestamp_and_inputs() {
        let at = Local.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let h = format_run_header("gausfit", &["a.json".to_string(), "b.json".to_string()], at);
        assert!(h.contains("=== pmtcal gausfit ==="));
        assert!(h.contains("Run: 2025-03-04 05:06:07"));
        assert!(h.contains("Inputs: 2 file(s), first a.json"));
    }

    #[test]
    fn result_line_pads_channel() {
        let row = SpeBatchRow {
            ch: 3,
            flag: 0,
            gain: 2.5e6,
            peak: 470.5,
            pv: 2.25,
            fwhm_percent: 40.0,
            sigma_percent: 18.5,
            bs_ratio: 0.125,
            chi2_ndf: 1.5,
            result: None,
        };
        assert_eq!(spe_result_line(&row), "RESULT : 03, 0, 2500000, 470.5, 2.25, 40, 18.5, 0.125, 1.5");
    }

    #[test]
    fn timing_table_marks_unfitted_rows() {
        let fitted = TimeFitRow {
            ch: 0,
            peak: 210.0,
            peak_err: 0.1,
            fwhm: 3.0,
            mu: 209.0,
            gamma: 500.0,
            sigma: 1.0,
            lambda: 0.5,
            fwhm_err: 0.2,
            chi2: 80.0,
            ndf: 75,
            mean: 211.0,
            mean_err: 0.05,
            rms: 2.0,
            rms_err: 0.03,
        };
        let unfitted = TimeFitRow {
            ch: 1,
            peak: TimeFitRow::NO_FIT,
            ndf: -1,
            ..fitted
        };
        let table = format_timing_table(&[fitted, unfitted]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("210.0000"));
        assert!(lines[3].contains(" - ") && !lines[3].contains("-9999"));
    }
}
