//! Export fit results to text and CSV files.
//!
//! Summary tables are comma separated with a single `# header` line so they
//! can be concatenated and fed back to the summary commands. Per-event
//! reconstruction tables are appended to, with the header written once.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;

use crate::domain::{
    ChargeMeanRow, GaussFitSummary, HvGainFit, LightSourceFit, MpmtFitResult, PeakPosition, PedestalEntry,
    PedestalMethod, ProcessedHit, RawHit, TimeFitRow, TtsSummary,
};
use crate::error::AppError;
use crate::fit::{HvChargePoint, VoltageValue};

pub const GAUSFIT_HEADER: &str = "# ch,type,voltage,peak,peak_err,sigma,sigma_err,chi2_ndf,rough_sigma";
pub const TTS_HEADER: &str = "# ch,type,voltage,tts,sigma,fwhm,peak,tau,chi2_ndf";
pub const TIMEFIT_HEADER: &str =
    "# ch,peak,peak_err,tts(fwhm),mu,gamma,sigma,lambda,tts_err,chi2,ndf,mean,mean_err,rms,rms_err";
pub const MEAN_HEADER: &str = "# ch,type,mean,mean_err,rms,source";
pub const PEAK_HEADER: &str = "# ch,type,voltage,peak_pos";
pub const HV_CHARGE_HEADER: &str = "# HV(V), Charge(pC), source(hgain=1_lgain=0)";
pub const CHARGE_MEAN_SUMMARY_HEADER: &str = "# ch,voltage,charge_mean,charge_mean_err";
pub const TOT_MEAN_SUMMARY_HEADER: &str = "# ch,voltage,tot_mean,tot_mean_err";
pub const HV_GAIN_HEADER: &str = "# ch,b,b_err,a,a_err";
pub const SPE_RESULT_HEADER: &str = "# RESULT : ch, flag, gain, peak, pv, fwhm_percent, sigma_percent, bs_ratio, chi2_ndf";
pub const RECO_HEADER: &str = "eventID,nhits,x,y,z,t,err_x,err_y,err_z,err_t,A,B,chi2,ndf,status";
pub const MPMT_HEADER: &str = "fit_x,fit_y,fit_z,t_light,err_x,err_y,err_z,t_error,chi2";

fn pedestal_header(method: PedestalMethod) -> &'static str {
    match method {
        PedestalMethod::Fit => "# ch,type,ped_peak,ped_peak_err",
        PedestalMethod::Mean => "# ch,type,ped_mean,ped_mean_err",
    }
}

/// Write a header line followed by one line per row, replacing the file.
pub fn write_table<I>(path: &Path, header: &str, rows: I) -> Result<(), AppError>
where
    I: IntoIterator<Item = String>,
{
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create output '{}': {e}", path.display())))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{header}").map_err(|e| AppError::new(2, format!("Failed to write header to '{}': {e}", path.display())))?;
    for row in rows {
        writeln!(out, "{row}").map_err(|e| AppError::new(2, format!("Failed to write row to '{}': {e}", path.display())))?;
    }
    out.flush()
        .map_err(|e| AppError::new(2, format!("Failed to flush '{}': {e}", path.display())))
}

/// A table opened for appending; the header is written only when the file
/// is new or empty.
pub struct AppendTable {
    out: BufWriter<File>,
    path: String,
}

impl AppendTable {
    pub fn open(path: &Path, header: &str) -> Result<Self, AppError> {
        let is_empty = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AppError::new(2, format!("Failed to open output '{}': {e}", path.display())))?;
        let mut table = Self {
            out: BufWriter::new(file),
            path: path.display().to_string(),
        };
        if is_empty {
            table.write_row(header)?;
        }
        Ok(table)
    }

    pub fn write_row(&mut self, line: &str) -> Result<(), AppError> {
        writeln!(self.out, "{line}").map_err(|e| AppError::new(2, format!("Failed to write to '{}': {e}", self.path)))
    }

    pub fn flush(&mut self) -> Result<(), AppError> {
        self.out
            .flush()
            .map_err(|e| AppError::new(2, format!("Failed to flush '{}': {e}", self.path)))
    }
}

pub fn gausfit_line(r: &GaussFitSummary) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{}",
        r.ch,
        r.kind.as_str(),
        r.voltage,
        r.peak,
        r.peak_err,
        r.sigma.abs(),
        r.sigma_err,
        r.chi2_ndf,
        r.rough_sigma
    )
}

pub fn write_gausfit_table(path: &Path, rows: &[GaussFitSummary]) -> Result<(), AppError> {
    write_table(path, GAUSFIT_HEADER, rows.iter().map(gausfit_line))
}

/// Rows without a fit (ndf 0) are left out.
pub fn write_tts_table(path: &Path, rows: &[TtsSummary]) -> Result<(), AppError> {
    let lines = rows.iter().filter(|r| r.fit.ndf > 0).map(|r| {
        let f = &r.fit;
        format!(
            "{},{},{},{},{},{},{},{},{}",
            r.ch,
            r.kind.as_str(),
            r.voltage,
            f.tts,
            f.sigma,
            f.fwhm,
            f.peak,
            f.tau,
            f.chi2 / f.ndf as f64
        )
    });
    write_table(path, TTS_HEADER, lines)
}

pub fn timefit_line(r: &TimeFitRow) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        r.ch,
        r.peak,
        r.peak_err,
        r.fwhm,
        r.mu,
        r.gamma,
        r.sigma,
        r.lambda,
        r.fwhm_err,
        r.chi2,
        r.ndf,
        r.mean,
        r.mean_err,
        r.rms,
        r.rms_err
    )
}

pub fn write_timefit_table(path: &Path, rows: &[TimeFitRow]) -> Result<(), AppError> {
    write_table(path, TIMEFIT_HEADER, rows.iter().map(timefit_line))
}

pub fn write_mean_table(path: &Path, rows: &[ChargeMeanRow]) -> Result<(), AppError> {
    let lines = rows
        .iter()
        .map(|r| format!("{},{},{},{},{},{}", r.ch, r.label.as_str(), r.mean, r.mean_err, r.rms, r.source));
    write_table(path, MEAN_HEADER, lines)
}

pub fn write_pedestal_table(path: &Path, rows: &[PedestalEntry], method: PedestalMethod) -> Result<(), AppError> {
    let lines = rows
        .iter()
        .map(|r| format!("{},{},{},{}", r.ch, r.kind.as_str(), r.mean, r.err));
    write_table(path, pedestal_header(method), lines)
}

pub fn write_peak_table(path: &Path, rows: &[PeakPosition]) -> Result<(), AppError> {
    let lines = rows
        .iter()
        .map(|r| format!("{},{},{},{}", r.ch, r.kind.as_str(), r.voltage, r.peak));
    write_table(path, PEAK_HEADER, lines)
}

/// `HV_vs_Charge_ch<N>.txt`: space separated `volt charge flag` lines.
pub fn write_hv_charge(path: &Path, points: &[HvChargePoint]) -> Result<(), AppError> {
    let lines = points
        .iter()
        .map(|p| format!("{} {} {}", p.voltage, p.charge, p.flag));
    write_table(path, HV_CHARGE_HEADER, lines)
}

pub fn write_voltage_values(path: &Path, header: &str, rows: &[VoltageValue]) -> Result<(), AppError> {
    let lines = rows
        .iter()
        .map(|r| format!("{},{},{},{}", r.ch, r.voltage, r.value, r.err));
    write_table(path, header, lines)
}

pub fn hv_gain_line(fit: &HvGainFit) -> String {
    format!("{},{},{},{},{}", fit.ch, fit.b, fit.b_err, fit.a, fit.a_err)
}

pub fn reco_line(r: &LightSourceFit) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        r.event_id,
        r.nhits,
        r.x,
        r.y,
        r.z,
        r.t,
        r.err_x,
        r.err_y,
        r.err_z,
        r.err_t,
        r.a,
        r.b,
        r.chi2,
        r.ndf,
        r.status
    )
}

pub fn mpmt_line(r: &MpmtFitResult) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{}",
        r.pos.x, r.pos.y, r.pos.z, r.t_light, r.err.x, r.err.y, r.err.z, r.t_error, r.chi2
    )
}

/// Serialized rows under a header row taken from the field names.
fn write_csv_rows<T: Serialize>(path: &Path, rows: &[T], what: &str) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| AppError::new(2, format!("Failed to create {what} CSV '{}': {e}", path.display())))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| AppError::new(2, format!("Failed to write {what} CSV row: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| AppError::new(2, format!("Failed to flush {what} CSV '{}': {e}", path.display())))
}

/// `eventID,ch,hgain,lgain,tot,tdc_diff,time_diff` rows.
pub fn write_processed_hits(path: &Path, hits: &[ProcessedHit]) -> Result<(), AppError> {
    write_csv_rows(path, hits, "hit")
}

/// `event,kind,channel,hgain,lgain,tot,tdc,time` rows, readable by
/// [`crate::io::read_raw_hits`].
pub fn write_raw_hits(path: &Path, rows: &[RawHit]) -> Result<(), AppError> {
    write_csv_rows(path, rows, "raw event")
}
