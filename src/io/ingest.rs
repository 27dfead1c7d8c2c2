//! Table ingest.
//!
//! Two families of inputs are read here:
//! - CSV hit tables with a header row (raw events, processed hits, mPMT hits)
//! - `#`-commented summary text files written by earlier commands
//!
//! Design goals:
//! - **Strict schema** for required columns (clear errors + exit code 2)
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Separation of concerns**: no fitting logic here

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use csv::StringRecord;
use nalgebra::Vector3;

use crate::domain::{GaussFitSummary, HitType, MpmtHit, PedestalEntry, PedestalTable, ProcessedHit, RawHit, RawHitKind};
use crate::error::AppError;
use crate::fit::{VoltageMeanRow, voltage_from_filename};

/// A row-level error encountered during ingest.
#[derive(Debug, Clone)]
pub struct RowError {
    pub line: usize,
    pub message: String,
}

/// Ingest output: parsed rows + the rows that were rejected.
#[derive(Debug, Clone)]
pub struct Ingested<T> {
    pub rows: Vec<T>,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
}

impl<T> Ingested<T> {
    /// Log a summary of rejected rows (first few in full).
    pub fn log_row_errors(&self, what: &str) {
        if self.row_errors.is_empty() {
            return;
        }
        log::warn!("{what}: {} of {} row(s) rejected", self.row_errors.len(), self.rows_read);
        for e in self.row_errors.iter().take(5) {
            log::warn!("  line {}: {}", e.line, e.message);
        }
    }
}

fn open_csv(path: &Path) -> Result<csv::Reader<File>, AppError> {
    let file = File::open(path).map_err(|e| AppError::new(2, format!("Failed to open CSV '{}': {e}", path.display())))?;
    Ok(csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file))
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports may prefix the first header with a UTF-8 BOM.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn ensure_columns(header_map: &HashMap<String, usize>, required: &[&str], path: &Path) -> Result<(), AppError> {
    let missing: Vec<&str> = required.iter().copied().filter(|c| !header_map.contains_key(*c)).collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::new(
            2,
            format!("'{}' is missing required column(s): {}", path.display(), missing.join(", ")),
        ))
    }
}

fn get_required<'r>(record: &'r StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Result<&'r str, String> {
    header_map
        .get(name)
        .and_then(|&i| record.get(i))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Missing `{name}` value."))
}

fn get_f64(record: &StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Result<f64, String> {
    let s = get_required(record, header_map, name)?;
    s.parse::<f64>().map_err(|_| format!("Invalid `{name}` value '{s}'."))
}

fn get_i64(record: &StringRecord, header_map: &HashMap<String, usize>, name: &str) -> Result<i64, String> {
    let s = get_required(record, header_map, name)?;
    parse_int(s).ok_or_else(|| format!("Invalid `{name}` value '{s}'."))
}

/// Integers may be written as floats (`3.0`) by some exporters.
fn parse_int(s: &str) -> Option<i64> {
    s.parse::<i64>().ok().or_else(|| {
        let v = s.parse::<f64>().ok()?;
        (v.is_finite() && v.fract() == 0.0).then_some(v as i64)
    })
}

fn parse_channel(s: &str) -> Option<usize> {
    parse_int(s).and_then(|v| usize::try_from(v).ok())
}

fn get_vec3(record: &StringRecord, header_map: &HashMap<String, usize>, names: [&str; 3]) -> Result<Vector3<f64>, String> {
    Ok(Vector3::new(
        get_f64(record, header_map, names[0])?,
        get_f64(record, header_map, names[1])?,
        get_f64(record, header_map, names[2])?,
    ))
}

/// Read every record of a headed CSV through `parse_row`.
fn ingest_csv<T>(
    path: &Path,
    required: &[&str],
    parse_row: impl Fn(&StringRecord, &HashMap<String, usize>) -> Result<T, String>,
) -> Result<Ingested<T>, AppError> {
    let mut reader = open_csv(path)?;
    let headers = reader
        .headers()
        .map_err(|e| AppError::new(2, format!("Failed to read CSV headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);
    ensure_columns(&header_map, required, path)?;

    let mut rows = Vec::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;
    for (idx, result) in reader.records().enumerate() {
        // +2: records start after the header and lines are 1-based.
        let line = idx + 2;
        rows_read += 1;
        let parsed = result
            .map_err(|e| format!("CSV parse error: {e}"))
            .and_then(|record| parse_row(&record, &header_map));
        match parsed {
            Ok(row) => rows.push(row),
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }
    Ok(Ingested { rows, row_errors, rows_read })
}

const RAW_COLUMNS: [&str; 8] = ["event", "kind", "channel", "hgain", "lgain", "tot", "tdc", "time"];

/// Raw event table `event,kind,channel,hgain,lgain,tot,tdc,time`.
pub fn read_raw_hits(path: &Path) -> Result<Ingested<RawHit>, AppError> {
    ingest_csv(path, &RAW_COLUMNS, |record, map| {
        let kind = match get_required(record, map, "kind")?.to_ascii_lowercase().as_str() {
            "trigger" => RawHitKind::Trigger,
            "normal" => RawHitKind::Normal,
            other => return Err(format!("Unknown hit kind '{other}'.")),
        };
        let channel_s = get_required(record, map, "channel")?;
        Ok(RawHit {
            event: get_i64(record, map, "event")?,
            kind,
            channel: parse_channel(channel_s).ok_or_else(|| format!("Invalid `channel` value '{channel_s}'."))?,
            hgain: get_f64(record, map, "hgain")?,
            lgain: get_f64(record, map, "lgain")?,
            tot: get_f64(record, map, "tot")?,
            tdc: get_f64(record, map, "tdc")?,
            time: get_f64(record, map, "time")?,
        })
    })
}

/// Stream processed hit rows (`eventID,ch,hgain,lgain,tot,tdc_diff,time_diff`).
///
/// Rows are decoded lazily so large tables can be reconstructed event by
/// event. The first malformed row ends the stream with an input error.
pub fn processed_hit_rows(path: &Path) -> Result<impl Iterator<Item = Result<ProcessedHit, AppError>>, AppError> {
    let reader = open_csv(path)?;
    Ok(reader.into_deserialize::<ProcessedHit>().enumerate().map(|(idx, row)| {
        row.map_err(|e| AppError::new(2, format!("Invalid processed hit row at line {}: {e}", idx + 2)))
    }))
}

const MPMT_COLUMNS: [&str; 14] = [
    "eventnumber",
    "mpmtid",
    "mpmt_pmtid",
    "x",
    "y",
    "z",
    "l",
    "t",
    "ori_x",
    "ori_y",
    "ori_z",
    "center_x",
    "center_y",
    "center_z",
];

/// mPMT hit table
/// `eventNumber,mPMTid,mPMT_pmtid,x,y,z,L,t,ori_x,ori_y,ori_z,center_x,center_y,center_z`.
pub fn read_mpmt_hits(path: &Path) -> Result<Ingested<MpmtHit>, AppError> {
    ingest_csv(path, &MPMT_COLUMNS, |record, map| {
        Ok(MpmtHit {
            event: get_i64(record, map, "eventnumber")?,
            mpmt_id: get_i64(record, map, "mpmtid")?,
            pmt_id: get_i64(record, map, "mpmt_pmtid")?,
            pos: get_vec3(record, map, ["x", "y", "z"])?,
            l: get_f64(record, map, "l")?,
            t: get_f64(record, map, "t")?,
            ori: get_vec3(record, map, ["ori_x", "ori_y", "ori_z"])?,
            center: get_vec3(record, map, ["center_x", "center_y", "center_z"])?,
        })
    })
}

/// Non-comment lines of a summary text file, split on commas and whitespace,
/// with their 1-based line numbers.
pub fn read_text_rows(path: &Path) -> Result<Vec<(usize, Vec<String>)>, AppError> {
    let file = File::open(path).map_err(|e| AppError::new(2, format!("Failed to open '{}': {e}", path.display())))?;
    let mut rows = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| AppError::new(2, format!("Failed to read '{}': {e}", path.display())))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields = trimmed
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        rows.push((idx + 1, fields));
    }
    Ok(rows)
}

fn field_f64(fields: &[String], i: usize, name: &str) -> Result<f64, String> {
    let s = fields.get(i).ok_or_else(|| format!("Missing `{name}` column."))?;
    s.parse::<f64>().map_err(|_| format!("Invalid `{name}` value '{s}'."))
}

fn field_channel(fields: &[String], i: usize) -> Result<usize, String> {
    let s = fields.get(i).ok_or_else(|| "Missing `ch` column.".to_string())?;
    parse_channel(s).ok_or_else(|| format!("Invalid `ch` value '{s}'."))
}

fn ingest_text<T>(
    path: &Path,
    min_columns: usize,
    parse_row: impl Fn(&[String]) -> Result<Option<T>, String>,
) -> Result<Ingested<T>, AppError> {
    let lines = read_text_rows(path)?;
    let rows_read = lines.len();
    let mut rows = Vec::new();
    let mut row_errors = Vec::new();
    for (line, fields) in lines {
        if fields.len() < min_columns {
            row_errors.push(RowError {
                line,
                message: format!("Expected at least {min_columns} columns, got {}.", fields.len()),
            });
            continue;
        }
        match parse_row(&fields) {
            Ok(Some(row)) => rows.push(row),
            Ok(None) => {}
            Err(message) => row_errors.push(RowError { line, message }),
        }
    }
    Ok(Ingested { rows, row_errors, rows_read })
}

/// Pedestal table `ch,type,mean,err[,...]`; only hgain/lgain rows are kept.
pub fn read_pedestals(path: &Path) -> Result<PedestalTable, AppError> {
    let ingested = ingest_text(path, 4, |f| {
        let Some(kind) = HitType::parse(&f[1]).filter(|k| matches!(k, HitType::Hgain | HitType::Lgain)) else {
            return Ok(None);
        };
        Ok(Some(PedestalEntry {
            ch: field_channel(f, 0)?,
            kind,
            mean: field_f64(f, 2, "mean")?,
            err: field_f64(f, 3, "err")?,
        }))
    })?;
    ingested.log_row_errors("pedestal file");

    let mut table = PedestalTable::new();
    for entry in ingested.rows {
        table.insert(entry);
    }
    log::info!("Loaded {} pedestal level(s) from '{}'", table.len(), path.display());
    Ok(table)
}

/// Pedestals for a summary command: a missing file means all pedestals are 0.
pub fn read_pedestals_or_zero(path: &Path) -> Result<PedestalTable, AppError> {
    if path.exists() {
        read_pedestals(path)
    } else {
        log::warn!("Pedestal file '{}' not found, using pedestal 0", path.display());
        Ok(PedestalTable::new())
    }
}

/// Two-stage Gaussian fit summary
/// `ch,type,voltage,peak,peak_err,sigma,sigma_err,chi2_ndf[,rough_sigma]`.
pub fn read_gausfit_summary(path: &Path) -> Result<Ingested<GaussFitSummary>, AppError> {
    ingest_text(path, 8, |f| {
        let Some(kind) = HitType::parse(&f[1]) else {
            return Err(format!("Unknown type '{}'.", f[1]));
        };
        Ok(Some(GaussFitSummary {
            ch: field_channel(f, 0)?,
            kind,
            voltage: field_f64(f, 2, "voltage")?,
            peak: field_f64(f, 3, "peak")?,
            peak_err: field_f64(f, 4, "peak_err")?,
            sigma: field_f64(f, 5, "sigma")?,
            sigma_err: field_f64(f, 6, "sigma_err")?,
            chi2_ndf: field_f64(f, 7, "chi2_ndf")?,
            rough_sigma: if f.len() > 8 { field_f64(f, 8, "rough_sigma")? } else { 0.0 },
        }))
    })
}

/// Charge-mean rows with a voltage.
///
/// Two layouts are accepted:
/// - `ch,type,voltage,mean,mean_err,rms[,source]`
/// - `ch,type,mean,mean_err,rms,source` as written by `mean`, the voltage
///   being taken from the `<N>V` in the source name
///
/// Converted rows (`pc_by_h`, `pc_by_l`) are skipped.
pub fn read_voltage_means(path: &Path) -> Result<Ingested<VoltageMeanRow>, AppError> {
    ingest_text(path, 6, |f| {
        let Some(kind) = HitType::parse(&f[1]) else {
            return Ok(None);
        };
        let ch = field_channel(f, 0)?;
        let with_voltage = f.len() >= 7 || f[5].parse::<f64>().is_ok();
        let row = if with_voltage {
            VoltageMeanRow {
                ch,
                kind,
                voltage: field_f64(f, 2, "voltage")?,
                mean: field_f64(f, 3, "mean")?,
                mean_err: field_f64(f, 4, "mean_err")?,
                rms: field_f64(f, 5, "rms")?,
            }
        } else {
            let voltage = voltage_from_filename(&f[5]);
            if voltage < 0.0 {
                return Err(format!("No voltage in source name '{}'.", f[5]));
            }
            VoltageMeanRow {
                ch,
                kind,
                voltage,
                mean: field_f64(f, 2, "mean")?,
                mean_err: field_f64(f, 3, "mean_err")?,
                rms: field_f64(f, 4, "rms")?,
            }
        };
        Ok(Some(row))
    })
}

/// `(voltage, charge)` points of an `HV_vs_Charge` file; a third flag column
/// is ignored.
pub fn read_hv_points(path: &Path) -> Result<Ingested<(f64, f64)>, AppError> {
    ingest_text(path, 2, |f| Ok(Some((field_f64(f, 0, "voltage")?, field_f64(f, 1, "charge")?))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn raw_hits_report_bad_rows_by_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "raw.csv",
            "\u{feff}Event,kind,channel,hgain,lgain,tot,tdc,time\n\
             0,trigger,15,0,0,0,100,1e-6\n\
             0,normal,2,900.5,120,33,300,1.2e-6\n\
             1,bogus,2,900,120,33,300,1.2e-6\n\
             1,normal,x,900,120,33,300,1.2e-6\n",
        );
        let ingested = read_raw_hits(&path).unwrap();
        assert_eq!(ingested.rows_read, 4);
        assert_eq!(ingested.rows.len(), 2);
        assert_eq!(ingested.rows[0].kind, RawHitKind::Trigger);
        assert_eq!(ingested.rows[1].channel, 2);
        assert_eq!(ingested.row_errors.iter().map(|e| e.line).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn missing_columns_are_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "raw.csv", "event,kind,channel\n0,normal,1\n");
        let err = read_raw_hits(&path).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.message().contains("hgain"));
    }

    #[test]
    fn processed_rows_stream_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "hits.csv",
            "eventID,ch,hgain,lgain,tot,tdc_diff,time_diff\n\
             0,1,1000,120,30,200,210\n\
             0,2,1100,130,31,201,211\n\
             oops,2,1100,130,31,201,211\n",
        );
        let rows: Vec<_> = processed_hit_rows(&path).unwrap().collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].as_ref().unwrap().ch, 2);
        assert_eq!(rows[2].as_ref().unwrap_err().exit_code(), 2);
    }

    #[test]
    fn mpmt_hits_use_case_insensitive_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "mpmt.csv",
            "eventNumber,mPMTid,mPMT_pmtid,x,y,z,L,t,ori_x,ori_y,ori_z,center_x,center_y,center_z\n\
             4,12,19,1,2,3,5.5,100.25,0,0,1,1,2,0\n",
        );
        let ingested = read_mpmt_hits(&path).unwrap();
        let h = ingested.rows[0];
        assert_eq!((h.event, h.mpmt_id, h.pmt_id), (4, 12, 19));
        assert_eq!(h.l, 5.5);
        assert_eq!(h.ori, Vector3::z());
        assert_eq!(h.center, Vector3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn pedestal_file_keeps_adc_rows_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "ped_fits.txt",
            "# ch,type,ped_peak,ped_peak_err\n\n0,hgain,101.5,0.2\n0 lgain 12.0 0.1\n0,tot,3,0.1\n1,hgain\n",
        );
        let peds = read_pedestals(&path).unwrap();
        assert_eq!(peds.len(), 2);
        assert_eq!(peds.level(0, HitType::Hgain), (101.5, 0.2));
        assert_eq!(peds.level(0, HitType::Lgain), (12.0, 0.1));

        let missing = dir.path().join("none.txt");
        assert!(read_pedestals_or_zero(&missing).unwrap().is_empty());
    }

    #[test]
    fn mean_rows_take_voltage_from_either_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "summary_mean_all.txt",
            "# ch,type,voltage,mean,mean_err,rms\n\
             0,hgain,1500,900,1.5,40\n\
             0,lgain,1500,150,0.5,8,run_1500V_eventhist.json\n\
             1,hgain,800,2,30,run_1600V_eventhist.json\n\
             1,pc_by_h,50,0.1,3,run_1600V_eventhist.json\n\
             2,hgain,800,2,30,run_eventhist.json\n",
        );
        let ingested = read_voltage_means(&path).unwrap();
        let volts: Vec<f64> = ingested.rows.iter().map(|r| r.voltage).collect();
        assert_eq!(volts, vec![1500.0, 1500.0, 1600.0]);
        assert_eq!(ingested.rows[2].mean, 800.0);
        assert_eq!(ingested.row_errors.len(), 1);
    }

    #[test]
    fn gausfit_summary_and_hv_points_parse() {
        let dir = tempfile::tempdir().unwrap();
        let summary = write_file(
            &dir,
            "summary.txt",
            "# ch,type,voltage,peak,peak_err,sigma,sigma_err,chi2_ndf,rough_sigma\n\
             3,hgain,1700,1200,1.1,80,0.9,1.05,95\n\
             3,lgain,1700,190,0.3,12,0.2,0.98\n",
        );
        let fits = read_gausfit_summary(&summary).unwrap();
        assert_eq!(fits.rows.len(), 2);
        assert_eq!(fits.rows[0].rough_sigma, 95.0);
        assert_eq!(fits.rows[1].rough_sigma, 0.0);

        let hv = write_file(&dir, "HV_vs_Charge_ch3.txt", "# HV(V), Charge(pC)\n1500 10.5 1\n1600\t20.25\t0\n");
        let points = read_hv_points(&hv).unwrap();
        assert_eq!(points.rows, vec![(1500.0, 10.5), (1600.0, 20.25)]);
    }
}
