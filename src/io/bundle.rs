//! Read/write histogram bundle JSON files.
//!
//! A bundle is the portable stand-in for a histogram file:
//! - the source it was built from and a creation timestamp
//! - every 1-D histogram, with its binning, contents and flows
//!
//! The schema is defined by `domain::HistogramBundle`. Module frames for the
//! mPMT reconstruction use the same JSON conventions.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::domain::HistogramBundle;
use crate::error::AppError;
use crate::reco::MpmtGeometry;

/// Write a histogram bundle JSON file.
pub fn write_bundle_json(path: &Path, bundle: &HistogramBundle) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create bundle JSON '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(file, bundle)
        .map_err(|e| AppError::new(2, format!("Failed to write bundle JSON: {e}")))?;
    Ok(())
}

/// Read a histogram bundle JSON file.
pub fn read_bundle_json(path: &Path) -> Result<HistogramBundle, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(2, format!("Failed to open bundle JSON '{}': {e}", path.display())))?;
    let bundle: HistogramBundle = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| AppError::new(2, format!("Invalid bundle JSON '{}': {e}", path.display())))?;
    for h in &bundle.histograms {
        h.validate()
            .map_err(|e| AppError::new(2, format!("Invalid histogram in '{}': {e}", path.display())))?;
    }
    if bundle.histograms.is_empty() {
        log::warn!("Bundle '{}' contains no histograms", path.display());
    }
    Ok(bundle)
}

/// Read mPMT module frames.
pub fn read_geometry_json(path: &Path) -> Result<MpmtGeometry, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::new(2, format!("Failed to open geometry JSON '{}': {e}", path.display())))?;
    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| AppError::new(2, format!("Invalid geometry JSON '{}': {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Histogram1D;
    use crate::reco::MpmtFrame;
    use nalgebra::Vector3;

    #[test]
    fn bundle_survives_a_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_1500V_eventhist.json");

        let mut h = Histogram1D::new("h_hgain_ch0", "High Gain ADC Ch 0", 10, 0.0, 10.0);
        for x in [0.5, 1.5, 1.5, 12.0, -1.0] {
            h.fill(x);
        }
        let mut bundle = HistogramBundle::new("run_1500V.csv");
        bundle.push(h.clone());

        write_bundle_json(&path, &bundle).unwrap();
        let back = read_bundle_json(&path).unwrap();
        assert_eq!(back.source, "run_1500V.csv");
        assert_eq!(back.get("h_hgain_ch0"), Some(&h));
    }

    #[test]
    fn missing_or_malformed_files_are_input_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert_eq!(read_bundle_json(&missing).unwrap_err().exit_code(), 2);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert_eq!(read_bundle_json(&bad).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn histograms_with_inconsistent_binning_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.json");
        std::fs::write(
            &path,
            r#"{"source":"x.csv","created":"2024-05-01T12:00:00+02:00","histograms":[
                {"name":"all_ch00_hgain","nbins":1000,"xmin":0.0,"xmax":10.0,"contents":[5,6,7],"entries":500}
            ]}"#,
        )
        .unwrap();
        let err = read_bundle_json(&path).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.message().contains("all_ch00_hgain"));

        let empty = dir.path().join("empty.json");
        std::fs::write(
            &empty,
            r#"{"source":"x.csv","created":"2024-05-01T12:00:00+02:00","histograms":[
                {"name":"h","nbins":0,"xmin":0.0,"xmax":1.0,"contents":[]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(read_bundle_json(&empty).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn geometry_keys_modules_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("geom.json");
        std::fs::write(
            &path,
            r#"{"modules":{"7":{"axis":[0,0,1],"phi0":[1,0,0],"phi90":[0,1,0]}}}"#,
        )
        .unwrap();
        let g = read_geometry_json(&path).unwrap();
        assert_eq!(
            g.modules.get(&7),
            Some(&MpmtFrame { axis: Vector3::z(), phi0: Vector3::x(), phi90: Vector3::y() })
        );
    }
}
