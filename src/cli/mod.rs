//! Command-line parsing for the PMT calibration tool.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! fitting code. Every flag has a default; the output directory, pedestal
//! file and channel count can also come from the environment (or `.env`).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::domain::{AnalysisMode, Conversion, PedestalMethod, TimingShape};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "pmtcal", version, about = "PMT calibration: histogram fits, gain curves and light-source reconstruction")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build trigger-relative hits and per-channel histograms from a raw event table.
    Hist(HistArgs),
    /// Extract pedestal levels from a pedestal-run bundle.
    Pedestal(PedestalArgs),
    /// Two-stage Gaussian fit of charge histograms, TTS fit of timing histograms.
    Gausfit(GausfitArgs),
    /// Maximum-bin position of the charge histograms.
    Peak(BundleArgs),
    /// Charge means (with pC conversion) and EMG time fits.
    Mean(MeanArgs),
    /// Per-channel HV vs charge tables from a Gaussian fit summary.
    SelectGain(SelectGainArgs),
    /// HV vs mean charge and ToT summaries from a charge-mean summary.
    SelectGainMean(SelectGainMeanArgs),
    /// Power-law fit of charge against HV.
    HvGain(HvGainArgs),
    /// Pedestal + single-photoelectron fit of `all_chNN_hgain` histograms.
    Spe(SpeArgs),
    /// Light-source position/time reconstruction on the 4-PMT stand.
    Reco(RecoArgs),
    /// Light-source reconstruction from multi-PMT module hits.
    RecoMpmt(RecoMpmtArgs),
    /// Write synthetic data for trying the other commands.
    Simulate(SimulateArgs),
    /// Print one histogram of a bundle as an ASCII plot.
    Plot(PlotArgs),
}

/// Where result files go (defaults to next to the input).
#[derive(Debug, Args, Clone)]
pub struct OutputArgs {
    /// Directory for result files.
    #[arg(long, env = "PMTCAL_OUTPUT_DIR", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Write an SVG diagnostic plot per fit.
    #[arg(long)]
    pub plots: bool,
}

/// ADC-to-charge conversion constants.
#[derive(Debug, Args, Clone, Copy)]
pub struct ConversionArgs {
    /// High-gain conversion, pC per ADC count.
    #[arg(long, default_value_t = 0.073)]
    pub k_hgain: f64,

    /// Low-gain conversion, pC per ADC count.
    #[arg(long, default_value_t = 0.599)]
    pub k_lgain: f64,

    /// High-gain ADC value from which the low gain is used.
    #[arg(long, default_value_t = 4000.0)]
    pub saturation: f64,
}

impl ConversionArgs {
    pub fn conversion(&self) -> Conversion {
        Conversion {
            k_hgain: self.k_hgain,
            k_lgain: self.k_lgain,
            saturation: self.saturation,
        }
    }
}

#[derive(Debug, Parser, Clone)]
pub struct HistArgs {
    /// Raw event CSV (`event,kind,channel,hgain,lgain,tot,tdc,time`).
    pub input: PathBuf,

    /// Processed hit CSV to write.
    #[arg(long, value_name = "CSV")]
    pub hits_out: PathBuf,

    /// Histogram bundle JSON to write (name it `<run>_eventhist.json`).
    #[arg(long, value_name = "JSON")]
    pub bundle_out: PathBuf,

    /// Lower edge of the open time window (s).
    #[arg(long, default_value_t = 1.5e-7)]
    pub window_min: f64,

    /// Upper edge of the open time window (s).
    #[arg(long, default_value_t = 2.5e-7)]
    pub window_max: f64,

    /// Factor applied to stored time differences (1e9 stores ns).
    #[arg(long, default_value_t = 1.0)]
    pub time_scale: f64,

    /// Bins per histogram.
    #[arg(long, default_value_t = 400)]
    pub nbins: usize,
}

/// A bundle file (or a directory of `*_eventhist.json` bundles).
#[derive(Debug, Parser, Clone)]
pub struct BundleArgs {
    /// Histogram bundle JSON, or a directory searched for bundles.
    pub input: PathBuf,

    /// Number of channels to look at.
    #[arg(long, env = "PMTCAL_CHANNELS", default_value_t = 12)]
    pub channels: usize,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct PedestalArgs {
    #[command(flatten)]
    pub bundle: BundleArgs,

    /// Gaussian fit of the peak, or plain histogram mean.
    #[arg(long, value_enum, default_value_t = PedestalMethod::Fit)]
    pub method: PedestalMethod,
}

#[derive(Debug, Parser, Clone)]
pub struct GausfitArgs {
    #[command(flatten)]
    pub bundle: BundleArgs,

    #[arg(long, value_enum, default_value_t = AnalysisMode::All)]
    pub mode: AnalysisMode,

    /// Peak shape of the timing fit.
    #[arg(long, value_enum, default_value_t = TimingShape::Emg)]
    pub shape: TimingShape,
}

#[derive(Debug, Parser, Clone)]
pub struct MeanArgs {
    #[command(flatten)]
    pub bundle: BundleArgs,

    #[arg(long, value_enum, default_value_t = AnalysisMode::All)]
    pub mode: AnalysisMode,

    /// Pedestal table used for the pC conversion (missing file = pedestal 0).
    #[arg(long, env = "PMTCAL_PEDESTAL", value_name = "FILE")]
    pub pedestal: Option<PathBuf>,

    #[command(flatten)]
    pub conversion: ConversionArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct SelectGainArgs {
    /// Concatenated `_gausfit.txt` rows.
    pub summary: PathBuf,

    /// Pedestal table (missing file = pedestal 0).
    pub pedestal: PathBuf,

    /// Directory for the output tables.
    pub out_dir: PathBuf,

    #[command(flatten)]
    pub conversion: ConversionArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct SelectGainMeanArgs {
    /// Concatenated charge-mean rows (`ch,type[,voltage],mean,mean_err,rms[,source]`).
    pub summary: PathBuf,

    /// Pedestal table (missing file = pedestal 0).
    pub pedestal: PathBuf,

    /// Directory for the output tables.
    pub out_dir: PathBuf,
}

#[derive(Debug, Parser, Clone)]
pub struct HvGainArgs {
    /// `HV_vs_Charge_ch<N>.txt` table(s).
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Append `ch,b,b_err,a,a_err` rows to this file as well.
    #[arg(long, value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Write an SVG plot of each fit next to its input.
    #[arg(long)]
    pub plots: bool,
}

#[derive(Debug, Parser, Clone)]
pub struct SpeArgs {
    /// Histogram bundle JSON with `all_chNN_hgain` histograms.
    pub input: PathBuf,

    /// Number of peaks in the model (1, 2 or 3).
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=3))]
    pub peaks: u8,

    /// Bin grouping before the combined fit.
    #[arg(long, default_value_t = 4)]
    pub rebin: usize,

    /// Number of channels to fit.
    #[arg(long, env = "PMTCAL_CHANNELS", default_value_t = 4)]
    pub channels: usize,

    /// Fallback pedestal, 1 pe and 2 pe positions.
    #[arg(long, value_delimiter = ',', default_values_t = [440.0, 470.0, 500.0])]
    pub seeds: Vec<f64>,

    /// Append `RESULT` lines to this file.
    #[arg(long, value_name = "FILE")]
    pub result_file: Option<PathBuf>,

    /// Print the full result block per channel.
    #[arg(long)]
    pub verbose: bool,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct RecoArgs {
    /// Processed hit CSV (`eventID,ch,hgain,lgain,tot,tdc_diff,time_diff`).
    pub input: PathBuf,

    /// Pedestal table.
    #[arg(long, env = "PMTCAL_PEDESTAL", value_name = "FILE")]
    pub pedestal: Option<PathBuf>,

    /// Reconstruction CSV to append to.
    #[arg(long, value_name = "CSV")]
    pub out: PathBuf,

    /// Stop after this many events.
    #[arg(long)]
    pub max_events: Option<usize>,

    #[command(flatten)]
    pub conversion: ConversionArgs,
}

#[derive(Debug, Parser, Clone)]
pub struct RecoMpmtArgs {
    /// mPMT hit CSV.
    pub input: PathBuf,

    /// Fit CSV to append to.
    #[arg(long, value_name = "CSV")]
    pub out: PathBuf,

    /// Reconstruct only this event.
    #[arg(long)]
    pub event: Option<i64>,

    /// Module frames JSON; without it frames come from the hit orientations.
    #[arg(long, value_name = "JSON")]
    pub geometry: Option<PathBuf>,

    /// Cluster window (ns).
    #[arg(long, default_value_t = 5.0)]
    pub tau: f64,

    /// Hits needed inside the cluster window.
    #[arg(long, default_value_t = 3)]
    pub min_hits: usize,
}

/// What `simulate` writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SimKind {
    /// Bundle of `all_chNN_hgain` SPE spectra.
    Spe,
    /// Bundle of `ped_chNN_<type>` pedestal histograms.
    Pedestal,
    /// Bundle of `h_<type>_chN` event histograms.
    Eventhist,
    /// Raw event CSV for `hist`.
    Raw,
    /// Processed hit CSV of a point source for `reco`.
    Hits,
}

#[derive(Debug, Parser, Clone)]
pub struct SimulateArgs {
    #[arg(value_enum)]
    pub kind: SimKind,

    /// File to write.
    #[arg(long, value_name = "PATH")]
    pub out: PathBuf,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, env = "PMTCAL_CHANNELS", default_value_t = 4)]
    pub channels: usize,

    /// Events for `raw` and `hits`.
    #[arg(long, default_value_t = 1000)]
    pub events: usize,

    /// Source position (cm) for `hits`.
    #[arg(long, value_delimiter = ',', default_values_t = [10.0, -5.0, 150.0], allow_hyphen_values = true)]
    pub source: Vec<f64>,
}

/// Options for plotting a saved histogram.
#[derive(Debug, Parser, Clone)]
pub struct PlotArgs {
    /// Histogram bundle JSON.
    pub input: PathBuf,

    /// Histogram name.
    #[arg(long)]
    pub hist: String,

    /// Overlay a Gaussian fit of the maximum bin region.
    #[arg(long)]
    pub fit: bool,

    /// Plot width (columns).
    #[arg(long, default_value_t = 100)]
    pub width: usize,

    /// Plot height (rows).
    #[arg(long, default_value_t = 25)]
    pub height: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subcommands_with_defaults() {
        let cli = Cli::try_parse_from(["pmtcal", "spe", "run.json", "--peaks", "3"]).unwrap();
        match cli.command {
            Command::Spe(args) => {
                assert_eq!(args.peaks, 3);
                assert_eq!(args.rebin, 4);
                assert_eq!(args.seeds, vec![440.0, 470.0, 500.0]);
            }
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::try_parse_from(["pmtcal", "mean", "run_eventhist.json", "--mode", "time", "--k-hgain", "0.08"]).unwrap();
        match cli.command {
            Command::Mean(args) => {
                assert_eq!(args.mode, AnalysisMode::Time);
                assert_eq!(args.conversion.conversion().k_hgain, 0.08);
                assert_eq!(args.conversion.conversion().k_lgain, 0.599);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_out_of_range_peak_count() {
        assert!(Cli::try_parse_from(["pmtcal", "spe", "run.json", "--peaks", "4"]).is_err());
    }

    #[test]
    fn source_accepts_negative_coordinates() {
        let cli = Cli::try_parse_from(["pmtcal", "simulate", "hits", "--out", "h.csv", "--source", "-10,5,120"]).unwrap();
        match cli.command {
            Command::Simulate(args) => assert_eq!(args.source, vec![-10.0, 5.0, 120.0]),
            other => panic!("unexpected {other:?}"),
        }

        let cli = Cli::try_parse_from(["pmtcal", "spe", "run.json", "--seeds", "400,450,520"]).unwrap();
        match cli.command {
            Command::Spe(args) => assert_eq!(args.seeds, vec![400.0, 450.0, 520.0]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
