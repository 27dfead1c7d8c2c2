//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - loads `.env` and sets up logging
//! - parses CLI arguments
//! - reads bundles and tables, runs the fits
//! - prints results and writes the output tables and plots

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use env_logger::Env;

use crate::cli::{
    BundleArgs, Command, GausfitArgs, HistArgs, HvGainArgs, MeanArgs, PedestalArgs, PlotArgs, RecoArgs, RecoMpmtArgs,
    SelectGainArgs, SelectGainMeanArgs, SimKind, SimulateArgs, SpeArgs,
};
use crate::domain::{MpmtHit, PedestalMethod, PedestalTable};
use crate::error::AppError;
use crate::fit::{SpeOptions, channel_from_filename, fit_gaussian, fit_hv_gain, select_gain, select_gain_mean, voltage_from_filename};
use crate::hist::{HistOptions, build_histograms, process_events};
use crate::io::{
    AppendTable, CHARGE_MEAN_SUMMARY_HEADER, EVENTHIST_SUFFIX, HV_GAIN_HEADER, MPMT_HEADER, RECO_HEADER, SPE_RESULT_HEADER,
    TOT_MEAN_SUMMARY_HEADER, hv_gain_line, mpmt_line, output_in, pretty_path, processed_hit_rows, read_bundle_json,
    read_geometry_json, read_gausfit_summary, read_hv_points, read_mpmt_hits, read_pedestals_or_zero, read_raw_hits,
    read_voltage_means, reco_line, resolve_inputs, sibling_output, validate_input_file, write_bundle_json,
    write_gausfit_table, write_hv_charge, write_mean_table, write_pedestal_table, write_peak_table,
    write_processed_hits, write_timefit_table, write_tts_table, write_voltage_values,
};
use crate::models::power_law;
use crate::plot::{GraphLabels, fit_curve_points, render_histogram_ascii, sample_curve, write_fit_svg, write_graph_svg};
use crate::reco::{EventReader, GroupingOptions, fit_light_source, reconstruct_mpmt_event};

pub mod pipeline;

use pipeline::FitPlot;

/// Entry point for the `pmtcal` binary.
pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = crate::cli::Cli::parse();
    match cli.command {
        Command::Hist(args) => handle_hist(args),
        Command::Pedestal(args) => handle_pedestal(args),
        Command::Gausfit(args) => handle_gausfit(args),
        Command::Peak(args) => handle_peak(args),
        Command::Mean(args) => handle_mean(args),
        Command::SelectGain(args) => handle_select_gain(args),
        Command::SelectGainMean(args) => handle_select_gain_mean(args),
        Command::HvGain(args) => handle_hv_gain(args),
        Command::Spe(args) => handle_spe(args),
        Command::Reco(args) => handle_reco(args),
        Command::RecoMpmt(args) => handle_reco_mpmt(args),
        Command::Simulate(args) => handle_simulate(args),
        Command::Plot(args) => handle_plot(args),
    }
}

fn print_header(command: &str, inputs: &[PathBuf]) {
    let names: Vec<String> = inputs.iter().map(|p| pretty_path(p)).collect();
    print!("{}", crate::report::format_run_header(command, &names, chrono::Local::now()));
}

fn write_plots(dir: Option<&Path>, input: &Path, plots: &[FitPlot]) -> Result<(), AppError> {
    for plot in plots {
        let path = output_in(dir, input, &format!("_{}_fit.svg", plot.hist.name));
        write_fit_svg(&path, &plot.hist, &plot.curve, &plot.info)?;
    }
    if !plots.is_empty() {
        log::info!("{} plot(s) written for {}", plots.len(), pretty_path(input));
    }
    Ok(())
}

fn create_dir(dir: &Path) -> Result<(), AppError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| AppError::new(2, format!("Failed to create directory '{}': {e}", dir.display())))
}

/// Optional pedestal file; no file means pedestal 0 everywhere.
fn load_pedestals(path: Option<&Path>) -> Result<PedestalTable, AppError> {
    match path {
        Some(p) => read_pedestals_or_zero(p),
        None => {
            log::warn!("No pedestal file given, using pedestal 0");
            Ok(PedestalTable::new())
        }
    }
}

fn file_voltage(path: &Path) -> f64 {
    let v = voltage_from_filename(&path.to_string_lossy());
    if v < 0.0 {
        log::warn!("No voltage in file name {}, writing -1", pretty_path(path));
    }
    v
}

fn handle_hist(args: HistArgs) -> Result<(), AppError> {
    let input = validate_input_file(&args.input)?;
    print_header("hist", std::slice::from_ref(&input));

    let raw = read_raw_hits(&input)?;
    raw.log_row_errors("raw events");
    if raw.rows.is_empty() {
        return Err(AppError::no_data(format!("No usable rows in {}", pretty_path(&input))));
    }

    let opts = HistOptions {
        time_window: (args.window_min, args.window_max),
        time_scale: args.time_scale,
        nbins: args.nbins,
        ..HistOptions::default()
    };
    let hits = process_events(raw.rows, &opts);
    write_processed_hits(&args.hits_out, &hits)?;

    let source = args
        .bundle_out
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| pretty_path(&args.bundle_out));
    let bundle = build_histograms(&hits, &source, &opts);
    write_bundle_json(&args.bundle_out, &bundle)?;

    println!("{} hit(s) -> {}", hits.len(), pretty_path(&args.hits_out));
    println!("{} histogram(s) -> {}", bundle.histograms.len(), pretty_path(&args.bundle_out));
    Ok(())
}

fn handle_pedestal(args: PedestalArgs) -> Result<(), AppError> {
    let BundleArgs { input, channels, output } = args.bundle;
    let inputs = resolve_inputs(&input, ".json")?;
    print_header("pedestal", &inputs);
    let suffix = match args.method {
        PedestalMethod::Fit => "_fits.txt",
        PedestalMethod::Mean => "_means.txt",
    };

    for input in &inputs {
        let bundle = read_bundle_json(input)?;
        let step = pipeline::pedestal_step(&bundle, channels, args.method, output.plots);
        if step.rows.is_empty() {
            log::warn!("No pedestal histogram usable in {}", pretty_path(input));
        }
        let path = output_in(output.output_dir.as_deref(), input, suffix);
        write_pedestal_table(&path, &step.rows, args.method)?;
        write_plots(output.output_dir.as_deref(), input, &step.plots)?;
        println!("{} pedestal(s) -> {}", step.rows.len(), pretty_path(&path));
    }
    Ok(())
}

fn handle_gausfit(args: GausfitArgs) -> Result<(), AppError> {
    let BundleArgs { input, channels, output } = args.bundle;
    let inputs = resolve_inputs(&input, EVENTHIST_SUFFIX)?;
    print_header("gausfit", &inputs);
    let dir = output.output_dir.as_deref();

    for input in &inputs {
        let bundle = read_bundle_json(input)?;
        let voltage = file_voltage(input);

        if args.mode.wants_charge() {
            let step = pipeline::gausfit_charge_step(&bundle, channels, voltage, output.plots);
            let path = output_in(dir, input, "_gausfit.txt");
            write_gausfit_table(&path, &step.rows)?;
            write_plots(dir, input, &step.plots)?;
            println!("{} charge fit(s) -> {}", step.rows.len(), pretty_path(&path));
        }
        if args.mode.wants_time() {
            let step = pipeline::gausfit_time_step(&bundle, channels, voltage, args.shape, output.plots);
            let path = output_in(dir, input, "_ttsfit.txt");
            write_tts_table(&path, &step.rows)?;
            write_plots(dir, input, &step.plots)?;
            print!("{}", crate::report::format_tts_table(&step.rows));
            println!("{} timing fit(s) -> {}", step.rows.len(), pretty_path(&path));
        }
    }
    Ok(())
}

fn handle_peak(args: BundleArgs) -> Result<(), AppError> {
    let inputs = resolve_inputs(&args.input, EVENTHIST_SUFFIX)?;
    print_header("peak", &inputs);

    for input in &inputs {
        let bundle = read_bundle_json(input)?;
        let rows = pipeline::peak_step(&bundle, args.channels, file_voltage(input));
        let path = output_in(args.output.output_dir.as_deref(), input, "_peak.txt");
        write_peak_table(&path, &rows)?;
        println!("{} peak(s) -> {}", rows.len(), pretty_path(&path));
    }
    Ok(())
}

fn handle_mean(args: MeanArgs) -> Result<(), AppError> {
    let BundleArgs { input, channels, output } = args.bundle;
    let inputs = resolve_inputs(&input, EVENTHIST_SUFFIX)?;
    print_header("mean", &inputs);
    let dir = output.output_dir.as_deref();
    let peds = if args.mode.wants_charge() { load_pedestals(args.pedestal.as_deref())? } else { PedestalTable::new() };
    let conv = args.conversion.conversion();

    for input in &inputs {
        let bundle = read_bundle_json(input)?;

        if args.mode.wants_charge() {
            let rows = crate::fit::charge_means(&bundle, channels, &peds, &conv);
            let path = output_in(dir, input, "_mean.txt");
            write_mean_table(&path, &rows)?;
            println!("{} mean row(s) -> {}", rows.len(), pretty_path(&path));
        }
        if args.mode.wants_time() {
            let step = pipeline::mean_time_step(&bundle, channels, output.plots);
            let path = output_in(dir, input, "_timefit.txt");
            write_timefit_table(&path, &step.rows)?;
            write_plots(dir, input, &step.plots)?;
            print!("{}", crate::report::format_timing_table(&step.rows));
            println!("{} time row(s) -> {}", step.rows.len(), pretty_path(&path));
        }
    }
    Ok(())
}

fn handle_select_gain(args: SelectGainArgs) -> Result<(), AppError> {
    let summary = validate_input_file(&args.summary)?;
    print_header("select-gain", std::slice::from_ref(&summary));

    let fits = read_gausfit_summary(&summary)?;
    fits.log_row_errors("gausfit summary");
    if fits.rows.is_empty() {
        return Err(AppError::no_data(format!("No fit rows in {}", pretty_path(&summary))));
    }
    let peds = read_pedestals_or_zero(&args.pedestal)?;
    let selected = select_gain(&fits.rows, &peds, &args.conversion.conversion());

    create_dir(&args.out_dir)?;
    for (ch, points) in &selected {
        let path = args.out_dir.join(format!("HV_vs_Charge_ch{ch}.txt"));
        write_hv_charge(&path, points)?;
        println!("ch{ch}: {} point(s) -> {}", points.len(), pretty_path(&path));
    }
    if selected.is_empty() {
        log::warn!("No channel had a usable gain");
    }
    Ok(())
}

fn handle_select_gain_mean(args: SelectGainMeanArgs) -> Result<(), AppError> {
    let summary = validate_input_file(&args.summary)?;
    print_header("select-gain-mean", std::slice::from_ref(&summary));

    let means = read_voltage_means(&summary)?;
    means.log_row_errors("mean summary");
    if means.rows.is_empty() {
        return Err(AppError::no_data(format!("No mean rows in {}", pretty_path(&summary))));
    }
    let peds = read_pedestals_or_zero(&args.pedestal)?;
    let (charge, tot) = select_gain_mean(&means.rows, &peds);

    create_dir(&args.out_dir)?;
    let charge_path = args.out_dir.join("summary_HV_vs_Charge_mean.txt");
    write_voltage_values(&charge_path, CHARGE_MEAN_SUMMARY_HEADER, &charge)?;
    let tot_path = args.out_dir.join("summary_HV_vs_ToT_mean.txt");
    write_voltage_values(&tot_path, TOT_MEAN_SUMMARY_HEADER, &tot)?;
    println!("{} charge row(s) -> {}", charge.len(), pretty_path(&charge_path));
    println!("{} ToT row(s) -> {}", tot.len(), pretty_path(&tot_path));
    Ok(())
}

fn handle_hv_gain(args: HvGainArgs) -> Result<(), AppError> {
    print_header("hv-gain", &args.inputs);
    let mut table = args.out.as_deref().map(|p| AppendTable::open(p, HV_GAIN_HEADER)).transpose()?;

    for input in &args.inputs {
        let input = validate_input_file(input)?;
        let points = read_hv_points(&input)?;
        points.log_row_errors("HV table");
        let ch = channel_from_filename(&input.to_string_lossy());
        let fit = fit_hv_gain(&points.rows, ch)?;

        print!("{}", crate::report::format_hv_gain(&fit));
        let line = hv_gain_line(&fit);
        println!("{line}");
        if let Some(t) = table.as_mut() {
            t.write_row(&line)?;
        }

        if args.plots {
            let (lo, hi) = crate::fit::HV_RANGE;
            let curve = sample_curve(|x| power_law(x, fit.b, fit.a), lo, hi, 200);
            let title = format!("HV vs charge, ch{ch}");
            let labels = GraphLabels { title: &title, x: "HV (V)", y: "Charge (pC)" };
            let info = [format!("a = {:.4} +/- {:.4}", fit.a, fit.a_err), format!("b = {:.4e} +/- {:.4e}", fit.b, fit.b_err)];
            write_graph_svg(&sibling_output(&input, "_fit.svg"), labels, &points.rows, &curve, &info)?;
        }
    }
    if let Some(t) = table.as_mut() {
        t.flush()?;
    }
    Ok(())
}

/// Comma-separated triples (`--seeds`, `--source`) are counted here, after
/// clap has split them.
fn three_values(what: &str, values: &[f64]) -> Result<[f64; 3], AppError> {
    values
        .try_into()
        .map_err(|_| AppError::new(1, format!("Expected 3 {what}, got {}", values.len())))
}

fn handle_spe(args: SpeArgs) -> Result<(), AppError> {
    let input = validate_input_file(&args.input)?;
    print_header("spe", std::slice::from_ref(&input));
    let seeds = three_values("seed positions", &args.seeds)?;
    let opts = SpeOptions {
        n_peaks: args.peaks as usize,
        rebin: args.rebin,
        seeds,
        ..SpeOptions::default()
    };

    let bundle = read_bundle_json(&input)?;
    let step = pipeline::spe_step(&bundle, args.channels, &opts, args.output.plots);

    let mut table = args.result_file.as_deref().map(|p| AppendTable::open(p, SPE_RESULT_HEADER)).transpose()?;
    for row in &step.rows {
        if args.verbose {
            if let Some(r) = &row.result {
                println!("--- ch{:02} ---", row.ch);
                print!("{}", crate::report::format_spe_result(r));
            }
        }
        let line = crate::report::spe_result_line(row);
        println!("{line}");
        if let Some(t) = table.as_mut() {
            t.write_row(&line)?;
        }
    }
    if let Some(t) = table.as_mut() {
        t.flush()?;
    }
    write_plots(args.output.output_dir.as_deref(), &input, &step.plots)?;

    if step.rows.iter().all(|r| r.flag != 0) {
        return Err(AppError::no_data(format!("No channel of {} could be fitted", pretty_path(&input))));
    }
    Ok(())
}

fn handle_reco(args: RecoArgs) -> Result<(), AppError> {
    let input = validate_input_file(&args.input)?;
    print_header("reco", std::slice::from_ref(&input));
    let peds = load_pedestals(args.pedestal.as_deref())?;
    let rows = processed_hit_rows(&input)?;
    let mut table = AppendTable::open(&args.out, RECO_HEADER)?;

    let (mut events, mut converged, mut skipped) = (0usize, 0usize, 0usize);
    for event in EventReader::new(rows, &peds, args.conversion.conversion()) {
        if args.max_events.is_some_and(|max| events >= max) {
            break;
        }
        events += 1;
        let hits = event?;
        match fit_light_source(&hits) {
            Ok(fit) => {
                if fit.succeeded() {
                    converged += 1;
                } else {
                    log::debug!("event {}: fit status {}", fit.event_id, fit.status);
                }
                table.write_row(&reco_line(&fit))?;
            }
            Err(e) => {
                skipped += 1;
                log::debug!("event skipped: {e}");
            }
        }
        if events % 1000 == 0 {
            log::info!("{events} events reconstructed");
        }
    }
    table.flush()?;

    println!("{events} event(s), {converged} converged, {skipped} skipped -> {}", pretty_path(&args.out));
    if events == 0 {
        return Err(AppError::no_data(format!("No events in {}", pretty_path(&input))));
    }
    Ok(())
}

fn handle_reco_mpmt(args: RecoMpmtArgs) -> Result<(), AppError> {
    let input = validate_input_file(&args.input)?;
    print_header("reco-mpmt", std::slice::from_ref(&input));
    let geometry = args.geometry.as_deref().map(read_geometry_json).transpose()?;
    let grouping = GroupingOptions {
        tau: args.tau,
        min_hits: args.min_hits,
        ..GroupingOptions::default()
    };

    let hits = read_mpmt_hits(&input)?;
    hits.log_row_errors("mPMT hits");
    let mut by_event: BTreeMap<i64, Vec<MpmtHit>> = BTreeMap::new();
    for h in hits.rows {
        if args.event.is_none_or(|ev| ev == h.event) {
            by_event.entry(h.event).or_default().push(h);
        }
    }
    if by_event.is_empty() {
        return Err(AppError::no_data(match args.event {
            Some(ev) => format!("Event {ev} not found in {}", pretty_path(&input)),
            None => format!("No hits in {}", pretty_path(&input)),
        }));
    }

    let mut table = AppendTable::open(&args.out, MPMT_HEADER)?;
    let (mut fitted, mut skipped) = (0usize, 0usize);
    for (event, event_hits) in &by_event {
        match reconstruct_mpmt_event(event_hits, geometry.as_ref(), &grouping) {
            Ok(fit) => {
                table.write_row(&mpmt_line(&fit))?;
                fitted += 1;
                log::debug!("event {event}: ({:.1}, {:.1}, {:.1}) chi2={:.2}", fit.pos.x, fit.pos.y, fit.pos.z, fit.chi2);
            }
            Err(e) if args.event.is_some() => return Err(e),
            Err(e) => {
                skipped += 1;
                log::debug!("event {event} skipped: {e}");
            }
        }
    }
    table.flush()?;
    println!("{fitted} event(s) fitted, {skipped} skipped -> {}", pretty_path(&args.out));
    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    use crate::data;

    let source = three_values("source coordinates", &args.source)?;
    let written = match args.kind {
        SimKind::Spe => {
            let bundle = data::spe_bundle(args.channels, args.seed)?;
            write_bundle_json(&args.out, &bundle)?;
            format!("{} histogram(s)", bundle.histograms.len())
        }
        SimKind::Pedestal => {
            let bundle = data::pedestal_bundle(args.channels, args.seed)?;
            write_bundle_json(&args.out, &bundle)?;
            format!("{} histogram(s)", bundle.histograms.len())
        }
        SimKind::Eventhist => {
            let bundle = data::eventhist_bundle(args.channels, args.seed)?;
            write_bundle_json(&args.out, &bundle)?;
            format!("{} histogram(s)", bundle.histograms.len())
        }
        SimKind::Raw => {
            let rows = data::raw_events(args.channels, args.events, args.seed)?;
            crate::io::write_raw_hits(&args.out, &rows)?;
            format!("{} raw row(s)", rows.len())
        }
        SimKind::Hits => {
            let conv = crate::domain::Conversion::default();
            let hits = data::light_source_hits(source.into(), 0.0, 4.0e6, args.events, &conv, args.seed)?;
            write_processed_hits(&args.out, &hits)?;
            format!("{} hit(s)", hits.len())
        }
    };
    println!("{written} -> {}", pretty_path(&args.out));
    Ok(())
}

fn handle_plot(args: PlotArgs) -> Result<(), AppError> {
    let input = validate_input_file(&args.input)?;
    let bundle = read_bundle_json(&input)?;
    let hist = bundle.get(&args.hist).ok_or_else(|| {
        AppError::no_data(format!(
            "Histogram '{}' not in {} (available: {})",
            args.hist,
            pretty_path(&input),
            bundle.names().join(", ")
        ))
    })?;

    let curve = if args.fit {
        let sd = hist.std_dev();
        let center = hist.bin_center(hist.maximum_bin());
        let (lo, hi) = (hist.xmin.max(center - 2.0 * sd), hist.xmax.min(center + 2.0 * sd));
        match fit_gaussian(hist, lo, hi) {
            Ok(fit) if fit.valid() => Some(fit_curve_points(&fit, args.width.max(2) * 2)),
            Ok(fit) => {
                log::warn!("Gaussian fit of {} did not converge (status {})", hist.name, fit.status);
                None
            }
            Err(e) => {
                log::warn!("Gaussian fit of {} failed: {e}", hist.name);
                None
            }
        }
    } else {
        None
    };

    println!("{}", render_histogram_ascii(hist, curve.as_deref(), args.width, args.height));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triples_need_exactly_three_values() {
        assert_eq!(three_values("source coordinates", &[-10.0, 5.0, 120.0]).unwrap(), [-10.0, 5.0, 120.0]);
        let err = three_values("seed positions", &[440.0, 470.0]).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(err.message().contains("got 2"));
    }
}
