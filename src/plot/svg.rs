//! SVG diagnostic plots: a histogram or a point graph with its fitted curve.

use std::path::Path;

use plotters::coord::types::RangedCoordf64;
use plotters::prelude::*;

use crate::domain::Histogram1D;
use crate::error::AppError;

const SIZE: (u32, u32) = (1000, 700);

/// Write `hist` as a step line with `curve` overlaid and `info` lines in the
/// top left corner.
pub fn write_fit_svg(path: &Path, hist: &Histogram1D, curve: &[(f64, f64)], info: &[String]) -> Result<(), AppError> {
    draw(path, hist, curve, info)
        .map_err(|e| AppError::new(2, format!("Failed to write plot '{}': {e}", path.display())))?;
    log::debug!("wrote {}", path.display());
    Ok(())
}

fn step_points(hist: &Histogram1D) -> Vec<(f64, f64)> {
    let w = hist.bin_width();
    let mut pts = Vec::with_capacity(2 * hist.nbins + 2);
    pts.push((hist.xmin, 0.0));
    for i in 0..hist.nbins {
        let lo = hist.xmin + i as f64 * w;
        let c = hist.bin_content(i);
        pts.push((lo, c));
        pts.push((lo + w, c));
    }
    pts.push((hist.xmax, 0.0));
    pts
}

fn draw(path: &Path, hist: &Histogram1D, curve: &[(f64, f64)], info: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let y_max = hist
        .contents
        .iter()
        .copied()
        .chain(curve.iter().map(|&(_, y)| y).filter(|y| y.is_finite()))
        .fold(0.0, f64::max);
    let y_max = if y_max > 0.0 { y_max * 1.1 } else { 1.0 };
    let (x0, x1) = if hist.xmax > hist.xmin { (hist.xmin, hist.xmax) } else { (hist.xmin, hist.xmin + 1.0) };

    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let title = if hist.title.is_empty() { hist.name.as_str() } else { hist.title.as_str() };
    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .caption(title, ("sans-serif", 24))
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(x0..x1, 0.0..y_max)?;

    chart
        .configure_mesh()
        .x_desc(hist.name.as_str())
        .y_desc("Entries")
        .draw()?;

    chart.draw_series(LineSeries::new(step_points(hist), &BLUE))?;
    if curve.len() >= 2 {
        chart.draw_series(LineSeries::new(
            curve.iter().copied().filter(|(_, y)| y.is_finite()),
            RED.stroke_width(2),
        ))?;
    }

    draw_info(chart.plotting_area(), info, x0 + 0.02 * (x1 - x0), y_max)?;

    root.present()?;
    Ok(())
}

type Area<'a> = DrawingArea<SVGBackend<'a>, Cartesian2d<RangedCoordf64, RangedCoordf64>>;

fn draw_info(area: &Area<'_>, info: &[String], x: f64, y_max: f64) -> Result<(), Box<dyn std::error::Error>> {
    let text_style = TextStyle::from(("sans-serif", 16).into_font()).color(&BLACK);
    let mut y = y_max * 0.95;
    for line in info {
        area.draw(&Text::new(line.as_str(), (x, y), text_style.clone()))?;
        y -= y_max * 0.04;
    }
    Ok(())
}

/// Axis labels and title of a point graph.
#[derive(Debug, Clone, Copy)]
pub struct GraphLabels<'a> {
    pub title: &'a str,
    pub x: &'a str,
    pub y: &'a str,
}

/// Write `points` as markers with `curve` overlaid.
pub fn write_graph_svg(
    path: &Path,
    labels: GraphLabels<'_>,
    points: &[(f64, f64)],
    curve: &[(f64, f64)],
    info: &[String],
) -> Result<(), AppError> {
    draw_graph(path, labels, points, curve, info)
        .map_err(|e| AppError::new(2, format!("Failed to write plot '{}': {e}", path.display())))?;
    log::debug!("wrote {}", path.display());
    Ok(())
}

fn draw_graph(
    path: &Path,
    labels: GraphLabels<'_>,
    points: &[(f64, f64)],
    curve: &[(f64, f64)],
    info: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let finite = || points.iter().chain(curve).copied().filter(|(x, y)| x.is_finite() && y.is_finite());
    let x0 = finite().map(|p| p.0).fold(f64::INFINITY, f64::min);
    let x1 = finite().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
    let y_max = finite().map(|p| p.1).fold(0.0, f64::max);
    let (x0, x1) = if x0 < x1 { (x0, x1) } else if x0.is_finite() { (x0 - 1.0, x0 + 1.0) } else { (0.0, 1.0) };
    let pad = 0.05 * (x1 - x0);
    let (x0, x1) = (x0 - pad, x1 + pad);
    let y_max = if y_max > 0.0 { y_max * 1.1 } else { 1.0 };

    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(20)
        .caption(labels.title, ("sans-serif", 24))
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(x0..x1, 0.0..y_max)?;

    chart.configure_mesh().x_desc(labels.x).y_desc(labels.y).draw()?;

    chart.draw_series(points.iter().map(|&(x, y)| Circle::new((x, y), 4, BLUE.filled())))?;
    if curve.len() >= 2 {
        chart.draw_series(LineSeries::new(
            curve.iter().copied().filter(|(_, y)| y.is_finite()),
            RED.stroke_width(2),
        ))?;
    }
    draw_info(chart.plotting_area(), info, x0 + 0.02 * (x1 - x0), y_max)?;

    root.present()?;
    Ok(())
}
