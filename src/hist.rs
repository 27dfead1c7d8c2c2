//! Raw event rows to trigger-relative hits and per-channel histograms.
//!
//! Rows of one event are consecutive in the raw table. The first trigger hit
//! of an event is the time reference; events without a trigger are dropped.

use std::collections::{BTreeMap, BTreeSet};

use crate::domain::{Histogram1D, HistogramBundle, HitType, ProcessedHit, RawHit, RawHitKind, event_hist_name};

/// Types histogrammed per channel, in output order.
pub const HIST_TYPES: [HitType; 5] = [HitType::Hgain, HitType::Lgain, HitType::Tot, HitType::TdcDiff, HitType::TimeDiff];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistOptions {
    /// Open window on the raw time difference (s) for a hit to be kept.
    pub time_window: (f64, f64),
    /// Factor applied to the stored time difference (1e9 stores ns).
    pub time_scale: f64,
    pub nbins: usize,
    /// Log progress every this many events.
    pub progress_every: usize,
}

impl Default for HistOptions {
    fn default() -> Self {
        Self {
            time_window: (1.5e-7, 2.5e-7),
            time_scale: 1.0,
            nbins: 400,
            progress_every: 1000,
        }
    }
}

fn process_event(index: i64, rows: &[RawHit], opts: &HistOptions, out: &mut Vec<ProcessedHit>) {
    let Some(trigger) = rows.iter().find(|r| r.kind == RawHitKind::Trigger) else {
        return;
    };
    let (lo, hi) = opts.time_window;
    for hit in rows.iter().filter(|r| r.kind == RawHitKind::Normal) {
        let time_diff = hit.time - trigger.time;
        if time_diff <= lo || time_diff >= hi {
            continue;
        }
        out.push(ProcessedHit {
            event_id: index,
            ch: hit.channel,
            hgain: hit.hgain,
            lgain: hit.lgain,
            tot: hit.tot,
            tdc_diff: hit.tdc - trigger.tdc,
            time_diff: time_diff * opts.time_scale,
        });
    }
}

/// Trigger-relative hits; `eventID` is the 0-based index of the event in the
/// input, counting dropped events too.
pub fn process_events<I>(rows: I, opts: &HistOptions) -> Vec<ProcessedHit>
where
    I: IntoIterator<Item = RawHit>,
{
    let mut out = Vec::new();
    let mut current: Vec<RawHit> = Vec::new();
    let mut index = 0i64;
    for row in rows {
        if current.first().is_some_and(|f| f.event != row.event) {
            process_event(index, &current, opts, &mut out);
            index += 1;
            if opts.progress_every > 0 && index as usize % opts.progress_every == 0 {
                log::info!("processed {index} events");
            }
            current.clear();
        }
        current.push(row);
    }
    if !current.is_empty() {
        process_event(index, &current, opts, &mut out);
        index += 1;
    }
    log::info!("{index} events, {} hits kept", out.len());
    out
}

fn value(hit: &ProcessedHit, kind: HitType) -> f64 {
    match kind {
        HitType::Hgain => hit.hgain,
        HitType::Lgain => hit.lgain,
        HitType::Tot => hit.tot,
        HitType::TdcDiff => hit.tdc_diff,
        HitType::TimeDiff => hit.time_diff,
    }
}

fn title(kind: HitType, ch: usize) -> String {
    match kind {
        HitType::Hgain => format!("High Gain ADC Ch {ch}"),
        HitType::Lgain => format!("Low Gain ADC Ch {ch}"),
        HitType::Tot => format!("Time over Threshold Ch {ch}"),
        HitType::TdcDiff => format!("TDC - Trigger TDC Ch {ch}"),
        HitType::TimeDiff => format!("Time - Trigger Time Ch {ch}"),
    }
}

/// Histogram over `[min - m, max + m]` with `m` 5 % of the span, or
/// `fallback` when all values are equal.
fn auto_range_histogram(name: String, title: String, values: &[f64], nbins: usize, fallback: f64) -> Option<Histogram1D> {
    let min = values.iter().copied().reduce(f64::min)?;
    let max = values.iter().copied().reduce(f64::max)?;
    let span_margin = (max - min) * 0.05;
    let margin = if span_margin == 0.0 { fallback } else { span_margin };
    let mut h = Histogram1D::new(name, title, nbins, min - margin, max + margin);
    for &v in values {
        h.fill(v);
    }
    Some(h)
}

/// One histogram per channel seen and per [`HIST_TYPES`] entry, channels
/// ascending.
pub fn build_histograms(hits: &[ProcessedHit], source: &str, opts: &HistOptions) -> HistogramBundle {
    let channels: BTreeSet<usize> = hits.iter().map(|h| h.ch).collect();
    let mut by_channel: BTreeMap<usize, Vec<&ProcessedHit>> = BTreeMap::new();
    for h in hits {
        by_channel.entry(h.ch).or_default().push(h);
    }

    let mut bundle = HistogramBundle::new(source);
    for ch in channels {
        let Some(ch_hits) = by_channel.get(&ch) else {
            continue;
        };
        for kind in HIST_TYPES {
            let values: Vec<f64> = ch_hits.iter().map(|h| value(h, kind)).collect();
            let fallback = if kind == HitType::TimeDiff { 1e-9 * opts.time_scale } else { 1.0 };
            if let Some(h) = auto_range_histogram(event_hist_name(kind, ch), title(kind, ch), &values, opts.nbins, fallback) {
                bundle.push(h);
            }
        }
    }
    log::info!("{} histogram(s) for {} channel(s)", bundle.histograms.len(), by_channel.len());
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(event: i64, kind: RawHitKind, channel: usize, hgain: f64, time: f64) -> RawHit {
        RawHit {
            event,
            kind,
            channel,
            hgain,
            lgain: hgain / 8.0,
            tot: 10.0,
            tdc: time * 1e9,
            time,
        }
    }

    #[test]
    fn hits_are_trigger_relative_and_windowed() {
        let rows = vec![
            raw(10, RawHitKind::Trigger, 15, 0.0, 1.0e-6),
            raw(10, RawHitKind::Normal, 0, 900.0, 1.2e-6),
            raw(10, RawHitKind::Normal, 1, 800.0, 1.4e-6),
            raw(11, RawHitKind::Normal, 0, 700.0, 2.0e-6),
            raw(12, RawHitKind::Trigger, 15, 0.0, 3.0e-6),
            raw(12, RawHitKind::Trigger, 15, 0.0, 3.1e-6),
            raw(12, RawHitKind::Normal, 2, 600.0, 3.2e-6),
        ];
        let hits = process_events(rows, &HistOptions::default());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].event_id, 0);
        assert_eq!(hits[0].ch, 0);
        assert!((hits[0].time_diff - 2.0e-7).abs() < 1e-15);
        assert!((hits[0].tdc_diff - 200.0).abs() < 1e-6);
        assert_eq!(hits[1].event_id, 2);
        assert_eq!(hits[1].ch, 2);
    }

    #[test]
    fn histograms_cover_value_range() {
        let hits: Vec<ProcessedHit> = (0..50)
            .map(|i| ProcessedHit {
                event_id: i,
                ch: (i % 2) as usize,
                hgain: 1000.0 + i as f64,
                lgain: 100.0,
                tot: 5.0,
                tdc_diff: 200.0,
                time_diff: 2.0e-7,
            })
            .collect();
        let b = build_histograms(&hits, "run_eventhist.json", &HistOptions::default());
        assert_eq!(b.histograms.len(), 10);
        let h = b.get("h_hgain_ch0").unwrap();
        assert_eq!(h.nbins, 400);
        assert_eq!(h.entries, 25.0);
        assert_eq!(h.underflow + h.overflow, 0.0);
        let flat = b.get("h_lgain_ch1").unwrap();
        assert_eq!((flat.xmin, flat.xmax), (99.0, 101.0));
        let t = b.get("h_time_diff_ch1").unwrap();
        assert!((t.xmax - t.xmin - 2e-9).abs() < 1e-15);
    }
}
