//! Conversion of processed hit rows to charge/time hits, grouped per event.

use nalgebra::Vector3;

use crate::domain::{Conversion, HitType, PedestalTable, PmtHit, ProcessedHit};
use crate::error::AppError;
use crate::reco::pmt_placement;

/// Convert one processed row.
///
/// The high-gain ADC is used below the saturation threshold, the low-gain ADC
/// above it. Negative charges are clamped to zero. Channels without a stand
/// position are placed at the origin with a null direction.
pub fn convert_hit(row: &ProcessedHit, peds: &PedestalTable, conv: &Conversion) -> PmtHit {
    let (ped_h, _) = peds.level(row.ch, HitType::Hgain);
    let (ped_l, _) = peds.level(row.ch, HitType::Lgain);
    let charge = if row.hgain >= conv.saturation {
        (row.lgain - ped_l) * conv.k_lgain
    } else {
        (row.hgain - ped_h) * conv.k_hgain
    };
    let (pos, dir) = pmt_placement(row.ch).unwrap_or_else(|| (Vector3::zeros(), Vector3::zeros()));
    PmtHit {
        event_id: row.event_id,
        ch: row.ch,
        time: row.time_diff,
        charge: charge.max(0.0),
        pos,
        dir,
    }
}

/// Groups consecutive rows with the same event ID into events.
///
/// The first row of the next event is held back until the following call.
pub struct EventReader<'a, I> {
    rows: I,
    pending: Option<ProcessedHit>,
    peds: &'a PedestalTable,
    conv: Conversion,
}

impl<'a, I> EventReader<'a, I>
where
    I: Iterator<Item = Result<ProcessedHit, AppError>>,
{
    pub fn new(rows: I, peds: &'a PedestalTable, conv: Conversion) -> Self {
        Self {
            rows,
            pending: None,
            peds,
            conv,
        }
    }
}

impl<I> Iterator for EventReader<'_, I>
where
    I: Iterator<Item = Result<ProcessedHit, AppError>>,
{
    type Item = Result<Vec<PmtHit>, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.pending.take() {
            Some(row) => row,
            None => match self.rows.next()? {
                Ok(row) => row,
                Err(e) => return Some(Err(e)),
            },
        };
        let mut hits = vec![convert_hit(&first, self.peds, &self.conv)];
        for row in self.rows.by_ref() {
            let row = match row {
                Ok(r) => r,
                Err(e) => return Some(Err(e)),
            };
            if row.event_id != first.event_id {
                self.pending = Some(row);
                break;
            }
            hits.push(convert_hit(&row, self.peds, &self.conv));
        }
        Some(Ok(hits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PedestalEntry;
    use crate::reco::PMT_POSITIONS;

    fn row(event_id: i64, ch: usize, hgain: f64, lgain: f64) -> ProcessedHit {
        ProcessedHit {
            event_id,
            ch,
            hgain,
            lgain,
            tot: 0.0,
            tdc_diff: 0.0,
            time_diff: 210.0,
        }
    }

    #[test]
    fn charge_switches_to_low_gain_at_saturation() {
        let mut peds = PedestalTable::new();
        peds.insert(PedestalEntry { ch: 1, kind: HitType::Hgain, mean: 100.0, err: 0.0 });
        peds.insert(PedestalEntry { ch: 1, kind: HitType::Lgain, mean: 10.0, err: 0.0 });
        let conv = Conversion::default();

        let h = convert_hit(&row(0, 1, 1100.0, 50.0), &peds, &conv);
        assert!((h.charge - 1000.0 * 0.073).abs() < 1e-9);
        assert_eq!(h.pos, Vector3::from(PMT_POSITIONS[1]));

        let h = convert_hit(&row(0, 1, 4000.0, 110.0), &peds, &conv);
        assert!((h.charge - 100.0 * 0.599).abs() < 1e-9);

        let h = convert_hit(&row(0, 1, 50.0, 0.0), &peds, &conv);
        assert_eq!(h.charge, 0.0);

        let h = convert_hit(&row(0, 7, 500.0, 0.0), &peds, &conv);
        assert_eq!(h.pos, Vector3::zeros());
        assert_eq!(h.dir.norm(), 0.0);
    }

    #[test]
    fn groups_consecutive_event_ids() {
        let rows = vec![row(3, 0, 500.0, 0.0), row(3, 1, 500.0, 0.0), row(4, 2, 500.0, 0.0), row(3, 0, 500.0, 0.0)];
        let peds = PedestalTable::new();
        let events: Vec<Vec<PmtHit>> = EventReader::new(rows.into_iter().map(Ok), &peds, Conversion::default())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(events.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1, 1]);
        assert_eq!(events[1][0].event_id, 4);

        let empty: Vec<Result<ProcessedHit, AppError>> = Vec::new();
        assert_eq!(EventReader::new(empty.into_iter(), &peds, Conversion::default()).count(), 0);
    }
}
