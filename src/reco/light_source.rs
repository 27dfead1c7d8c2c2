//! Point light-source reconstruction from the 4-PMT test stand.
//!
//! Parameters are `[t, x, y, z, A, B]`. Every hit contributes a charge term
//! and a time term:
//!
//! ```text
//! expected = max(0, (A·acc(cosθ) + B) / max(d², 1))
//! acc(c)   = 1 / (1 + exp(-6 (c - 1)))
//! χ²_q     = (q - expected)² / max(q, 1)
//! χ²_t     = ((t_hit - corr) - (d / c + t))² / σ_t²
//! ```
//!
//! where `d` is the source–PMT distance and `cosθ` the angle between the PMT
//! normal and the PMT→source direction.

use nalgebra::Vector3;

use crate::domain::{LightSourceFit, PmtHit};
use crate::error::AppError;
use crate::math::{LmOptions, Parameters, minimize};
use crate::reco::{C_LIGHT, TIME_CORRECTION, sigma_time};

pub const PARAM_NAMES: [&str; 6] = ["t", "x", "y", "z", "A", "B"];
/// Hits closer than this to the source are skipped.
const MIN_DISTANCE: f64 = 1e-3;

pub fn angular_acceptance(cos_theta: f64) -> f64 {
    1.0 / (1.0 + (-6.0 * (cos_theta - 1.0)).exp())
}

pub fn expected_charge(a: f64, b: f64, distance: f64, cos_theta: f64) -> f64 {
    let d2 = (distance * distance).max(1.0);
    ((a * angular_acceptance(cos_theta) + b) / d2).max(0.0)
}

fn time_correction(ch: usize) -> f64 {
    TIME_CORRECTION.get(ch).copied().unwrap_or(0.0)
}

/// Residual pair `(charge, time)` of one hit, `None` when the source sits on
/// the PMT.
fn hit_residuals(hit: &PmtHit, p: &[f64]) -> Option<(f64, f64)> {
    let to_src = Vector3::new(p[1], p[2], p[3]) - hit.pos;
    let dist = to_src.norm();
    if dist < MIN_DISTANCE {
        return None;
    }
    let cos_theta = to_src.dot(&hit.dir) / dist;

    let expected = expected_charge(p[4], p[5], dist, cos_theta);
    let r_q = (hit.charge - expected) / hit.charge.max(1.0).sqrt();

    let observed_t = hit.time - time_correction(hit.ch);
    let r_t = (observed_t - (dist / C_LIGHT + p[0])) / sigma_time(hit.ch, hit.charge);
    Some((r_q, r_t))
}

/// Fit source position and emission time to one event.
///
/// Returns `Err` when the event has no hits or the minimizer cannot run. A
/// fit that ran but did not converge is returned with its status; check
/// [`LightSourceFit::succeeded`].
pub fn fit_light_source(hits: &[PmtHit]) -> Result<LightSourceFit, AppError> {
    let Some(first) = hits.first() else {
        return Err(AppError::no_data("event has no hits"));
    };
    let max_q = hits.iter().map(|h| h.charge).fold(0.0, f64::max);

    let mut params = Parameters::new(&PARAM_NAMES, &[0.0, 0.0, 0.0, 100.0, max_q * 1e4, 0.0]);
    params.set_limits(0, -1000.0, 1000.0);
    for i in 1..=3 {
        params.set_limits(i, -400.0, 400.0);
    }

    let outcome = minimize(
        |p, out| {
            out.clear();
            for hit in hits {
                let (r_q, r_t) = hit_residuals(hit, p).unwrap_or((0.0, 0.0));
                out.push(r_q);
                out.push(r_t);
            }
        },
        &params,
        &LmOptions::default(),
    )?;

    let v = &outcome.values;
    let e = &outcome.errors;
    let fit = LightSourceFit {
        event_id: first.event_id,
        nhits: hits.len(),
        x: v[1],
        y: v[2],
        z: v[3],
        t: v[0],
        err_x: e[1],
        err_y: e[2],
        err_z: e[3],
        err_t: e[0],
        a: v[4],
        b: v[5],
        chi2: outcome.chi2,
        ndf: 2 * hits.len() as i64 - outcome.n_free as i64,
        status: outcome.status,
    };
    log::debug!(
        "event {}: ({:.1}, {:.1}, {:.1}) t={:.2} chi2={:.2} status={}",
        fit.event_id,
        fit.x,
        fit.y,
        fit.z,
        fit.t,
        fit.chi2,
        fit.status
    );
    Ok(fit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reco::{PMT_POSITIONS, pmt_placement};

    fn synthetic_event(src: Vector3<f64>, t0: f64, a: f64) -> Vec<PmtHit> {
        (0..PMT_POSITIONS.len())
            .filter_map(|ch| pmt_placement(ch).map(|placement| (ch, placement)))
            .map(|(ch, (pos, dir))| {
                let to_src = src - pos;
                let d = to_src.norm();
                let cos = to_src.dot(&dir) / d;
                PmtHit {
                    event_id: 9,
                    ch,
                    time: t0 + d / C_LIGHT + TIME_CORRECTION[ch],
                    charge: expected_charge(a, 0.0, d, cos),
                    pos,
                    dir,
                }
            })
            .collect()
    }

    #[test]
    fn acceptance_is_half_at_normal_incidence() {
        assert!((angular_acceptance(1.0) - 0.5).abs() < 1e-12);
        assert!(angular_acceptance(0.0) < angular_acceptance(0.5));
        assert_eq!(expected_charge(-10.0, 0.0, 5.0, 1.0), 0.0);
        assert_eq!(expected_charge(2.0, 0.0, 0.1, 1.0), 1.0);
    }

    #[test]
    fn source_on_axis_is_recovered() {
        let hits = synthetic_event(Vector3::new(0.0, 0.0, 150.0), 5.0, 4.0e6);
        let fit = fit_light_source(&hits).unwrap();
        assert!(fit.succeeded());
        assert_eq!(fit.nhits, 4);
        assert_eq!(fit.event_id, 9);
        assert_eq!(fit.ndf, 2);
        assert!(fit.x.abs() < 1.0 && fit.y.abs() < 1.0, "({}, {})", fit.x, fit.y);
        assert!(fit.chi2 < 1.0);
    }

    #[test]
    fn empty_event_is_rejected() {
        assert_eq!(fit_light_source(&[]).unwrap_err().exit_code(), 3);
    }
}
