//! Multi-PMT module reconstruction.
//!
//! Each module (mPMT) sees the light under some incidence direction. The hits
//! of one module are first cleaned with a time clustering, then a direction
//! `(θ, φ)` is fitted in the module frame from the light seen by its PMTs.
//! Modules with a direction become sensors, and the source position and
//! emission time are fitted from all sensor directions plus the individual
//! PMT hit times.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::domain::{MpmtFitResult, MpmtHit, MpmtSensor};
use crate::error::AppError;
use crate::math::{LmOptions, Parameters, minimize};
use crate::reco::{C_WATER, SIGMA_TIME};
use crate::reco::light_source::angular_acceptance;

/// PMT whose orientation is the module axis.
pub const AXIS_PMT: i64 = 19;
/// PMT whose orientation defines φ = 0.
pub const PHI0_PMT: i64 = 1;
/// PMT whose orientation defines φ = 90°.
pub const PHI90_PMT: i64 = 4;

/// Minimum hits kept by the time clustering for a module to be fitted.
pub const MIN_MODULE_HITS: usize = 3;
/// Minimum fitted modules for the source fit.
pub const MIN_SENSORS: usize = 4;
/// Distance scale folded into the direction-fit light model.
const DIRECTION_MODEL_SCALE: f64 = 60.0;
/// Floor on the direction uncertainty used in the source fit.
const MIN_SIGMA_SIN_THETA: f64 = 1e-3;

/// Time clustering parameters (ns).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupingOptions {
    pub tau: f64,
    pub min_hits: usize,
    pub before: f64,
    pub after: f64,
}

impl Default for GroupingOptions {
    fn default() -> Self {
        Self {
            tau: 5.0,
            min_hits: 3,
            before: 0.5,
            after: 6.0,
        }
    }
}

/// Module local frame: `axis` is the θ = 0 direction, `phi0` and `phi90`
/// span the transverse plane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MpmtFrame {
    pub axis: Vector3<f64>,
    pub phi0: Vector3<f64>,
    pub phi90: Vector3<f64>,
}

impl MpmtFrame {
    pub fn direction(&self, theta: f64, phi: f64) -> Vector3<f64> {
        let (st, ct) = theta.sin_cos();
        let (sp, cp) = phi.sin_cos();
        self.axis * ct + self.phi0 * (st * cp) + self.phi90 * (st * sp)
    }
}

/// Module frames keyed by module ID, read from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MpmtGeometry {
    pub modules: BTreeMap<i64, MpmtFrame>,
}

/// Norm below which a vector has no direction.
const MIN_NORM: f64 = 1e-12;

/// `v` with its component along unit vector `u` removed, normalised.
fn orthogonal_to(v: &Vector3<f64>, u: &Vector3<f64>) -> Option<Vector3<f64>> {
    (v - u * v.dot(u)).try_normalize(MIN_NORM)
}

/// Frame from the hit orientations of one module.
///
/// The axis is the orientation of PMT 19, or the mean orientation of all hits
/// when PMT 19 did not fire. `phi0` comes from PMT 1 and `phi90` from PMT 4,
/// both made orthogonal to the axis. Missing ones are completed to a
/// right-handed orthonormal frame.
pub fn frame_from_hits(hits: &[MpmtHit]) -> Option<MpmtFrame> {
    let ori_of = |id: i64| hits.iter().find(|h| h.pmt_id == id).map(|h| h.ori);
    let axis = match ori_of(AXIS_PMT) {
        Some(o) => o.try_normalize(MIN_NORM)?,
        None => hits
            .iter()
            .filter_map(|h| h.ori.try_normalize(MIN_NORM))
            .fold(Vector3::zeros(), |acc, o| acc + o)
            .try_normalize(MIN_NORM)?,
    };

    let phi0 = ori_of(PHI0_PMT).and_then(|o| orthogonal_to(&o, &axis));
    let phi90 = ori_of(PHI90_PMT).and_then(|o| orthogonal_to(&o, &axis));
    let (phi0, phi90) = match (phi0, phi90) {
        (Some(p0), Some(p90)) => (p0, p90),
        (Some(p0), None) => (p0, axis.cross(&p0)),
        (None, Some(p90)) => (p90.cross(&axis), p90),
        (None, None) => {
            let helper = if axis.x.abs() < 0.9 { Vector3::x() } else { Vector3::y() };
            let p0 = orthogonal_to(&helper, &axis)?;
            (p0, axis.cross(&p0))
        }
    };
    Some(MpmtFrame { axis, phi0, phi90 })
}

/// First time cluster of a module's hits, expanded around its seed hit.
///
/// Hits are sorted by time. The seed is the earliest hit with at least
/// `min_hits` hits (itself included) in `[t, t + tau]`. All hits in
/// `[t - before, t + after]` are returned. Empty when no hit qualifies.
pub fn find_expanded_groups(hits: &[MpmtHit], opts: &GroupingOptions) -> Vec<MpmtHit> {
    let mut sorted = hits.to_vec();
    sorted.sort_by(|a, b| a.t.total_cmp(&b.t));

    let seed = sorted.iter().enumerate().find_map(|(i, h)| {
        let count = sorted[i..].iter().take_while(|o| o.t - h.t <= opts.tau).count();
        (count >= opts.min_hits).then_some(h.t)
    });
    let Some(t) = seed else {
        return Vec::new();
    };
    sorted
        .into_iter()
        .filter(|h| h.t >= t - opts.before && h.t <= t + opts.after)
        .collect()
}

/// Map `(θ, φ)` to θ ∈ [0, π], φ ∈ (-π, π].
pub fn normalize_angles(theta: f64, phi: f64) -> (f64, f64) {
    let (mut theta, mut phi) = (theta, phi);
    if theta < 0.0 {
        theta = -theta;
        phi += PI;
    }
    if theta > PI {
        theta = 2.0 * PI - theta;
        phi += PI;
    }
    while phi <= -PI {
        phi += 2.0 * PI;
    }
    while phi > PI {
        phi -= 2.0 * PI;
    }
    (theta, phi)
}

/// Cosine of the angle between two vectors, clamped to [-1, 1]; -1 when
/// either is null.
fn cos_between(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    let (na, nb) = (a.norm(), b.norm());
    if na == 0.0 || nb == 0.0 {
        return -1.0;
    }
    (a.dot(b) / (na * nb)).clamp(-1.0, 1.0)
}

/// Light expected on a PMT facing `ori` for light arriving from `dir`.
pub fn direction_model(ori: &Vector3<f64>, dir: &Vector3<f64>, a: f64, b: f64) -> f64 {
    let cos_alpha = cos_between(ori, dir);
    (a / 1e4 * angular_acceptance(cos_alpha) + b / 1e5).max(0.0) * DIRECTION_MODEL_SCALE
}

/// Incidence direction of one module.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionFit {
    pub theta: f64,
    pub phi: f64,
    pub err_theta: f64,
    pub err_phi: f64,
    pub a: f64,
    pub b: f64,
    pub chi2: f64,
    pub status: i32,
}

/// Fit `(θ, φ, A, B)` to the light seen by the PMTs of one module.
///
/// Hits without light do not contribute. The returned angles are
/// normalised; a fit that did not converge cleanly is an error.
pub fn fit_direction(hits: &[MpmtHit], frame: &MpmtFrame) -> Result<DirectionFit, AppError> {
    let max_l = hits.iter().map(|h| h.l).fold(0.0, f64::max);
    let mut params = Parameters::new(&["theta", "phi", "A", "B"], &[0.0, 0.0, (10.0 * max_l).min(800.0), 30.0]);
    params.set_limits(0, -PI / 2.0, PI / 2.0);
    params.set_limits(1, -2.0 * PI, 2.0 * PI);
    params.set_limits(2, 0.0, 1000.0);
    params.set_limits(3, 0.0, 100.0);

    let outcome = minimize(
        |p, out| {
            out.clear();
            let dir = frame.direction(p[0], p[1]);
            out.extend(hits.iter().map(|h| {
                if h.l > 0.0 {
                    (h.l - direction_model(&h.ori, &dir, p[2], p[3])) / h.l.sqrt()
                } else {
                    0.0
                }
            }));
        },
        &params,
        &LmOptions::default(),
    )?;
    if outcome.status != 0 {
        return Err(AppError::fit(format!("direction fit failed with status {}", outcome.status)));
    }

    let (theta, phi) = normalize_angles(outcome.values[0], outcome.values[1]);
    Ok(DirectionFit {
        theta,
        phi,
        err_theta: outcome.errors[0],
        err_phi: outcome.errors[1],
        a: outcome.values[2],
        b: outcome.values[3],
        chi2: outcome.chi2,
        status: outcome.status,
    })
}

/// Sensor at the module centre pointing along the fitted direction, timed at
/// the mean hit time.
pub fn sensor_from_fit(id: i64, hits: &[MpmtHit], frame: &MpmtFrame, fit: &DirectionFit) -> Option<MpmtSensor> {
    let first = hits.first()?;
    let time = hits.iter().map(|h| h.t).sum::<f64>() / hits.len() as f64;
    Some(MpmtSensor {
        id,
        pos: first.center,
        dir: frame.direction(fit.theta, fit.phi),
        time,
        sigma_sin_theta: fit.err_theta,
        sigma_time: SIGMA_TIME,
    })
}

/// Fit source position and emission time to sensor directions and PMT times.
///
/// The χ² is the sum of `(perp² / σ²)²` over sensors, with `perp² = 1 -
/// (Δ·dir)² / D²`, plus `((D / c - (t - t0)) / σ_t)²` over individual PMT
/// hits, with `c` the speed of light in water.
pub fn fit_mpmt_source(sensors: &[MpmtSensor], pmts: &[MpmtHit]) -> Result<MpmtFitResult, AppError> {
    let last = sensors
        .iter()
        .map(|s| s.time)
        .reduce(f64::max)
        .ok_or_else(|| AppError::no_data("no sensors to fit"))?;

    let mut params = Parameters::new(&["x", "y", "z", "t0"], &[0.0, 0.0, 0.0, last - 50.0]);
    params.set_limits(0, -350.0, 350.0);
    params.set_limits(1, -400.0, 400.0);
    params.set_limits(2, -350.0, 350.0);
    params.set_limits(3, last - 100.0, last);

    let n_dir = sensors.len();
    let residuals = |p: &[f64], out: &mut Vec<f64>| {
        out.clear();
        let src = Vector3::new(p[0], p[1], p[2]);
        for s in sensors {
            let delta = src - s.pos;
            let d = delta.norm();
            if d < 1e-6 {
                out.push(0.0);
                continue;
            }
            let along = delta.dot(&s.dir);
            let perp2 = 1.0 - along * along / (d * d);
            let sigma = s.sigma_sin_theta.abs().max(MIN_SIGMA_SIN_THETA);
            out.push(perp2 / (sigma * sigma));
        }
        for h in pmts {
            let d = (src - h.pos).norm();
            if d < 1e-6 {
                out.push(0.0);
                continue;
            }
            out.push((d / C_WATER - (h.t - p[3])) / SIGMA_TIME);
        }
    };

    let outcome = minimize(&residuals, &params, &LmOptions::default())?;
    let mut r = Vec::new();
    residuals(&outcome.values, &mut r);
    let dir_chi2: f64 = r[..n_dir].iter().map(|v| v * v).sum();
    let time_chi2: f64 = r[n_dir..].iter().map(|v| v * v).sum();
    log::info!("direction chi2 {dir_chi2:.3}, time chi2 {time_chi2:.3}, total {:.3}", outcome.chi2);

    let v = &outcome.values;
    let e = &outcome.errors;
    Ok(MpmtFitResult {
        pos: Vector3::new(v[0], v[1], v[2]),
        t_light: v[3],
        err: Vector3::new(e[0], e[1], e[2]),
        t_error: e[3],
        chi2: outcome.chi2,
        dir_chi2,
        time_chi2,
    })
}

/// Full reconstruction of one event.
///
/// Modules are taken in ID order. Modules whose cluster has fewer than
/// [`MIN_MODULE_HITS`] hits, or whose direction fit fails, are dropped. Fewer
/// than [`MIN_SENSORS`] remaining modules is a no-data error.
pub fn reconstruct_mpmt_event(
    hits: &[MpmtHit],
    geometry: Option<&MpmtGeometry>,
    grouping: &GroupingOptions,
) -> Result<MpmtFitResult, AppError> {
    let mut by_module: BTreeMap<i64, Vec<MpmtHit>> = BTreeMap::new();
    for h in hits {
        by_module.entry(h.mpmt_id).or_default().push(*h);
    }

    let mut sensors = Vec::new();
    let mut pmts = Vec::new();
    for (id, module_hits) in &by_module {
        let used = find_expanded_groups(module_hits, grouping);
        if used.len() < MIN_MODULE_HITS {
            log::debug!("mPMT {id}: {} clustered hit(s), skipped", used.len());
            continue;
        }
        let frame = match geometry.and_then(|g| g.modules.get(id)) {
            Some(f) => *f,
            None => match frame_from_hits(module_hits) {
                Some(f) => f,
                None => {
                    log::warn!("mPMT {id}: no usable orientation frame");
                    continue;
                }
            },
        };
        let fit = match fit_direction(&used, &frame) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("mPMT {id}: {e}");
                continue;
            }
        };
        log::debug!("mPMT {id}: theta={:.3} phi={:.3} err_theta={:.3}", fit.theta, fit.phi, fit.err_theta);
        if let Some(sensor) = sensor_from_fit(*id, &used, &frame, &fit) {
            sensors.push(sensor);
            pmts.extend(used);
        }
    }

    log::info!("{} module(s) with a direction, {} PMT hit(s)", sensors.len(), pmts.len());
    if sensors.len() < MIN_SENSORS {
        return Err(AppError::no_data(format!(
            "only {} module(s) fitted, need {MIN_SENSORS}",
            sensors.len()
        )));
    }
    fit_mpmt_source(&sensors, &pmts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(mpmt_id: i64, pmt_id: i64, t: f64, l: f64, ori: Vector3<f64>) -> MpmtHit {
        MpmtHit {
            event: 0,
            mpmt_id,
            pmt_id,
            pos: Vector3::zeros(),
            l,
            t,
            ori,
            center: Vector3::zeros(),
        }
    }

    fn standard_frame() -> MpmtFrame {
        MpmtFrame {
            axis: Vector3::z(),
            phi0: Vector3::x(),
            phi90: Vector3::y(),
        }
    }

    #[test]
    fn angles_are_normalized() {
        let (t, p) = normalize_angles(-0.5, 0.2);
        assert!((t - 0.5).abs() < 1e-12);
        assert!((p - (0.2 + PI - 2.0 * PI)).abs() < 1e-12);
        let (t, p) = normalize_angles(0.3, 2.5 * PI);
        assert!((t - 0.3).abs() < 1e-12);
        assert!((p - 0.5 * PI).abs() < 1e-12);
        let (t, p) = normalize_angles(4.0, 0.0);
        assert!((t - (2.0 * PI - 4.0)).abs() < 1e-12);
        assert!((p - PI).abs() < 1e-12);
    }

    #[test]
    fn grouping_takes_first_dense_cluster() {
        let o = Vector3::z();
        let hits = vec![
            hit(1, 0, 0.0, 1.0, o),
            hit(1, 1, 20.0, 1.0, o),
            hit(1, 2, 21.0, 1.0, o),
            hit(1, 3, 19.8, 1.0, o),
            hit(1, 4, 24.0, 1.0, o),
            hit(1, 5, 40.0, 1.0, o),
        ];
        let g = find_expanded_groups(&hits, &GroupingOptions::default());
        let ids: Vec<i64> = g.iter().map(|h| h.pmt_id).collect();
        assert_eq!(ids, vec![3, 1, 2, 4]);

        assert!(find_expanded_groups(&hits[..2], &GroupingOptions::default()).is_empty());
    }

    #[test]
    fn derived_frame_is_orthonormal() {
        let hits = vec![
            hit(1, AXIS_PMT, 0.0, 1.0, Vector3::new(0.0, 0.0, 2.0)),
            hit(1, PHI0_PMT, 0.0, 1.0, Vector3::new(1.0, 0.0, 1.0)),
        ];
        let f = frame_from_hits(&hits).unwrap();
        assert_eq!(f.axis, Vector3::z());
        assert!((f.phi0.x - 1.0).abs() < 1e-12);
        assert!((f.phi90.y - 1.0).abs() < 1e-12);
        assert!(f.phi0.dot(&f.axis).abs() < 1e-12);
    }

    #[test]
    fn frame_without_reference_pmts_is_completed() {
        let tilted = Vector3::new(1.0, 0.0, 1.0);
        let hits = vec![hit(2, 7, 0.0, 1.0, tilted), hit(2, 8, 0.0, 1.0, tilted * 3.0)];
        let f = frame_from_hits(&hits).unwrap();
        assert!((f.axis - tilted.normalize()).norm() < 1e-12);
        assert!(f.phi0.dot(&f.axis).abs() < 1e-12);
        assert!((f.axis.cross(&f.phi0) - f.phi90).norm() < 1e-12);

        assert!(frame_from_hits(&[hit(2, 7, 0.0, 1.0, Vector3::zeros())]).is_none());
    }

    #[test]
    fn direction_fit_recovers_incidence() {
        let frame = standard_frame();
        let truth = frame.direction(0.6, 0.8);
        let mut hits = Vec::new();
        let mut id = 0;
        for ring in [0.0_f64, 0.5, 1.0] {
            let n = if ring == 0.0 { 1 } else { 6 };
            for k in 0..n {
                let az = 2.0 * PI * k as f64 / n as f64;
                let ori = Vector3::new(ring.sin() * az.cos(), ring.sin() * az.sin(), ring.cos());
                let l = direction_model(&ori, &truth, 600.0, 20.0);
                hits.push(hit(1, id, 0.0, l, ori));
                id += 1;
            }
        }
        let fit = fit_direction(&hits, &frame).unwrap();
        let got = frame.direction(fit.theta, fit.phi);
        assert!(cos_between(&got, &truth) > 0.999, "theta {} phi {}", fit.theta, fit.phi);
    }

    #[test]
    fn source_fit_from_sensors() {
        let src = Vector3::new(30.0, -20.0, 50.0);
        let t0 = 100.0;
        let centers = [
            Vector3::new(300.0, 0.0, 0.0),
            Vector3::new(-300.0, 0.0, 0.0),
            Vector3::new(0.0, 300.0, 0.0),
            Vector3::new(0.0, -300.0, 0.0),
            Vector3::new(0.0, 0.0, 300.0),
        ];
        let mut sensors = Vec::new();
        let mut pmts = Vec::new();
        for (i, c) in centers.iter().enumerate() {
            let delta = src - c;
            let d = delta.norm();
            let t = t0 + d / C_WATER;
            sensors.push(MpmtSensor {
                id: i as i64,
                pos: *c,
                dir: delta / d,
                time: t,
                sigma_sin_theta: 0.05,
                sigma_time: 1.0,
            });
            let mut h = hit(i as i64, 0, t, 10.0, Vector3::zeros());
            h.pos = *c;
            pmts.push(h);
        }
        let fit = fit_mpmt_source(&sensors, &pmts).unwrap();
        for k in 0..3 {
            assert!((fit.pos[k] - src[k]).abs() < 2.0, "{:?}", fit.pos);
        }
        assert!((fit.t_light - t0).abs() < 1.0);
        assert!(fit.chi2 < 1e-3);
    }

    #[test]
    fn too_few_modules_is_no_data() {
        let o = Vector3::z();
        let hits: Vec<MpmtHit> = (0..3).map(|k| hit(5, k, k as f64, 10.0, o)).collect();
        let err = reconstruct_mpmt_event(&hits, None, &GroupingOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
