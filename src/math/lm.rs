//! Bounded least-squares fits on top of the `levenberg_marquardt` solver.
//!
//! All fits in this crate (histogram curve fits, the HV–gain power law, the
//! light-source reconstructions) are least-squares problems:
//!
//! ```text
//! minimize χ²(p) = Σ r_i(p)²
//! ```
//!
//! where the caller supplies the residual vector. Parameters can be fixed,
//! released and limited between fit stages. The solver only sees the free
//! parameters, in internal coordinates:
//!
//! - a fixed parameter keeps its value and is not passed to the solver
//! - a parameter limited to `[lo, hi]` is mapped as `x = lo + (hi - lo)(sin u + 1)/2`
//! - the covariance is `(JᵀJ)⁻¹` over the free parameters, carried back through
//!   `dx/du` (errors are for Δχ² = 1)

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};

use crate::error::AppError;
use crate::math::invert_symmetric;

/// One fit parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    pub fixed: bool,
}

/// Internal start values stay this far inside `[-1, 1]` so a parameter
/// seeded on a limit can still move.
const EDGE: f64 = 1.0 - 1e-4;

impl Param {
    fn bounds(&self) -> Option<(f64, f64)> {
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) if lo < hi => Some((lo, hi)),
            _ => None,
        }
    }

    fn to_internal(&self, x: f64) -> f64 {
        match self.bounds() {
            Some((lo, hi)) => (2.0 * (x - lo) / (hi - lo) - 1.0).clamp(-EDGE, EDGE).asin(),
            None => x,
        }
    }

    fn to_external(&self, u: f64) -> f64 {
        match self.bounds() {
            Some((lo, hi)) => lo + (hi - lo) * (u.sin() + 1.0) / 2.0,
            None => u,
        }
    }

    /// `dx/du` at internal value `u`.
    fn slope(&self, u: f64) -> f64 {
        match self.bounds() {
            Some((lo, hi)) => (hi - lo) * u.cos() / 2.0,
            None => 1.0,
        }
    }
}

/// Ordered parameter set with fix/release/limit controls.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters {
    params: Vec<Param>,
}

impl Parameters {
    pub fn new(names: &[&str], values: &[f64]) -> Self {
        let params = names
            .iter()
            .enumerate()
            .map(|(i, n)| Param {
                name: n.to_string(),
                value: values.get(i).copied().unwrap_or(0.0),
                lower: None,
                upper: None,
                fixed: false,
            })
            .collect();
        Self { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn value(&self, i: usize) -> f64 {
        self.params.get(i).map(|p| p.value).unwrap_or(0.0)
    }

    pub fn values(&self) -> Vec<f64> {
        self.params.iter().map(|p| p.value).collect()
    }

    pub fn param(&self, i: usize) -> Option<&Param> {
        self.params.get(i)
    }

    pub fn set(&mut self, i: usize, value: f64) {
        if let Some(p) = self.params.get_mut(i) {
            p.value = value;
        }
    }

    pub fn set_all(&mut self, values: &[f64]) {
        for (p, &v) in self.params.iter_mut().zip(values) {
            p.value = v;
        }
    }

    /// Set and freeze a parameter.
    pub fn fix(&mut self, i: usize, value: f64) {
        if let Some(p) = self.params.get_mut(i) {
            p.value = value;
            p.fixed = true;
        }
    }

    /// Unfreeze a parameter and drop its limits.
    pub fn release(&mut self, i: usize) {
        if let Some(p) = self.params.get_mut(i) {
            p.fixed = false;
            p.lower = None;
            p.upper = None;
        }
    }

    pub fn release_all(&mut self) {
        for i in 0..self.params.len() {
            self.release(i);
        }
    }

    /// Set limits on a parameter.
    ///
    /// - `lo < hi`: the parameter becomes free within `[lo, hi]`
    /// - `lo >= hi` with both non-zero: the parameter is fixed at its current value
    /// - `lo == hi == 0`: limits are removed
    pub fn set_limits(&mut self, i: usize, lo: f64, hi: f64) {
        let Some(p) = self.params.get_mut(i) else {
            return;
        };
        if lo < hi {
            p.fixed = false;
            p.lower = Some(lo);
            p.upper = Some(hi);
            p.value = p.value.clamp(lo, hi);
        } else if lo * hi != 0.0 {
            p.fixed = true;
            p.lower = None;
            p.upper = None;
        } else {
            p.lower = None;
            p.upper = None;
        }
    }

    pub fn is_fixed(&self, i: usize) -> bool {
        self.params.get(i).map(|p| p.fixed).unwrap_or(true)
    }

    pub fn n_free(&self) -> usize {
        self.params.iter().filter(|p| !p.fixed).count()
    }

    pub fn free_indices(&self) -> Vec<usize> {
        (0..self.params.len()).filter(|&i| !self.params[i].fixed).collect()
    }

}

/// Solver knobs.
#[derive(Debug, Clone, Copy)]
pub struct LmOptions {
    /// Residual evaluations allowed per free parameter (plus one).
    pub patience: usize,
    /// Relative reduction of χ² and of the step below which the fit is
    /// considered converged.
    pub tolerance: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            patience: 200,
            tolerance: 1e-10,
        }
    }
}

/// Minimizer status codes (Minuit-compatible meaning).
pub mod status {
    /// Converged with a usable covariance matrix.
    pub const CONVERGED: i32 = 0;
    /// Converged but the covariance matrix could not be computed.
    pub const NO_COVARIANCE: i32 = 1;
    /// The solver stopped on a numerical problem.
    pub const FAILED: i32 = 3;
    /// Evaluation limit reached before convergence.
    pub const CALL_LIMIT: i32 = 4;
}

/// Result of a minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct LmOutcome {
    /// Values of all parameters (fixed ones unchanged).
    pub values: Vec<f64>,
    /// Parabolic errors (0 for fixed parameters).
    pub errors: Vec<f64>,
    /// Full `npar × npar` covariance, zero rows/columns for fixed parameters.
    pub covariance: DMatrix<f64>,
    pub chi2: f64,
    pub n_residuals: usize,
    pub n_free: usize,
    pub evaluations: usize,
    pub status: i32,
}

impl LmOutcome {
    /// Degrees of freedom `n_residuals - n_free`.
    pub fn ndf(&self) -> i64 {
        self.n_residuals as i64 - self.n_free as i64
    }

    /// Minuit-style acceptance: converged, or stopped at the call limit.
    pub fn is_usable(&self) -> bool {
        (self.status == status::CONVERGED || self.status == status::CALL_LIMIT)
            && self.values.iter().all(|v| v.is_finite())
            && self.chi2.is_finite()
    }
}

/// Stand-in for a non-finite residual; the step that produced it is rejected.
const PENALTY: f64 = 1e10;

fn sum_sq(r: &[f64]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

fn diff_step(v: f64) -> f64 {
    if v != 0.0 { 1e-6 * v.abs() } else { 1e-6 }
}

/// The free parameters of a [`Parameters`] set as a solver problem.
struct BoundedProblem<'a, F> {
    residuals: &'a F,
    params: &'a Parameters,
    free: &'a [usize],
    /// External values of all parameters; only the fixed ones are read.
    base: Vec<f64>,
    internal: DVector<f64>,
    n_residuals: usize,
}

impl<F> BoundedProblem<'_, F>
where
    F: Fn(&[f64], &mut Vec<f64>),
{
    fn external(&self, internal: &DVector<f64>) -> Vec<f64> {
        let mut p = self.base.clone();
        for (k, &i) in self.free.iter().enumerate() {
            p[i] = self.params.params[i].to_external(internal[k]);
        }
        p
    }

    fn eval(&self, internal: &DVector<f64>) -> Option<DVector<f64>> {
        let mut out = Vec::with_capacity(self.n_residuals);
        (self.residuals)(&self.external(internal), &mut out);
        (out.len() == self.n_residuals).then(|| {
            DVector::from_iterator(
                self.n_residuals,
                out.into_iter().map(|v| if v.is_finite() { v } else { PENALTY }),
            )
        })
    }

    fn slopes(&self) -> Vec<f64> {
        self.free
            .iter()
            .enumerate()
            .map(|(k, &i)| self.params.params[i].slope(self.internal[k]))
            .collect()
    }
}

impl<F> LeastSquaresProblem<f64, Dyn, Dyn> for BoundedProblem<'_, F>
where
    F: Fn(&[f64], &mut Vec<f64>),
{
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.internal.copy_from(x);
    }

    fn params(&self) -> DVector<f64> {
        self.internal.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        self.eval(&self.internal)
    }

    /// Central differences in internal coordinates.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let n = self.internal.len();
        let mut jac = DMatrix::<f64>::zeros(self.n_residuals, n);
        let mut work = self.internal.clone();
        for k in 0..n {
            let u = self.internal[k];
            let h = diff_step(u);
            work[k] = u + h;
            let plus = self.eval(&work)?;
            work[k] = u - h;
            let minus = self.eval(&work)?;
            work[k] = u;
            jac.set_column(k, &((plus - minus) / (2.0 * h)));
        }
        Some(jac)
    }
}

fn status_of(termination: &TerminationReason) -> i32 {
    match termination {
        TerminationReason::ResidualsZero
        | TerminationReason::Orthogonal
        | TerminationReason::Converged { .. }
        | TerminationReason::NoImprovementPossible(_) => status::CONVERGED,
        TerminationReason::LostPatience => status::CALL_LIMIT,
        _ => status::FAILED,
    }
}

/// Minimize `Σ r_i(p)²` where `residuals(p, out)` fills `out` with `r(p)`.
///
/// The residual count must not depend on `p`.
pub fn minimize<F>(residuals: F, params: &Parameters, opts: &LmOptions) -> Result<LmOutcome, AppError>
where
    F: Fn(&[f64], &mut Vec<f64>),
{
    let npar = params.len();
    let free = params.free_indices();
    let nfree = free.len();

    let base: Vec<f64> = params
        .params
        .iter()
        .map(|p| if p.fixed { p.value } else { p.to_external(p.to_internal(p.value)) })
        .collect();
    let mut r = Vec::new();
    residuals(&base, &mut r);
    let m = r.len();

    if !sum_sq(&r).is_finite() {
        return Err(AppError::fit("Initial chi-square is not finite."));
    }
    if m < nfree {
        return Err(AppError::fit(format!(
            "Too few points to fit: {m} residuals for {nfree} free parameters."
        )));
    }

    let internal = DVector::from_iterator(nfree, free.iter().map(|&i| params.params[i].to_internal(base[i])));
    let problem = BoundedProblem {
        residuals: &residuals,
        params,
        free: &free,
        base,
        internal,
        n_residuals: m,
    };

    let (problem, mut code, evaluations) = if nfree == 0 {
        (problem, status::CONVERGED, 0)
    } else {
        let (problem, report) = LevenbergMarquardt::new()
            .with_ftol(opts.tolerance)
            .with_xtol(opts.tolerance)
            .with_patience(opts.patience)
            .minimize(problem);
        log::trace!("solver stopped after {} evaluations: {:?}", report.number_of_evaluations, report.termination);
        (problem, status_of(&report.termination), report.number_of_evaluations)
    };

    let values = problem.external(&problem.internal);
    residuals(&values, &mut r);
    let chi2 = sum_sq(&r);

    let mut covariance = DMatrix::<f64>::zeros(npar, npar);
    let mut errors = vec![0.0; npar];
    if nfree > 0 {
        let internal_cov = problem
            .jacobian()
            .and_then(|jac| invert_symmetric(&(jac.transpose() * &jac)));
        match internal_cov {
            Some(cov) => {
                let d = problem.slopes();
                for (a, &i) in free.iter().enumerate() {
                    for (b, &j) in free.iter().enumerate() {
                        covariance[(i, j)] = d[a] * d[b] * cov[(a, b)];
                    }
                    errors[i] = covariance[(i, i)].max(0.0).sqrt();
                }
            }
            None => {
                if code == status::CONVERGED {
                    code = status::NO_COVARIANCE;
                }
            }
        }
    }

    Ok(LmOutcome {
        values,
        errors,
        covariance,
        chi2,
        n_residuals: m,
        n_free: nfree,
        evaluations,
        status: code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_residuals(xs: &[f64], ys: &[f64]) -> impl Fn(&[f64], &mut Vec<f64>) {
        let xs = xs.to_vec();
        let ys = ys.to_vec();
        move |p: &[f64], out: &mut Vec<f64>| {
            out.clear();
            out.extend(xs.iter().zip(&ys).map(|(x, y)| y - (p[0] + p[1] * x)));
        }
    }

    #[test]
    fn fits_straight_line() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 5.0, 7.0];
        let params = Parameters::new(&["a", "b"], &[0.0, 0.0]);
        let out = minimize(line_residuals(&xs, &ys), &params, &LmOptions::default()).unwrap();
        assert_eq!(out.status, status::CONVERGED);
        assert!((out.values[0] - 1.0).abs() < 1e-6);
        assert!((out.values[1] - 2.0).abs() < 1e-6);
        assert_eq!(out.ndf(), 2);
    }

    #[test]
    fn fixed_parameter_is_not_moved() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 5.0, 7.0];
        let mut params = Parameters::new(&["a", "b"], &[0.0, 0.0]);
        params.fix(0, 0.5);
        let out = minimize(line_residuals(&xs, &ys), &params, &LmOptions::default()).unwrap();
        assert_eq!(out.values[0], 0.5);
        assert_eq!(out.errors[0], 0.0);
        assert_eq!(out.n_free, 1);
        assert_eq!(out.covariance[(0, 0)], 0.0);
    }

    #[test]
    fn limits_are_respected() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 5.0, 7.0];
        let mut params = Parameters::new(&["a", "b"], &[0.0, 1.0]);
        params.set_limits(1, 0.0, 1.5);
        let out = minimize(line_residuals(&xs, &ys), &params, &LmOptions::default()).unwrap();
        assert!(out.values[1] <= 1.5 + 1e-12);
        assert!(out.values[1] > 1.4, "slope pushed to {}", out.values[1]);
    }

    #[test]
    fn line_errors_match_the_normal_equations() {
        // y = 1 + 2x + noise; unit residual weights give var(b) = 1 / Σ(x - x̄)².
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0];
        let ys = [1.1, 2.9, 5.05, 7.0, 8.95];
        let params = Parameters::new(&["a", "b"], &[0.0, 0.0]);
        let out = minimize(line_residuals(&xs, &ys), &params, &LmOptions::default()).unwrap();
        assert_eq!(out.status, status::CONVERGED);
        assert!((out.errors[1] - 0.1f64.sqrt()).abs() < 1e-4, "err(b) = {}", out.errors[1]);
        assert!((out.errors[0] - 0.6f64.sqrt()).abs() < 1e-4, "err(a) = {}", out.errors[0]);

        // A wide limit changes the parametrization, not the answer.
        let mut limited = Parameters::new(&["a", "b"], &[0.0, 0.0]);
        limited.set_limits(1, -10.0, 10.0);
        let lim = minimize(line_residuals(&xs, &ys), &limited, &LmOptions::default()).unwrap();
        assert!((lim.values[1] - out.values[1]).abs() < 1e-5);
        assert!((lim.errors[1] - out.errors[1]).abs() < 1e-4);
    }

    #[test]
    fn equal_nonzero_limits_fix_parameter() {
        let mut params = Parameters::new(&["a"], &[2.0]);
        params.set_limits(0, 3.0, 3.0);
        assert!(params.is_fixed(0));
        params.release(0);
        assert!(!params.is_fixed(0));
        assert_eq!(params.param(0).and_then(|p| p.lower), None);
    }

    #[test]
    fn rejects_underdetermined_problem() {
        let params = Parameters::new(&["a", "b", "c"], &[0.0, 0.0, 0.0]);
        let err = minimize(line_residuals(&[1.0], &[1.0]), &params, &LmOptions::default()).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }
}
