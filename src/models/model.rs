//! Model evaluation for the calibration fit shapes.
//!
//! Every shape is a pure `fn(x, params) -> f64`. Fitting code stays generic by
//! going through [`ModelKind::eval`]; the SPE component functions below share
//! the parameter vector of the total model so derived areas can be computed
//! from a single fit result.

use std::f64::consts::SQRT_2;

use serde::{Deserialize, Serialize};

use crate::math::{erf, erfc};

/// Supported parametric shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Gaussian,
    /// Pedestal + 1 pe Gaussians with a flat 1 pe backscatter plateau.
    Spe2,
    /// Pedestal + 1 pe + 2 pe Gaussians with three backscatter plateaus.
    Spe3,
    /// Exponentially modified Gaussian, rate parameterisation.
    EmgLambda,
    /// Exponentially modified Gaussian, decay-time parameterisation.
    EmgTau,
    AsymGaus,
    ExpGaus,
    PowerLaw,
}

impl ModelKind {
    pub fn n_params(&self) -> usize {
        self.param_names().len()
    }

    pub fn param_names(&self) -> &'static [&'static str] {
        match self {
            ModelKind::Gaussian => &["amp", "mean", "sigma"],
            ModelKind::Spe2 => &["ped_amp", "ped_mean", "ped_sigma", "pe1_amp", "pe1_mean", "pe1_sigma", "bs_frac"],
            ModelKind::Spe3 => &[
                "ped_amp", "ped_mean", "ped_sigma", "pe1_amp", "pe1_mean", "pe1_sigma", "pe2_amp", "pe2_mean", "pe2_sigma",
                "bs_frac",
            ],
            ModelKind::EmgLambda => &["mu", "amp", "sigma", "lambda"],
            ModelKind::EmgTau | ModelKind::ExpGaus => &["amp", "mu", "sigma", "tau"],
            ModelKind::AsymGaus => &["amp", "mu", "sigma_left", "sigma_right"],
            ModelKind::PowerLaw => &["b", "a"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Gaussian => "gaus",
            ModelKind::Spe2 => "spe2",
            ModelKind::Spe3 => "spe3",
            ModelKind::EmgLambda => "emg_lambda",
            ModelKind::EmgTau => "emg",
            ModelKind::AsymGaus => "asym_gaus",
            ModelKind::ExpGaus => "exp_gaus",
            ModelKind::PowerLaw => "power_law",
        }
    }

    /// Evaluate the model at `x`. `p` must hold at least `n_params()` values.
    pub fn eval(&self, x: f64, p: &[f64]) -> f64 {
        match self {
            ModelKind::Gaussian => gaus(x, p[0], p[1], p[2]),
            ModelKind::Spe2 => spe2(x, p),
            ModelKind::Spe3 => spe3(x, p),
            ModelKind::EmgLambda => emg_lambda(x, p[0], p[1], p[2], p[3]),
            ModelKind::EmgTau => emg_tau(x, p[0], p[1], p[2], p[3]),
            ModelKind::AsymGaus => asym_gaus(x, p[0], p[1], p[2], p[3]),
            ModelKind::ExpGaus => exp_gaus(x, p[0], p[1], p[2], p[3]),
            ModelKind::PowerLaw => power_law(x, p[0], p[1]),
        }
    }
}

/// Unnormalised Gaussian `amp · exp(-½((x-mean)/sigma)²)`.
pub fn gaus(x: f64, amp: f64, mean: f64, sigma: f64) -> f64 {
    if sigma == 0.0 {
        return 0.0;
    }
    let z = (x - mean) / sigma;
    amp * (-0.5 * z * z).exp()
}

/// Plateau between two edges: `erf((x-a)/sa) + (1 - erf((x-b)/sb)) - 1`.
fn plateau(x: f64, a: f64, sa: f64, b: f64, sb: f64) -> f64 {
    if sa == 0.0 || sb == 0.0 {
        return 0.0;
    }
    erf((x - a) / sa) + (1.0 - erf((x - b) / sb)) - 1.0
}

fn spe2_backscatter(x: f64, p: &[f64]) -> f64 {
    0.5 * p[6] * p[3] * plateau(x, p[1], p[2], p[4], p[5])
}

fn spe3_backscatter(x: f64, p: &[f64]) -> f64 {
    let first = p[9] * p[3] * plateau(x, p[1], p[2], p[4], p[5]);
    let d71 = p[7] - p[1];
    let d74 = p[7] - p[4];
    let second = if d71 != 0.0 {
        (p[4] - p[1]) / d71 * p[6] * p[9] * p[9] * plateau(x, p[1], p[2], p[7], p[8])
    } else {
        0.0
    };
    let third = if d74 != 0.0 {
        (p[4] - p[1]) / d74 * p[6] * 2.0 * (1.0 - p[9]) * p[9] * plateau(x, p[4], p[5], p[7], p[8])
    } else {
        0.0
    };
    0.5 * (first + second + third)
}

pub fn spe2(x: f64, p: &[f64]) -> f64 {
    gaus(x, p[0], p[1], p[2]) + gaus(x, p[3], p[4], p[5]) + spe2_backscatter(x, p)
}

pub fn spe3(x: f64, p: &[f64]) -> f64 {
    gaus(x, p[0], p[1], p[2]) + gaus(x, p[3], p[4], p[5]) + gaus(x, p[6], p[7], p[8]) + spe3_backscatter(x, p)
}

/// The 1 pe response (Gaussian plus its backscatter plateau).
///
/// `n_peaks` selects which parameter layout `p` follows (2 or 3).
pub fn spe_one_pe_all(x: f64, p: &[f64], n_peaks: usize) -> f64 {
    let pe1 = gaus(x, p[3], p[4], p[5]);
    if n_peaks >= 3 {
        pe1 + 0.5 * p[9] * p[3] * plateau(x, p[1], p[2], p[4], p[5])
    } else {
        pe1 + spe2_backscatter(x, p)
    }
}

/// Backscatter part of the SPE model: the 1 pe plateau for two peaks, all
/// three plateaus for three peaks.
pub fn spe_backscatter(x: f64, p: &[f64], n_peaks: usize) -> f64 {
    if n_peaks >= 3 { spe3_backscatter(x, p) } else { spe2_backscatter(x, p) }
}

pub fn emg_lambda(x: f64, mu: f64, amp: f64, sigma: f64, lambda: f64) -> f64 {
    if sigma <= 0.0 || lambda <= 0.0 {
        return 0.0;
    }
    let s2 = sigma * sigma;
    let v = 0.5 * lambda * (0.5 * lambda * (2.0 * mu + lambda * s2 - 2.0 * x)).exp() * erfc((mu + lambda * s2 - x) / (SQRT_2 * sigma)) * amp;
    if v.is_finite() { v } else { 0.0 }
}

pub fn emg_tau(x: f64, amp: f64, mu: f64, sigma: f64, tau: f64) -> f64 {
    if sigma == 0.0 {
        return 0.0;
    }
    let tau = tau.max(1e-9);
    let v = amp
        * (sigma * sigma / (2.0 * tau * tau) + (mu - x) / tau).exp()
        * erfc((mu - x) / (SQRT_2 * sigma) + sigma / (SQRT_2 * tau));
    if v.is_finite() { v } else { 0.0 }
}

pub fn asym_gaus(x: f64, amp: f64, mu: f64, sigma_left: f64, sigma_right: f64) -> f64 {
    let sigma = if x < mu { sigma_left } else { sigma_right };
    gaus(x, amp, mu, sigma)
}

pub fn exp_gaus(x: f64, amp: f64, mu: f64, sigma: f64, tau: f64) -> f64 {
    if sigma == 0.0 || tau == 0.0 {
        return 0.0;
    }
    let v = amp
        * (sigma * sigma / (2.0 * tau * tau) - (x - mu) / tau).exp()
        * (1.0 - erf(sigma / (SQRT_2 * tau) - (x - mu) / (SQRT_2 * sigma)));
    if v.is_finite() { v } else { 0.0 }
}

pub fn power_law(x: f64, b: f64, a: f64) -> f64 {
    b * x.powf(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::func;

    #[test]
    fn gaussian_peak_value() {
        assert_eq!(ModelKind::Gaussian.eval(1.0, &[5.0, 1.0, 2.0]), 5.0);
        assert_eq!(ModelKind::Gaussian.n_params(), 3);
    }

    #[test]
    fn spe2_without_backscatter_is_two_gaussians() {
        let p = [100.0, 0.0, 0.2, 10.0, 2.0, 0.5, 0.0];
        let x = 2.0;
        let expected = gaus(x, 100.0, 0.0, 0.2) + 10.0;
        assert!((spe2(x, &p) - expected).abs() < 1e-12);
        assert!((spe_one_pe_all(x, &p, 2) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn backscatter_plateau_is_flat_between_peaks() {
        let p = [0.0, 0.0, 0.05, 10.0, 2.0, 0.05, 0.3];
        // Between the edges the erf sum approaches 2, so bs = p6·p3.
        let mid = spe_backscatter(1.0, &p, 2);
        assert!((mid - 0.3 * 10.0).abs() < 1e-6);
        assert!(spe_backscatter(-1.0, &p, 2).abs() < 1e-6);
    }

    #[test]
    fn spe3_components_sum_to_total() {
        let p = [500.0, 0.0, 0.1, 40.0, 2.4, 0.8, 5.0, 4.8, 1.1, 0.25];
        for x in [-0.3, 0.5, 2.4, 4.0, 7.0] {
            let total = spe3(x, &p);
            let parts = gaus(x, p[0], p[1], p[2]) + gaus(x, p[3], p[4], p[5]) + gaus(x, p[6], p[7], p[8]) + spe_backscatter(x, &p, 3);
            assert!((total - parts).abs() < 1e-9);
        }
    }

    #[test]
    fn emg_lambda_is_normalised_to_amplitude() {
        let area = func::integral(|x| emg_lambda(x, 10.0, 3.0, 0.8, 0.5), -10.0, 80.0);
        assert!((area - 3.0).abs() < 1e-4);
        assert_eq!(emg_lambda(1.0, 0.0, 1.0, 0.0, 1.0), 0.0);
        assert_eq!(emg_lambda(1.0, 0.0, 1.0, 1.0, -1.0), 0.0);
    }

    #[test]
    fn emg_tau_peaks_after_mu() {
        let px = func::maximum_x(|x| emg_tau(x, 1.0, 5.0, 0.5, 2.0), 0.0, 30.0);
        assert!(px > 5.0 && px < 7.0);
    }

    #[test]
    fn asym_gaus_uses_side_widths() {
        let l = asym_gaus(-1.0, 1.0, 0.0, 1.0, 2.0);
        let r = asym_gaus(2.0, 1.0, 0.0, 1.0, 2.0);
        assert!((l - r).abs() < 1e-12);
    }

    #[test]
    fn power_law_matches_closed_form() {
        assert!((ModelKind::PowerLaw.eval(2000.0, &[1e-10, 3.0]) - 0.8).abs() < 1e-12);
    }
}
