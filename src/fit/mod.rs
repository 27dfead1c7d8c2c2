//! Histogram fitting procedures.
//!
//! - χ² fit adapter over [`crate::math::minimize`] (`curve`)
//! - peak search (`peaks`)
//! - Gaussian charge/pedestal fits (`gauss`)
//! - pedestal + single photoelectron fits (`spe`)
//! - TTS and EMG timing fits (`timing`)
//! - charge means with ADC→pC conversion (`charge`)
//! - gain selection for HV curves (`select`)
//! - HV–gain power law (`hv_gain`)

pub mod charge;
pub mod curve;
pub mod gauss;
pub mod hv_gain;
pub mod peaks;
pub mod select;
pub mod spe;
pub mod timing;

use std::sync::LazyLock;

use regex::Regex;

pub use charge::*;
pub use curve::*;
pub use gauss::*;
pub use hv_gain::*;
pub use peaks::*;
pub use select::*;
pub use spe::*;
pub use timing::*;

static VOLTAGE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(\d+)V").ok());

/// Applied voltage from a run file name such as `run12_1800V_eventhist.json`,
/// or -1 when the name carries none.
pub fn voltage_from_filename(name: &str) -> f64 {
    VOLTAGE_RE
        .as_ref()
        .and_then(|re| re.captures(name))
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(-1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voltage_is_first_number_before_v() {
        assert_eq!(voltage_from_filename("data/run3_1800V_eventhist.json"), 1800.0);
        assert_eq!(voltage_from_filename("1500V_2000V.json"), 1500.0);
        assert_eq!(voltage_from_filename("pedestal.json"), -1.0);
    }
}
