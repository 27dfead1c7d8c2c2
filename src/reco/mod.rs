//! Event reading and light-source reconstruction.
//!
//! - hit conversion and event grouping (`hits`)
//! - 4-PMT charge/time light-source fit (`light_source`)
//! - multi-PMT module direction fit and combined source fit (`mpmt`)

pub mod hits;
pub mod light_source;
pub mod mpmt;

pub use hits::*;
pub use light_source::*;
pub use mpmt::*;

use nalgebra::Vector3;

/// Speed of light in air, cm/ns.
pub const C_LIGHT: f64 = 29.970255;
/// Speed of light in water, cm/ns.
pub const C_WATER: f64 = 22.556;
/// Cable/electronics delay subtracted from every hit time, ns.
pub const TIME_CORRECTION: [f64; 4] = [200.0, 200.0, 200.0, 200.0];
/// Single-hit time resolution, ns.
pub const SIGMA_TIME: f64 = 1.0;

/// PMT positions (cm) of the 4-channel test stand, indexed by channel.
pub const PMT_POSITIONS: [[f64; 3]; 4] = [
    [-35.0, 35.0, 80.5],
    [35.0, 35.0, 80.5],
    [-35.0, -35.0, 80.5],
    [35.0, -35.0, 80.5],
];
/// All test-stand PMTs face up.
pub const PMT_DIR: [f64; 3] = [0.0, 0.0, 1.0];

/// Time resolution of a hit.
pub fn sigma_time(_ch: usize, _charge: f64) -> f64 {
    SIGMA_TIME
}

/// Position and facing of stand channel `ch`.
pub fn pmt_placement(ch: usize) -> Option<(Vector3<f64>, Vector3<f64>)> {
    PMT_POSITIONS.get(ch).map(|p| (Vector3::from(*p), Vector3::from(PMT_DIR)))
}
