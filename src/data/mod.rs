//! Synthetic calibration data for `pmtcal simulate` and the tests.

pub mod sample;

pub use sample::*;
