//! `pmt-calib` library crate.
//!
//! The binary (`pmtcal`) is a thin wrapper around this library so that:
//!
//! - fits and reconstruction are testable without spawning processes
//! - the macros' file formats stay in one place (`io`)
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod hist;
pub mod io;
pub mod math;
pub mod models;
pub mod plot;
pub mod reco;
pub mod report;
