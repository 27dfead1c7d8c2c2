//! Domain model shared by fitting, IO and reporting.

pub mod histogram;
pub mod types;

pub use histogram::*;
pub use types::*;
