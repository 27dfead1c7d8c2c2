//! Mathematical utilities: least squares, bounded fits over the
//! Levenberg–Marquardt solver and 1-D function analysis.

pub mod func;
pub mod lm;
pub mod ols;

pub use lm::*;
pub use ols::*;

pub use statrs::function::erf::{erf, erfc};
