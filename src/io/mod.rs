//! Input/output helpers.
//!
//! - histogram bundle and geometry JSON (`bundle`)
//! - CSV/text ingest + validation (`ingest`)
//! - summary and per-event exports (`export`)
//! - input discovery and output naming (`discover`)

pub mod bundle;
pub mod discover;
pub mod export;
pub mod ingest;

pub use bundle::*;
pub use discover::*;
pub use export::*;
pub use ingest::*;
