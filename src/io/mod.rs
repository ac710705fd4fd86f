//! Input/output helpers.
//!
//! - dataset JSON read/write (`dataset`)
//! - ranking and diagnostics CSV exports (`export`)
//! - best-candidate draws JSON (`draws`)

pub mod dataset;
pub mod draws;
pub mod export;

pub use dataset::*;
pub use draws::*;
pub use export::*;
