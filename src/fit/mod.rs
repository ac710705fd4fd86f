//! Candidate fitting and model selection.
//!
//! Responsibilities:
//!
//! - fit each candidate (parallel), reusing stored results when valid
//! - score fits with PSIS-LOO
//! - rank candidates by LOOIC with pairwise standard errors

pub mod orchestrator;
pub mod selection;
pub mod store;

pub use orchestrator::*;
pub use selection::*;
pub use store::*;
