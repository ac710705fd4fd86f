//! Integrated population model.
//!
//! - [`spec`]: declarative per-candidate specification and parameter layout
//! - [`ipm`]: log posterior, latent states and per-observation log-likelihoods

pub mod ipm;
pub mod spec;

pub use ipm::*;
pub use spec::*;
