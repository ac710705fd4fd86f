//! `ipm-select` library crate.
//!
//! The binary (`ipm`) is a thin wrapper around this library so that:
//!
//! - the selection pipeline is testable without spawning processes
//! - engines and result stores can be swapped behind their traits

pub mod app;
pub mod cli;
pub mod data;
pub mod diagnostics;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
