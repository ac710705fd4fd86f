//! Input preparation.
//!
//! - [`aligner`]: calendar-year / brood-year alignment of raw series
//! - [`covariate`]: covariate summary functions and their registry
//! - [`simulate`]: synthetic datasets with a known truth

pub mod aligner;
pub mod covariate;
pub mod simulate;

pub use aligner::{AlignedCovariate, AlignedData, DataAligner};
pub use covariate::{SummaryFunction, SummaryRegistry};
pub use simulate::{SimCovariate, Simulation, SimulationParams, SimulationTruth, simulate};
