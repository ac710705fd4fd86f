//! Numerical building blocks: log densities and transforms, effective sample
//! size, and Pareto-smoothed importance sampling.

pub mod density;
pub mod ess;
pub mod psis;

pub use density::*;
pub use ess::*;
pub use psis::*;
