//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - age classes and candidate identities (`AgeRange`, `CandidateId`, `ModelCandidate`)
//! - run configuration (`RunConfig`, `McmcConfig`, `HarvestModel`)
//! - raw dataset inputs (`Dataset` and its rows)
//! - persisted fit outputs (`FitResult`, `ChainResult`)
//! - toolchain-stable digests for fingerprints and seeds (`StableDigest`)

pub mod digest;
pub mod types;

pub use digest::StableDigest;
pub use types::*;
