//! Inference-engine boundary.
//!
//! The orchestrator drives sampling through [`InferenceEngine`] sessions and
//! never touches sampler internals. Every session is single-use: one candidate,
//! one `load`, then any number of `adapt` / `update` / `sample` calls.
//!
//! [`MetropolisFactory`] is the bundled reference engine.

use std::sync::Arc;

use crate::data::aligner::AlignedData;
use crate::error::AppError;
use crate::models::ModelSpec;

pub mod metropolis;

pub use metropolis::{MetropolisEngine, MetropolisFactory};

/// Everything an engine needs to sample one candidate.
#[derive(Debug, Clone)]
pub struct ModelBinding {
    pub spec: ModelSpec,
    pub data: Arc<AlignedData>,
    /// One unconstrained starting vector per chain.
    pub inits: Vec<Vec<f64>>,
    pub seed: u64,
}

/// Per-chain retained draws: `chains × kept draws × parameters`.
pub type ChainDraws = Vec<Vec<Vec<f64>>>;

/// A sampler session bound to one model.
pub trait InferenceEngine: Send {
    fn name(&self) -> &str;

    fn load(&mut self, binding: ModelBinding) -> Result<(), AppError>;

    /// Run `iters` adaptation iterations; `true` once the sampler reports it is adapted.
    fn adapt(&mut self, iters: usize) -> Result<bool, AppError>;

    /// Advance every chain by `iters` iterations, discarding the draws.
    fn update(&mut self, iters: usize) -> Result<(), AppError>;

    /// Advance by `iters` iterations, keeping every `thin`-th state.
    fn sample(&mut self, iters: usize, thin: usize) -> Result<ChainDraws, AppError>;
}

/// Opens independent engine sessions; shared across worker threads.
pub trait EngineFactory: Send + Sync {
    fn name(&self) -> &str;

    fn session(&self) -> Box<dyn InferenceEngine>;
}
