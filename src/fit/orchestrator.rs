//! Fit orchestration: adaptation, burn-in and sampling for each candidate.
//!
//! Per candidate:
//!
//! 1. look the candidate key up in the [`ResultStore`]; a fresh hit is returned
//!    without opening an engine session
//! 2. open a session, load the model binding with per-chain initial values
//! 3. adapt in bounded rounds, burn in, sample with thinning
//! 4. validate draws, derive scalars and per-observation log-likelihoods
//! 5. persist, only after everything above succeeded
//!
//! Candidates run on rayon workers; a failing candidate becomes
//! [`CandidateOutcome::Failed`] and never aborts the others.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::data::aligner::AlignedData;
use crate::domain::{ChainResult, FitResult, ModelCandidate, RunConfig, StableDigest};
use crate::engine::{ChainDraws, EngineFactory, ModelBinding};
use crate::error::AppError;
use crate::fit::store::ResultStore;
use crate::models::{IpmModel, ModelSpec};

/// A candidate together with its built specification.
#[derive(Debug, Clone)]
pub struct PreparedCandidate {
    pub candidate: ModelCandidate,
    pub spec: ModelSpec,
}

#[derive(Debug, Clone)]
pub enum CandidateOutcome {
    Fitted { result: FitResult, cached: bool },
    Failed { error: AppError },
}

impl CandidateOutcome {
    pub fn result(&self) -> Option<&FitResult> {
        match self {
            CandidateOutcome::Fitted { result, .. } => Some(result),
            CandidateOutcome::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CandidateFit {
    pub candidate: ModelCandidate,
    pub outcome: CandidateOutcome,
}

pub struct FitOrchestrator<'a> {
    config: &'a RunConfig,
    store: &'a dyn ResultStore,
    engines: &'a dyn EngineFactory,
}

impl<'a> FitOrchestrator<'a> {
    pub fn new(
        config: &'a RunConfig,
        store: &'a dyn ResultStore,
        engines: &'a dyn EngineFactory,
    ) -> Result<Self, AppError> {
        let mcmc = &config.mcmc;
        if mcmc.chains == 0 {
            return Err(AppError::config("At least one chain is required."));
        }
        if mcmc.thin == 0 || mcmc.draws < mcmc.thin {
            return Err(AppError::config(format!(
                "draws ({}) must be at least thin ({}) and thin must be positive.",
                mcmc.draws, mcmc.thin
            )));
        }
        if mcmc.adapt_iters == 0 || mcmc.max_adapt_attempts == 0 {
            return Err(AppError::config("Adaptation needs positive iterations and attempts."));
        }
        Ok(Self { config, store, engines })
    }

    /// Fit every candidate in parallel. Output order follows `prepared`.
    pub fn fit_all(&self, prepared: &[PreparedCandidate], data: &Arc<AlignedData>) -> Vec<CandidateFit> {
        prepared
            .par_iter()
            .map(|p| CandidateFit {
                candidate: p.candidate.clone(),
                outcome: self.fit_candidate(p, data),
            })
            .collect()
    }

    pub fn fit_candidate(&self, prepared: &PreparedCandidate, data: &Arc<AlignedData>) -> CandidateOutcome {
        let started = Instant::now();
        let id = &prepared.candidate.id;
        match self.try_fit(prepared, data) {
            Ok((result, cached)) => {
                info!(
                    candidate = %id,
                    cached,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Candidate fitted"
                );
                CandidateOutcome::Fitted { result, cached }
            }
            Err(error) => {
                warn!(candidate = %id, error = %error, "Candidate failed");
                CandidateOutcome::Failed { error }
            }
        }
    }

    fn try_fit(&self, prepared: &PreparedCandidate, data: &Arc<AlignedData>) -> Result<(FitResult, bool), AppError> {
        let spec = &prepared.spec;
        let key = prepared.candidate.id.store_key();
        let fingerprint = fit_fingerprint(spec, data)?;
        let mcmc = &self.config.mcmc;

        match self.store.get(&key) {
            Ok(Some(hit)) if hit.fingerprint == fingerprint && hit.mcmc == *mcmc => {
                debug!(candidate = %spec.candidate, store = self.store.name(), "Using stored result");
                return Ok((hit, true));
            }
            Ok(Some(_)) => {
                info!(candidate = %spec.candidate, "Stored result is stale; refitting");
            }
            Ok(None) => {}
            Err(AppError::CacheCorruption(message)) => {
                warn!(candidate = %spec.candidate, error = %message, "Stored result unreadable; refitting");
            }
            Err(other) => return Err(other),
        }

        let model = IpmModel::compile(spec.clone(), Arc::clone(data))?;
        let seed = candidate_seed(self.config.seed, &key);
        let inits = model.initial_values(mcmc.chains, seed)?;

        let mut engine = self.engines.session();
        engine.load(ModelBinding {
            spec: spec.clone(),
            data: Arc::clone(data),
            inits,
            seed,
        })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let adapted = engine.adapt(mcmc.adapt_iters)?;
            debug!(candidate = %spec.candidate, attempt = attempts, adapted, "Adaptation round");
            if adapted {
                break;
            }
            if attempts >= mcmc.max_adapt_attempts {
                return Err(AppError::engine(format!(
                    "Adaptation not achieved after {attempts} rounds of {} iterations.",
                    mcmc.adapt_iters
                )));
            }
        }

        engine.update(mcmc.burn_in)?;
        let draws = engine.sample(mcmc.draws, mcmc.thin)?;
        validate_draws(&draws, mcmc.chains, mcmc.kept_per_chain(), model.dim())?;

        let chains = draws
            .into_iter()
            .map(|chain| derive_chain(&model, chain))
            .collect::<Result<Vec<_>, _>>()?;

        let result = FitResult {
            candidate: spec.candidate.clone(),
            engine: engine.name().to_string(),
            fitted_at: Utc::now(),
            fingerprint,
            mcmc: mcmc.clone(),
            adapt_attempts: attempts,
            param_names: spec.layout.names(),
            scalar_names: model.scalar_names(),
            chains,
        };

        if let Err(e) = self.store.put(&key, &result) {
            warn!(candidate = %spec.candidate, error = %e, "Failed to persist result");
        }
        Ok((result, false))
    }
}

fn validate_draws(draws: &ChainDraws, chains: usize, kept: usize, dim: usize) -> Result<(), AppError> {
    if draws.len() != chains {
        return Err(AppError::engine(format!(
            "Engine returned {} chains; expected {chains}.",
            draws.len()
        )));
    }
    for (c, chain) in draws.iter().enumerate() {
        if chain.len() != kept {
            return Err(AppError::engine(format!(
                "Chain {c} returned {} draws; expected {kept}.",
                chain.len()
            )));
        }
        for (s, draw) in chain.iter().enumerate() {
            if draw.len() != dim {
                return Err(AppError::engine(format!("Chain {c} draw {s} has the wrong dimension.")));
            }
            if draw.iter().any(|v| !v.is_finite()) {
                return Err(AppError::engine(format!("Chain {c} draw {s} is not finite.")));
            }
        }
    }
    Ok(())
}

fn derive_chain(model: &IpmModel, draws: Vec<Vec<f64>>) -> Result<ChainResult, AppError> {
    let mut scalars = Vec::with_capacity(draws.len());
    let mut log_lik = Vec::with_capacity(draws.len());
    for draw in &draws {
        let eval = model
            .evaluate(draw)
            .ok_or_else(|| AppError::engine("Engine returned a draw outside the model's support."))?;
        scalars.push(model.scalars(&eval));
        log_lik.push(eval.log_lik);
    }
    Ok(ChainResult { draws, scalars, log_lik })
}

/// Hash of the aligned data and the full specification.
pub fn fit_fingerprint(spec: &ModelSpec, data: &AlignedData) -> Result<u64, AppError> {
    let spec_json =
        serde_json::to_string(spec).map_err(|e| AppError::io(format!("Failed to encode model spec: {e}")))?;
    Ok(StableDigest::new().u64(data.fingerprint()).str(&spec_json).finish())
}

/// Per-candidate seed derived from the run seed and the candidate key.
pub fn candidate_seed(run_seed: u64, key: &str) -> u64 {
    StableDigest::new().u64(run_seed).str(key).finish()
}
