//! Shared selection pipeline.
//!
//! The CLI and integration tests both go through [`run_selection_with`] so the
//! alignment, fitting and ranking logic is never duplicated. The store and the
//! engine factory are injected; [`run_selection`] wires the on-disk store and
//! the reference engine.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::data::aligner::{AlignedData, DataAligner};
use crate::data::covariate::SummaryRegistry;
use crate::diagnostics::diagnose;
use crate::domain::{Dataset, FitResult, ModelCandidate, RunConfig};
use crate::engine::{EngineFactory, MetropolisFactory};
use crate::error::AppError;
use crate::fit::orchestrator::{CandidateFit, CandidateOutcome, FitOrchestrator, PreparedCandidate};
use crate::fit::selection::{RankingTable, ScoredCandidate, evaluate_loo, rank_candidates};
use crate::fit::store::{FileStore, ResultStore};
use crate::io::{read_dataset_json, write_diagnostics_csv, write_draws_json, write_ranking_csv};
use crate::models::{IpmModel, ModelSpecBuilder};
use crate::report::{StateSummary, summarize_states};

/// Output of one selection run.
#[derive(Debug, Clone)]
pub struct SelectionRun {
    pub data: Arc<AlignedData>,
    pub prepared: Vec<PreparedCandidate>,
    pub fits: Vec<CandidateFit>,
    pub table: RankingTable,
    /// Latent trajectory of the lowest-LOOIC candidate.
    pub best_states: Option<StateSummary>,
}

impl SelectionRun {
    pub fn fit_for(&self, candidate: &ModelCandidate) -> Option<&FitResult> {
        self.fits
            .iter()
            .find(|f| f.candidate.id == candidate.id)
            .and_then(|f| f.outcome.result())
    }

    pub fn best_fit(&self) -> Option<&FitResult> {
        self.table.best().and_then(|row| self.fit_for(&row.candidate))
    }
}

/// Read the dataset, open the file store and run with the reference engine.
pub fn run_selection(config: &RunConfig) -> Result<SelectionRun, AppError> {
    let dataset = read_dataset_json(&config.data_path)?;
    let store = FileStore::open(&config.store_dir)?;
    run_selection_with(config, &dataset, &store, &MetropolisFactory)
}

pub fn run_selection_with(
    config: &RunConfig,
    dataset: &Dataset,
    store: &dyn ResultStore,
    engines: &dyn EngineFactory,
) -> Result<SelectionRun, AppError> {
    if !(config.rhat_threshold.is_finite() && config.rhat_threshold > 1.0) {
        return Err(AppError::config(format!(
            "Rhat threshold must exceed 1; got {}.",
            config.rhat_threshold
        )));
    }

    let registry = SummaryRegistry::with_defaults();
    let data = Arc::new(DataAligner::new(config, &registry).align(dataset)?);
    for id in &config.only {
        if data.covariate(id).is_none() {
            warn!(covariate = %id, "Requested covariate is not part of the aligned data");
        }
    }

    let builder = ModelSpecBuilder::new(data.ages, data.n_yrs, config.harvest)?;
    let prepared = candidates(&data)
        .into_iter()
        .map(|candidate| {
            let spec = builder.build(&candidate, &data)?;
            Ok(PreparedCandidate { candidate, spec })
        })
        .collect::<Result<Vec<_>, AppError>>()?;
    info!(
        candidates = prepared.len(),
        engine = engines.name(),
        store = store.name(),
        "Fitting candidates"
    );

    let orchestrator = FitOrchestrator::new(config, store, engines)?;
    let fits = orchestrator.fit_all(&prepared, &data);

    let scored: Vec<ScoredCandidate> = fits
        .par_iter()
        .map(|fit| score(fit, config.rhat_threshold))
        .collect();
    let table = rank_candidates(scored);

    let best_states = best_state_summary(&table, &prepared, &fits, &data);

    Ok(SelectionRun {
        data,
        prepared,
        fits,
        table,
        best_states,
    })
}

/// Baseline first, then one candidate per aligned covariate.
fn candidates(data: &AlignedData) -> Vec<ModelCandidate> {
    std::iter::once(ModelCandidate::baseline())
        .chain(data.covariates.iter().map(|c| ModelCandidate::with_covariate(c.meta.clone())))
        .collect()
}

fn score(fit: &CandidateFit, rhat_threshold: f64) -> ScoredCandidate {
    match &fit.outcome {
        CandidateOutcome::Fitted { result, cached } => {
            let diagnostics = diagnose(result, rhat_threshold);
            for w in diagnostics.warnings() {
                warn!(warning = %w, "Convergence warning");
            }
            ScoredCandidate {
                candidate: fit.candidate.clone(),
                loo: evaluate_loo(result).map_err(|e| e.to_string()),
                diagnostics: Some(diagnostics),
                cached: *cached,
            }
        }
        CandidateOutcome::Failed { error } => ScoredCandidate {
            candidate: fit.candidate.clone(),
            loo: Err(error.to_string()),
            diagnostics: None,
            cached: false,
        },
    }
}

fn best_state_summary(
    table: &RankingTable,
    prepared: &[PreparedCandidate],
    fits: &[CandidateFit],
    data: &Arc<AlignedData>,
) -> Option<StateSummary> {
    let best = table.best()?;
    let spec = prepared.iter().find(|p| p.candidate.id == best.candidate.id)?.spec.clone();
    let fit = fits
        .iter()
        .find(|f| f.candidate.id == best.candidate.id)?
        .outcome
        .result()?;
    let summary = IpmModel::compile(spec, Arc::clone(data)).and_then(|model| summarize_states(fit, &model));
    match summary {
        Ok(states) => Some(states),
        Err(e) => {
            warn!(candidate = %best.candidate.id, error = %e, "Could not summarize latent states");
            None
        }
    }
}

/// Paths written by [`write_outputs`].
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub ranking: PathBuf,
    pub diagnostics: PathBuf,
    pub draws: Option<PathBuf>,
}

pub fn write_outputs(run: &SelectionRun, output_dir: &Path, with_draws: bool) -> Result<OutputPaths, AppError> {
    fs::create_dir_all(output_dir)
        .map_err(|e| AppError::io(format!("Failed to create output dir '{}': {e}", output_dir.display())))?;

    let ranking = output_dir.join("ranking.csv");
    write_ranking_csv(&ranking, &run.table)?;
    let diagnostics = output_dir.join("diagnostics.csv");
    write_diagnostics_csv(&diagnostics, &run.table)?;

    let draws = match run.best_fit() {
        Some(best) if with_draws => {
            let path = output_dir.join("best_draws.json");
            write_draws_json(&path, best, run.best_states.as_ref())?;
            Some(path)
        }
        _ => None,
    };
    info!(path = %output_dir.display(), "Outputs written");

    Ok(OutputPaths {
        ranking,
        diagnostics,
        draws,
    })
}
