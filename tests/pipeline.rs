use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ipm_select::app::pipeline::{SelectionRun, run_selection_with, write_outputs};
use ipm_select::data::{SimCovariate, SimulationParams, simulate};
use ipm_select::domain::{AgeRange, CandidateId, Dataset, HarvestModel, McmcConfig, ModelCandidate, RunConfig};
use ipm_select::engine::{ChainDraws, EngineFactory, InferenceEngine, MetropolisEngine, MetropolisFactory, ModelBinding};
use ipm_select::error::AppError;
use ipm_select::fit::{CandidateOutcome, MemoryStore, ResultStore};
use ipm_select::io::RANKING_HEADER;
use ipm_select::report::summarize_scalars;

fn dataset(n_yrs: usize, flow_effect: f64) -> Dataset {
    let defaults = SimulationParams::default();
    let covariates = defaults
        .covariates
        .iter()
        .map(|c| SimCovariate {
            effect: if c.id == "flow_max" { flow_effect } else { 0.0 },
            ..c.clone()
        })
        .collect();
    simulate(&SimulationParams {
        n_yrs,
        covariates,
        seed: 11,
        ..defaults
    })
    .unwrap()
    .dataset
}

fn config(mcmc: McmcConfig, only: &[&str]) -> RunConfig {
    RunConfig {
        data_path: "unused.json".into(),
        store_dir: "unused-store".into(),
        output_dir: "unused-out".into(),
        seed: 42,
        mcmc,
        rhat_threshold: 1.1,
        harvest: HarvestModel::Known,
        only: only.iter().map(|s| s.to_string()).collect(),
    }
}

fn quick_mcmc() -> McmcConfig {
    McmcConfig {
        chains: 2,
        adapt_iters: 100,
        max_adapt_attempts: 1,
        burn_in: 100,
        draws: 200,
        thin: 2,
    }
}

/// Reference sampler that never asks for more adaptation.
struct Eager(MetropolisEngine);

impl InferenceEngine for Eager {
    fn name(&self) -> &str {
        "eager-metropolis"
    }

    fn load(&mut self, binding: ModelBinding) -> Result<(), AppError> {
        self.0.load(binding)
    }

    fn adapt(&mut self, iters: usize) -> Result<bool, AppError> {
        self.0.adapt(iters)?;
        Ok(true)
    }

    fn update(&mut self, iters: usize) -> Result<(), AppError> {
        self.0.update(iters)
    }

    fn sample(&mut self, iters: usize, thin: usize) -> Result<ChainDraws, AppError> {
        self.0.sample(iters, thin)
    }
}

/// Counts sessions and misbehaves for selected candidates.
#[derive(Default)]
struct TestFactory {
    sessions: Arc<AtomicUsize>,
    /// This candidate's sessions fail to load.
    fail_on: Option<CandidateId>,
    /// These candidates report "not adapted" for the given number of rounds.
    stall: Vec<(CandidateId, usize)>,
}

struct Gate {
    inner: Eager,
    fail_on: Option<CandidateId>,
    stall: Vec<(CandidateId, usize)>,
    stall_left: usize,
}

impl InferenceEngine for Gate {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn load(&mut self, binding: ModelBinding) -> Result<(), AppError> {
        let candidate = &binding.spec.candidate;
        if self.fail_on.as_ref() == Some(candidate) {
            return Err(AppError::engine("sampler crashed while loading"));
        }
        self.stall_left = self
            .stall
            .iter()
            .find(|(id, _)| id == candidate)
            .map(|(_, rounds)| *rounds)
            .unwrap_or(0);
        self.inner.load(binding)
    }

    fn adapt(&mut self, iters: usize) -> Result<bool, AppError> {
        let adapted = self.inner.adapt(iters)?;
        if self.stall_left > 0 {
            self.stall_left -= 1;
            return Ok(false);
        }
        Ok(adapted)
    }

    fn update(&mut self, iters: usize) -> Result<(), AppError> {
        self.inner.update(iters)
    }

    fn sample(&mut self, iters: usize, thin: usize) -> Result<ChainDraws, AppError> {
        self.inner.sample(iters, thin)
    }
}

impl EngineFactory for TestFactory {
    fn name(&self) -> &str {
        "test"
    }

    fn session(&self) -> Box<dyn InferenceEngine> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Box::new(Gate {
            inner: Eager(MetropolisEngine::default()),
            fail_on: self.fail_on.clone(),
            stall: self.stall.clone(),
            stall_left: 0,
        })
    }
}

fn covariate(id: &str) -> CandidateId {
    CandidateId::Covariate(id.to_string())
}

fn quick_run(data: &Dataset, store: &dyn ResultStore, engines: &dyn EngineFactory) -> SelectionRun {
    run_selection_with(&config(quick_mcmc(), &[]), data, store, engines).unwrap()
}

#[test]
fn baseline_recovers_productivity_from_simulated_data() {
    // Fifteen years, ages 3-6, no harvest and no covariate.
    let data = simulate(&SimulationParams {
        n_yrs: 15,
        ages: AgeRange::new(3, 6),
        maturation_mean: vec![0.1, 0.4, 0.4, 0.1],
        alpha: 2.0,
        beta: 1.0e-4,
        harvest_rate: 0.0,
        covariates: vec![],
        seed: 3,
        ..SimulationParams::default()
    })
    .unwrap()
    .dataset;
    let mcmc = McmcConfig {
        chains: 3,
        adapt_iters: 300,
        max_adapt_attempts: 5,
        burn_in: 1500,
        draws: 1500,
        thin: 2,
    };
    let store = MemoryStore::new();
    let run = run_selection_with(&config(mcmc, &[]), &data, &store, &MetropolisFactory).unwrap();

    assert_eq!(run.table.rows.len(), 1);
    let baseline = run.table.best().expect("baseline should be ranked");
    assert_eq!(baseline.candidate.id, CandidateId::Baseline);
    let fit = run.fit_for(&baseline.candidate).expect("baseline should fit");
    let alpha = summarize_scalars(fit)
        .into_iter()
        .find(|(name, _)| name == "alpha")
        .map(|(_, interval)| interval)
        .unwrap();
    assert!(alpha.median > 1.5 && alpha.median < 3.0, "alpha median {}", alpha.median);
    assert!(alpha.lower <= alpha.median && alpha.median <= alpha.upper);

    let loo = baseline.loo.as_ref().unwrap();
    assert!(loo.looic.is_finite());
    assert_eq!(loo.pointwise_elpd.len(), fit.n_observations());
    assert!(run.best_states.is_some());
}

#[test]
fn failed_candidate_is_reported_and_the_rest_are_ranked() {
    let data = dataset(20, 0.3);
    let factory = TestFactory {
        fail_on: Some(covariate("flow_max")),
        ..TestFactory::default()
    };
    let store = MemoryStore::new();
    let run = quick_run(&data, &store, &factory);

    assert_eq!(run.table.rows.len(), 3);
    let failed: Vec<_> = run.table.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].candidate.id, covariate("flow_max"));
    assert_eq!(failed[0].status(), "failed");
    assert!(failed[0].failure.as_deref().unwrap().contains("sampler crashed"));

    let ranks: Vec<_> = run.table.rows.iter().filter_map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2]);
    assert_eq!(run.table.rows.last().unwrap().rank, None);
    // Failures are not persisted.
    assert_eq!(store.len(), 2);

    // Same ranking as a run that never saw the failing candidate.
    let clean = run_selection_with(
        &config(quick_mcmc(), &["flow_min"]),
        &data,
        &MemoryStore::new(),
        &TestFactory::default(),
    )
    .unwrap();
    let ranked = |run: &SelectionRun| {
        run.table
            .rows
            .iter()
            .filter(|r| r.rank.is_some())
            .map(|r| (r.candidate.id.clone(), r.loo.as_ref().unwrap().looic, r.delta_looic))
            .collect::<Vec<_>>()
    };
    assert_eq!(ranked(&run), ranked(&clean));
}

#[test]
fn adaptation_is_retried_until_it_succeeds() {
    let data = dataset(20, 0.3);
    let factory = TestFactory {
        stall: vec![(CandidateId::Baseline, 2)],
        ..TestFactory::default()
    };
    let mcmc = McmcConfig {
        max_adapt_attempts: 4,
        ..quick_mcmc()
    };
    let run = run_selection_with(&config(mcmc, &[]), &data, &MemoryStore::new(), &factory).unwrap();

    assert_eq!(run.table.failed().count(), 0);
    let baseline = run.fit_for(&ModelCandidate::baseline()).unwrap();
    assert_eq!(baseline.adapt_attempts, 3);
    let other = run.fits.iter().find(|f| f.candidate.id == covariate("flow_min")).unwrap();
    assert_eq!(other.outcome.result().unwrap().adapt_attempts, 1);
}

#[test]
fn exhausted_adaptation_fails_only_that_candidate() {
    let data = dataset(20, 0.3);
    let factory = TestFactory {
        stall: vec![(covariate("flow_max"), 3)],
        ..TestFactory::default()
    };
    let mcmc = McmcConfig {
        max_adapt_attempts: 3,
        ..quick_mcmc()
    };
    let store = MemoryStore::new();
    let run = run_selection_with(&config(mcmc, &[]), &data, &store, &factory).unwrap();

    let failed: Vec<_> = run.table.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].candidate.id, covariate("flow_max"));
    assert_eq!(failed[0].status(), "failed");
    assert!(failed[0].failure.as_deref().unwrap().contains("Adaptation not achieved after 3 rounds"));
    let flow_max = run.fits.iter().find(|f| f.candidate.id == covariate("flow_max")).unwrap();
    assert!(matches!(
        &flow_max.outcome,
        CandidateOutcome::Failed {
            error: AppError::InferenceEngine(_)
        }
    ));

    let ranks: Vec<_> = run.table.rows.iter().filter_map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2]);
    assert!(!store.has(&covariate("flow_max").store_key()));
    assert!(store.has(&CandidateId::Baseline.store_key()));
    assert!(store.has(&covariate("flow_min").store_key()));
}

#[test]
fn second_run_reuses_every_stored_fit() {
    let data = dataset(20, 0.3);
    let store = MemoryStore::new();
    let factory = TestFactory::default();

    let first = quick_run(&data, &store, &factory);
    assert_eq!(factory.sessions.load(Ordering::SeqCst), 3);
    assert!(first.table.rows.iter().all(|r| !r.cached));

    let second = quick_run(&data, &store, &factory);
    assert_eq!(factory.sessions.load(Ordering::SeqCst), 3);
    assert!(second.table.rows.iter().all(|r| r.cached));
    for (a, b) in first.fits.iter().zip(&second.fits) {
        let (a, b) = (a.outcome.result().unwrap(), b.outcome.result().unwrap());
        assert_eq!(a.chains, b.chains);
    }
}

#[test]
fn changed_settings_invalidate_stored_fits() {
    let data = dataset(20, 0.3);
    let store = MemoryStore::new();
    let factory = TestFactory::default();
    quick_run(&data, &store, &factory);

    let longer = McmcConfig {
        draws: 240,
        ..quick_mcmc()
    };
    let run = run_selection_with(&config(longer, &[]), &data, &store, &factory).unwrap();
    assert_eq!(factory.sessions.load(Ordering::SeqCst), 6);
    assert!(run.table.rows.iter().all(|r| !r.cached));
}

#[test]
fn corrupt_store_entry_is_refit() {
    let data = dataset(20, 0.3);
    let store = MemoryStore::new();
    let factory = TestFactory::default();
    quick_run(&data, &store, &factory);

    store.put_raw(&CandidateId::Baseline.store_key(), b"{ not json".to_vec());
    let run = quick_run(&data, &store, &factory);
    assert_eq!(factory.sessions.load(Ordering::SeqCst), 4);
    let baseline = run.table.rows.iter().find(|r| r.candidate.id == CandidateId::Baseline).unwrap();
    assert!(!baseline.cached);
    assert!(store.get(&CandidateId::Baseline.store_key()).unwrap().is_some());
}

#[test]
fn ranking_is_deterministic_for_a_fixed_seed() {
    let data = dataset(20, 0.3);
    let factory = TestFactory::default();
    let a = quick_run(&data, &MemoryStore::new(), &factory);
    let b = quick_run(&data, &MemoryStore::new(), &factory);

    assert_eq!(a.table.rows.len(), b.table.rows.len());
    for (x, y) in a.table.rows.iter().zip(&b.table.rows) {
        assert_eq!(x.candidate.id, y.candidate.id);
        let (lx, ly) = (x.loo.as_ref().unwrap(), y.loo.as_ref().unwrap());
        assert_eq!(lx.looic, ly.looic);
        assert_eq!(lx.pareto_k, ly.pareto_k);
    }
}

#[test]
fn outputs_land_in_the_output_directory() {
    let data = dataset(20, 0.3);
    let run = quick_run(&data, &MemoryStore::new(), &TestFactory::default());
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("nested").join("out");

    let paths = write_outputs(&run, &out, true).unwrap();
    let ranking = std::fs::read_to_string(&paths.ranking).unwrap();
    let mut lines = ranking.lines();
    assert_eq!(lines.next(), Some(RANKING_HEADER));
    assert_eq!(lines.count(), 3);
    assert!(paths.diagnostics.exists());
    assert!(paths.draws.unwrap().exists());

    let without = write_outputs(&run, &out, false).unwrap();
    assert!(without.draws.is_none());
}

#[test]
fn unknown_only_filter_leaves_baseline_alone() {
    let data = dataset(20, 0.3);
    let run = run_selection_with(
        &config(quick_mcmc(), &["snowpack"]),
        &data,
        &MemoryStore::new(),
        &TestFactory::default(),
    )
    .unwrap();
    assert_eq!(run.table.rows.len(), 1);
    assert_eq!(run.table.best().unwrap().candidate.id, CandidateId::Baseline);
}

#[test]
fn ids_differing_only_in_punctuation_keep_separate_store_entries() {
    let mut data = dataset(20, 0.3);
    let mut dotted = data.covariates[0].clone();
    assert_eq!(dotted.id, "flow_max");
    dotted.id = "flow.max".to_string();
    data.covariates.push(dotted);

    let store = MemoryStore::new();
    let factory = TestFactory::default();
    let first = quick_run(&data, &store, &factory);
    assert_eq!(first.table.rows.len(), 4);
    assert_eq!(store.len(), 4);
    assert_eq!(factory.sessions.load(Ordering::SeqCst), 4);

    let second = quick_run(&data, &store, &factory);
    assert_eq!(factory.sessions.load(Ordering::SeqCst), 4);
    assert!(second.table.rows.iter().all(|r| r.cached));
}
