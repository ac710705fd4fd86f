//! Reference engine: component-wise adaptive random-walk Metropolis.
//!
//! Each iteration updates every coordinate of the unconstrained vector in turn
//! with a Gaussian proposal. During adaptation the per-coordinate proposal
//! scales are tuned in batches towards an acceptance rate of 0.44. Chains run
//! in parallel on the rayon pool, each with its own seeded RNG.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::debug;

use crate::engine::{ChainDraws, EngineFactory, InferenceEngine, ModelBinding};
use crate::error::AppError;
use crate::models::IpmModel;

const TARGET_ACCEPTANCE: f64 = 0.44;
const ADAPT_BATCH: usize = 50;
/// Acceptance band in which a coordinate counts as adapted.
const ADAPTED_MIN: f64 = 0.15;
const ADAPTED_MAX: f64 = 0.75;
const INITIAL_SCALE: f64 = 0.1;
const MIN_SCALE: f64 = 1e-6;
const MAX_SCALE: f64 = 10.0;

#[derive(Debug, Clone)]
struct Chain {
    position: Vec<f64>,
    log_density: f64,
    scales: Vec<f64>,
    rng: StdRng,
    /// Number of completed adaptation batches (drives the step decay).
    batches: usize,
}

impl Chain {
    fn new(position: Vec<f64>, log_density: f64, seed: u64) -> Self {
        let dim = position.len();
        Self {
            position,
            log_density,
            scales: vec![INITIAL_SCALE; dim],
            rng: StdRng::seed_from_u64(seed),
            batches: 0,
        }
    }

    /// One full sweep; `accepted[j]` is incremented for each accepted coordinate.
    fn sweep(&mut self, model: &IpmModel, accepted: &mut [usize]) {
        for j in 0..self.position.len() {
            let current = self.position[j];
            let z: f64 = self.rng.sample(StandardNormal);
            self.position[j] = current + self.scales[j] * z;
            let proposed = model.log_density(&self.position);
            let log_u = self.rng.gen_range(0.0_f64..1.0).ln();
            if proposed.is_finite() && log_u < proposed - self.log_density {
                self.log_density = proposed;
                accepted[j] += 1;
            } else {
                self.position[j] = current;
            }
        }
    }

    /// Adaptive sweeps; returns per-coordinate acceptance over the second half.
    fn adapt(&mut self, model: &IpmModel, iters: usize) -> Vec<f64> {
        let dim = self.position.len();
        let mut batch = vec![0usize; dim];
        let mut tail = vec![0usize; dim];
        let tail_start = iters / 2;
        for i in 0..iters {
            let mut step = vec![0usize; dim];
            self.sweep(model, &mut step);
            for j in 0..dim {
                batch[j] += step[j];
                if i >= tail_start {
                    tail[j] += step[j];
                }
            }
            if (i + 1) % ADAPT_BATCH == 0 {
                self.batches += 1;
                let delta = (1.0 / (self.batches as f64).sqrt()).max(0.1);
                for j in 0..dim {
                    let rate = batch[j] as f64 / ADAPT_BATCH as f64;
                    let factor = if rate > TARGET_ACCEPTANCE { delta.exp() } else { (-delta).exp() };
                    self.scales[j] = (self.scales[j] * factor).clamp(MIN_SCALE, MAX_SCALE);
                }
                batch.iter_mut().for_each(|v| *v = 0);
            }
        }
        let n_tail = (iters - tail_start).max(1) as f64;
        tail.iter().map(|&a| a as f64 / n_tail).collect()
    }

    fn is_adapted(&self, rates: &[f64]) -> bool {
        rates.iter().zip(&self.scales).all(|(&rate, &scale)| {
            (ADAPTED_MIN..=ADAPTED_MAX).contains(&rate) || (rate > ADAPTED_MAX && scale >= MAX_SCALE)
        })
    }
}

/// Reference sampler session.
#[derive(Debug, Default)]
pub struct MetropolisEngine {
    model: Option<IpmModel>,
    chains: Vec<Chain>,
}

impl MetropolisEngine {
    fn loaded(&mut self) -> Result<(&IpmModel, &mut Vec<Chain>), AppError> {
        match &self.model {
            Some(model) => Ok((model, &mut self.chains)),
            None => Err(AppError::engine("No model loaded in the Metropolis session.")),
        }
    }
}

impl InferenceEngine for MetropolisEngine {
    fn name(&self) -> &str {
        "metropolis"
    }

    fn load(&mut self, binding: ModelBinding) -> Result<(), AppError> {
        if binding.inits.is_empty() {
            return Err(AppError::engine("At least one chain is required."));
        }
        let seed = binding.seed;
        let model = IpmModel::compile(binding.spec, binding.data)?;
        let mut chains = Vec::with_capacity(binding.inits.len());
        for (c, init) in binding.inits.into_iter().enumerate() {
            if init.len() != model.dim() {
                return Err(AppError::engine(format!(
                    "Initial values for chain {c} have {} entries; the model has {}.",
                    init.len(),
                    model.dim()
                )));
            }
            let lp = model.log_density(&init);
            if !lp.is_finite() {
                return Err(AppError::engine(format!("Initial values for chain {c} have zero density.")));
            }
            let chain_seed = seed ^ (c as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            chains.push(Chain::new(init, lp, chain_seed));
        }
        self.model = Some(model);
        self.chains = chains;
        Ok(())
    }

    fn adapt(&mut self, iters: usize) -> Result<bool, AppError> {
        let (model, chains) = self.loaded()?;
        let adapted: Vec<bool> = chains
            .par_iter_mut()
            .map(|chain| {
                let rates = chain.adapt(model, iters);
                chain.is_adapted(&rates)
            })
            .collect();
        debug!(iters, adapted = ?adapted, "Metropolis adaptation pass");
        Ok(adapted.iter().all(|&a| a))
    }

    fn update(&mut self, iters: usize) -> Result<(), AppError> {
        let (model, chains) = self.loaded()?;
        chains.par_iter_mut().for_each(|chain| {
            let mut accepted = vec![0usize; chain.position.len()];
            for _ in 0..iters {
                chain.sweep(model, &mut accepted);
            }
        });
        Ok(())
    }

    fn sample(&mut self, iters: usize, thin: usize) -> Result<ChainDraws, AppError> {
        if thin == 0 {
            return Err(AppError::engine("Thinning interval must be at least 1."));
        }
        let (model, chains) = self.loaded()?;
        let draws = chains
            .par_iter_mut()
            .map(|chain| {
                let mut accepted = vec![0usize; chain.position.len()];
                let mut kept = Vec::with_capacity(iters / thin);
                for i in 0..iters {
                    chain.sweep(model, &mut accepted);
                    if (i + 1) % thin == 0 {
                        kept.push(chain.position.clone());
                    }
                }
                kept
            })
            .collect();
        Ok(draws)
    }
}

/// Opens [`MetropolisEngine`] sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetropolisFactory;

impl EngineFactory for MetropolisFactory {
    fn name(&self) -> &str {
        "metropolis"
    }

    fn session(&self) -> Box<dyn InferenceEngine> {
        Box::new(MetropolisEngine::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::data::aligner::DataAligner;
    use crate::data::aligner::tests::{small_dataset, test_config};
    use crate::data::covariate::SummaryRegistry;
    use crate::domain::{HarvestModel, ModelCandidate};
    use crate::models::ModelSpecBuilder;

    fn binding(n_chains: usize, seed: u64) -> ModelBinding {
        let config = test_config();
        let registry = SummaryRegistry::with_defaults();
        let data = Arc::new(DataAligner::new(&config, &registry).align(&small_dataset(12)).unwrap());
        let spec = ModelSpecBuilder::new(data.ages, data.n_yrs, HarvestModel::Known)
            .unwrap()
            .build(&ModelCandidate::baseline(), &data)
            .unwrap();
        let model = IpmModel::compile(spec.clone(), data.clone()).unwrap();
        let inits = model.initial_values(n_chains, seed).unwrap();
        ModelBinding { spec, data, inits, seed }
    }

    #[test]
    fn sample_returns_thinned_draws_per_chain() {
        let mut engine = MetropolisFactory.session();
        engine.load(binding(2, 3)).unwrap();
        engine.adapt(50).unwrap();
        engine.update(10).unwrap();
        let draws = engine.sample(20, 4).unwrap();
        assert_eq!(draws.len(), 2);
        assert!(draws.iter().all(|c| c.len() == 5));
        assert!(draws.iter().flatten().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn sessions_with_equal_seeds_are_reproducible() {
        let run = || {
            let mut engine = MetropolisFactory.session();
            engine.load(binding(2, 8)).unwrap();
            engine.update(5).unwrap();
            engine.sample(6, 2).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn calls_before_load_fail() {
        let mut engine = MetropolisEngine::default();
        assert!(matches!(engine.update(1), Err(AppError::InferenceEngine(_))));
        assert!(engine.sample(1, 0).is_err());
    }

    #[test]
    fn mismatched_initial_values_are_rejected() {
        let mut b = binding(1, 1);
        b.inits[0].pop();
        let mut engine = MetropolisEngine::default();
        assert!(matches!(engine.load(b), Err(AppError::InferenceEngine(_))));
    }
}
