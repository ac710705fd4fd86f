//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during alignment and fitting
//! - persisted in the result store (JSON)
//! - exported alongside the ranking table

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Inclusive range of ages (years) at which fish return to spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgeRange {
    pub min: usize,
    pub max: usize,
}

impl AgeRange {
    pub fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    /// Number of age classes `A = max - min + 1`.
    pub fn count(self) -> usize {
        self.max + 1 - self.min
    }

    /// Age (years) of the class at `index`.
    pub fn age(self, index: usize) -> usize {
        self.min + index
    }

    pub fn ages(self) -> impl Iterator<Item = usize> {
        self.min..=self.max
    }
}

/// Identity of a model candidate.
///
/// Exactly one baseline exists per run; every other candidate is tied to one
/// covariate identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum CandidateId {
    Baseline,
    Covariate(String),
}

impl CandidateId {
    /// Key used to address the result store.
    ///
    /// Bytes outside `[a-z0-9_-]` are percent-encoded, so distinct ids never
    /// share a key, even on case-insensitive filesystems.
    pub fn store_key(&self) -> String {
        match self {
            CandidateId::Baseline => "baseline".to_string(),
            CandidateId::Covariate(id) => {
                let mut key = String::with_capacity(4 + id.len());
                key.push_str("cov-");
                for b in id.bytes() {
                    if b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_' {
                        key.push(char::from(b));
                    } else {
                        key.push_str(&format!("%{b:02X}"));
                    }
                }
                key
            }
        }
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateId::Baseline => write!(f, "baseline"),
            CandidateId::Covariate(id) => write!(f, "{id}"),
        }
    }
}

/// Covariate metadata carried into the ranking table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CovariateMeta {
    pub id: String,
    /// Summary function name (as resolved by the registry).
    pub summary: String,
    /// Calendar-year offset from the brood year at which the covariate acts.
    pub lag: usize,
}

/// One competing model variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidate {
    pub id: CandidateId,
    pub covariate: Option<CovariateMeta>,
}

impl ModelCandidate {
    pub fn baseline() -> Self {
        Self {
            id: CandidateId::Baseline,
            covariate: None,
        }
    }

    pub fn with_covariate(meta: CovariateMeta) -> Self {
        Self {
            id: CandidateId::Covariate(meta.id.clone()),
            covariate: Some(meta),
        }
    }
}

/// How harvest enters the spawner equation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum HarvestModel {
    /// Harvest is known exactly: `S_t = Run_t - H_t`.
    Known,
    /// Latent harvest rate per year with positive observed harvest;
    /// `ln H_obs ~ Normal(ln H_t, sd)`.
    LogNormal { sd: f64 },
}

/// CLI-facing selector for [`HarvestModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HarvestKind {
    Known,
    Lognormal,
}

/// MCMC control numbers.
///
/// `draws` counts post-burn-in iterations per chain; every `thin`-th is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McmcConfig {
    pub chains: usize,
    pub adapt_iters: usize,
    pub max_adapt_attempts: usize,
    pub burn_in: usize,
    pub draws: usize,
    pub thin: usize,
}

impl McmcConfig {
    /// Draws retained per chain after thinning.
    pub fn kept_per_chain(&self) -> usize {
        self.draws / self.thin.max(1)
    }
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            chains: 3,
            adapt_iters: 500,
            max_adapt_attempts: 5,
            burn_in: 2000,
            draws: 2000,
            thin: 2,
        }
    }
}

/// A full run's configuration as understood by the pipeline.
///
/// This is derived from CLI flags (plus env defaults) and lives for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub data_path: PathBuf,
    pub store_dir: PathBuf,
    pub output_dir: PathBuf,
    pub seed: u64,
    pub mcmc: McmcConfig,
    pub rhat_threshold: f64,
    pub harvest: HarvestModel,
    /// Restrict covariate candidates to these ids (empty = all included).
    pub only: Vec<String>,
}

// ---- Dataset input ----

/// A `(year, count)` observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearCount {
    pub year: i32,
    pub count: f64,
}

/// Observed per-age counts for one calendar year (ordered `age_min..=age_max`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeCompRow {
    pub year: i32,
    pub counts: Vec<f64>,
}

/// Daily environmental values for one calendar year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateYear {
    pub year: i32,
    pub daily: Vec<f64>,
}

/// One candidate covariate as supplied by the upstream collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateInput {
    pub id: String,
    /// Summary function identifier (e.g. `min7`, `exceed:250`).
    pub summary: String,
    pub lag: usize,
    #[serde(default = "default_include")]
    pub include: bool,
    pub values: Vec<CovariateYear>,
}

fn default_include() -> bool {
    true
}

/// Raw observation bundle for one stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub stock: String,
    pub age_min: usize,
    pub age_max: usize,
    pub escapement: Vec<YearCount>,
    pub harvest: Vec<YearCount>,
    pub age_composition: Vec<AgeCompRow>,
    #[serde(default)]
    pub covariates: Vec<CovariateInput>,
}

// ---- Fit outputs ----

/// Retained output of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainResult {
    /// Unconstrained parameter vectors (one per kept draw).
    pub draws: Vec<Vec<f64>>,
    /// Derived scalar quantities per draw (names in `FitResult::scalar_names`).
    pub scalars: Vec<Vec<f64>>,
    /// Per-observation log-likelihood per draw: escapement terms then age-composition terms.
    pub log_lik: Vec<Vec<f64>>,
}

/// Posterior bundle for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub candidate: CandidateId,
    pub engine: String,
    pub fitted_at: DateTime<Utc>,
    /// Hash of the aligned data and model specification the draws belong to.
    pub fingerprint: u64,
    pub mcmc: McmcConfig,
    pub adapt_attempts: usize,
    pub param_names: Vec<String>,
    pub scalar_names: Vec<String>,
    pub chains: Vec<ChainResult>,
}

impl FitResult {
    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn draws_per_chain(&self) -> usize {
        self.chains.first().map(|c| c.draws.len()).unwrap_or(0)
    }

    pub fn n_observations(&self) -> usize {
        self.chains
            .first()
            .and_then(|c| c.log_lik.first())
            .map(|row| row.len())
            .unwrap_or(0)
    }

    /// Per-chain traces of a named derived scalar.
    pub fn scalar_traces(&self, name: &str) -> Option<Vec<Vec<f64>>> {
        let idx = self.scalar_names.iter().position(|n| n == name)?;
        Some(
            self.chains
                .iter()
                .map(|c| c.scalars.iter().map(|row| row[idx]).collect())
                .collect(),
        )
    }
}
