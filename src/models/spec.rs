//! Declarative IPM specification for one candidate.
//!
//! A [`ModelSpec`] names every unconstrained parameter block, its transform,
//! and the fixed prior constants. It is pure data: building one performs no
//! inference and depends only on the age range, the number of calendar years,
//! the candidate identity and the harvest configuration.
//!
//! Process model (brood year `b`):
//!
//! ```text
//! ln R_b = ln α_b + ln S_b − β S_b + φ w_{b−1} + ν_b,   ν_b ~ Normal(0, σ_r)
//! ln α_b = μ_α [+ γ F_{b+lag}]
//! w_0 ~ Normal(0, σ_r / sqrt(1 − φ²))
//! ```
//!
//! Maturation `p_b ~ Dirichlet(μ·π)`, returns `N_{a,t} = R_{t−a} p_{a,t−a}`,
//! escapement `ln E_t ~ Normal(ln S_t, σ_s)`, age composition
//! `O_t ~ Multinomial(Y_t, N_{·,t} / Run_t)`.

use serde::{Deserialize, Serialize};

use crate::data::aligner::AlignedData;
use crate::domain::{AgeRange, CandidateId, HarvestModel, ModelCandidate};
use crate::error::AppError;

/// Transform from the unconstrained block to the natural scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Identity,
    /// `θ = exp(u)`.
    Log,
    /// `θ = tanh(u)`, for `θ ∈ (−1, 1)`.
    Atanh,
    /// `θ = 1 / (1 + exp(−u))`.
    Logit,
    /// Additive log-ratio; a block of `K−1` values per simplex of size `K`.
    SimplexAlr,
}

/// A contiguous run of unconstrained parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamBlock {
    pub name: String,
    pub offset: usize,
    pub len: usize,
    pub transform: Transform,
}

/// Ordered parameter blocks of the unconstrained vector.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParamLayout {
    pub blocks: Vec<ParamBlock>,
    pub dim: usize,
}

impl ParamLayout {
    fn push(&mut self, name: &str, len: usize, transform: Transform) {
        self.blocks.push(ParamBlock {
            name: name.to_string(),
            offset: self.dim,
            len,
            transform,
        });
        self.dim += len;
    }

    pub fn block(&self, name: &str) -> Option<&ParamBlock> {
        self.blocks.iter().find(|b| b.name == name && b.len > 0)
    }

    /// Offset of a block; the builder guarantees every required block exists.
    pub fn offset(&self, name: &str) -> Option<usize> {
        self.block(name).map(|b| b.offset)
    }

    /// Flat names, e.g. `ln_rec[3]`.
    pub fn names(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.dim);
        for block in &self.blocks {
            if block.len == 1 {
                out.push(block.name.clone());
            } else {
                out.extend((0..block.len).map(|i| format!("{}[{i}]", block.name)));
            }
        }
        out
    }
}

/// Fixed prior constants.
///
/// Quantities that scale with the data (the upper bound of `β`, the mean of
/// the imputation hyper-prior) are given relative to the escapement series and
/// resolved when the density is compiled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Priors {
    pub mu_alpha_mean: f64,
    pub mu_alpha_sd: f64,
    /// `β ~ Uniform(0, beta_max_scale / max E)`.
    pub beta_max_scale: f64,
    pub gamma_sd: f64,
    pub sigma_r_scale: f64,
    pub sigma_s_scale: f64,
    /// Log-normal prior on the maturation concentration `π`.
    pub pi_ln_mean: f64,
    pub pi_ln_sd: f64,
    /// Dirichlet hyperprior on the mean maturation schedule `μ`.
    pub maturation_hyper: Vec<f64>,
    /// `μ_imp ~ Normal(ln mean(E) + offset, sd)`.
    pub mu_imp_offset: f64,
    pub mu_imp_sd: f64,
    pub sigma_imp_scale: f64,
}

impl Priors {
    pub fn for_ages(ages: AgeRange) -> Self {
        Self {
            mu_alpha_mean: 0.0,
            mu_alpha_sd: 2.0,
            beta_max_scale: 10.0,
            gamma_sd: 1.0,
            sigma_r_scale: 1.0,
            sigma_s_scale: 1.0,
            pi_ln_mean: 10.0_f64.ln(),
            pi_ln_sd: 1.0,
            maturation_hyper: vec![1.0; ages.count()],
            mu_imp_offset: 0.0,
            mu_imp_sd: 2.0,
            sigma_imp_scale: 2.0,
        }
    }
}

/// Covariate term of a candidate's productivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CovariateTerm {
    pub id: String,
    pub lag: usize,
}

/// Complete declarative model for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub candidate: CandidateId,
    pub ages: AgeRange,
    pub n_yrs: usize,
    pub n_brood: usize,
    pub covariate: Option<CovariateTerm>,
    pub harvest: HarvestModel,
    /// Calendar years with a latent harvest rate (log-normal harvest only).
    pub harvest_years: Vec<usize>,
    pub n_unresolved: usize,
    pub priors: Priors,
    pub layout: ParamLayout,
}

impl ModelSpec {
    pub fn dim(&self) -> usize {
        self.layout.dim
    }

    pub fn n_ages(&self) -> usize {
        self.ages.count()
    }
}

/// Assembles a [`ModelSpec`] per candidate.
#[derive(Debug, Clone)]
pub struct ModelSpecBuilder {
    ages: AgeRange,
    n_yrs: usize,
    harvest: HarvestModel,
}

impl ModelSpecBuilder {
    pub fn new(ages: AgeRange, n_yrs: usize, harvest: HarvestModel) -> Result<Self, AppError> {
        if ages.min < 1 || ages.max < ages.min {
            return Err(AppError::model_spec(format!(
                "Invalid age range {}..={}.",
                ages.min, ages.max
            )));
        }
        if n_yrs <= ages.max {
            return Err(AppError::model_spec(format!(
                "n_yrs={n_yrs} must exceed age_max={}.",
                ages.max
            )));
        }
        if let HarvestModel::LogNormal { sd } = harvest {
            if !(sd.is_finite() && sd > 0.0) {
                return Err(AppError::model_spec(format!("Invalid harvest sd {sd}.")));
            }
        }
        Ok(Self { ages, n_yrs, harvest })
    }

    /// Build the spec of one candidate against the aligned data of the run.
    pub fn build(&self, candidate: &ModelCandidate, data: &AlignedData) -> Result<ModelSpec, AppError> {
        if data.ages != self.ages || data.n_yrs != self.n_yrs {
            return Err(AppError::model_spec(
                "Aligned data does not match the builder's age range or year count.",
            ));
        }

        let covariate = match (&candidate.id, &candidate.covariate) {
            (CandidateId::Baseline, None) => None,
            (CandidateId::Covariate(id), Some(meta)) if *id == meta.id => {
                if meta.lag > self.ages.max {
                    return Err(AppError::model_spec(format!(
                        "Covariate '{id}' lag {} exceeds age_max {}.",
                        meta.lag, self.ages.max
                    )));
                }
                if data.covariate(id).is_none() {
                    return Err(AppError::model_spec(format!(
                        "Covariate '{id}' is not part of the aligned data."
                    )));
                }
                Some(CovariateTerm {
                    id: id.clone(),
                    lag: meta.lag,
                })
            }
            _ => {
                return Err(AppError::model_spec(format!(
                    "Candidate '{}' has inconsistent covariate metadata.",
                    candidate.id
                )));
            }
        };

        let harvest_years: Vec<usize> = match self.harvest {
            HarvestModel::Known => Vec::new(),
            HarvestModel::LogNormal { .. } => (0..self.n_yrs).filter(|&t| data.harvest[t] > 0.0).collect(),
        };

        let n_ages = self.ages.count();
        let n_brood = self.n_yrs - self.ages.min;
        let n_unresolved = data.unresolved_cells.len();

        let mut layout = ParamLayout::default();
        layout.push("mu_alpha", 1, Transform::Identity);
        layout.push("ln_beta", 1, Transform::Log);
        if covariate.is_some() {
            layout.push("gamma", 1, Transform::Identity);
        }
        layout.push("atanh_phi", 1, Transform::Atanh);
        layout.push("ln_sigma_r", 1, Transform::Log);
        layout.push("ln_sigma_s", 1, Transform::Log);
        layout.push("ln_rec", n_brood, Transform::Identity);
        layout.push("alr_mu", n_ages - 1, Transform::SimplexAlr);
        layout.push("ln_pi", 1, Transform::Log);
        layout.push("alr_p", n_brood * (n_ages - 1), Transform::SimplexAlr);
        layout.push("mu_imp", 1, Transform::Identity);
        layout.push("ln_sigma_imp", 1, Transform::Log);
        layout.push("ln_imp", n_unresolved, Transform::Identity);
        layout.push("logit_h", harvest_years.len(), Transform::Logit);

        Ok(ModelSpec {
            candidate: candidate.id.clone(),
            ages: self.ages,
            n_yrs: self.n_yrs,
            n_brood,
            covariate,
            harvest: self.harvest,
            harvest_years,
            n_unresolved,
            priors: Priors::for_ages(self.ages),
            layout,
        })
    }
}
