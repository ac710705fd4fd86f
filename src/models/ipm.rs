//! Log posterior of a compiled [`ModelSpec`] on the unconstrained scale.
//!
//! [`IpmModel::evaluate`] is the single place where a parameter vector is
//! turned into natural-scale parameters, latent states (returns, run,
//! spawners, recruits, maturation) and the per-observation log-likelihood.
//! Draws outside the support (e.g. non-positive spawners) evaluate to `None`.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::data::aligner::AlignedData;
use crate::domain::HarvestModel;
use crate::error::AppError;
use crate::math::{
    alr_forward, alr_inverse_ln, dirichlet_lpdf_with_norm, dirichlet_norm, half_normal_lpdf, logistic,
    logit, multinomial_coefficient, normal_lpdf,
};
use crate::models::spec::{ModelSpec, ParamLayout};

/// Per-coordinate standard deviation of the jitter applied to chain starts.
const INIT_JITTER: f64 = 0.1;
const INIT_TRIES: usize = 20;

#[derive(Debug, Clone, Copy)]
struct Offsets {
    mu_alpha: usize,
    ln_beta: usize,
    gamma: Option<usize>,
    atanh_phi: usize,
    ln_sigma_r: usize,
    ln_sigma_s: usize,
    ln_rec: usize,
    alr_mu: usize,
    ln_pi: usize,
    alr_p: usize,
    mu_imp: usize,
    ln_sigma_imp: usize,
    ln_imp: usize,
    logit_h: Option<usize>,
}

impl Offsets {
    fn resolve(layout: &ParamLayout) -> Result<Self, AppError> {
        let required = |name: &str| {
            layout
                .offset(name)
                .ok_or_else(|| AppError::model_spec(format!("Parameter layout lacks block '{name}'.")))
        };
        Ok(Self {
            mu_alpha: required("mu_alpha")?,
            ln_beta: required("ln_beta")?,
            gamma: layout.offset("gamma"),
            atanh_phi: required("atanh_phi")?,
            ln_sigma_r: required("ln_sigma_r")?,
            ln_sigma_s: required("ln_sigma_s")?,
            ln_rec: required("ln_rec")?,
            alr_mu: required("alr_mu")?,
            ln_pi: required("ln_pi")?,
            alr_p: required("alr_p")?,
            mu_imp: required("mu_imp")?,
            ln_sigma_imp: required("ln_sigma_imp")?,
            ln_imp: required("ln_imp")?,
            logit_h: layout.offset("logit_h"),
        })
    }
}

/// Natural-scale scalar parameters of one draw.
#[derive(Debug, Clone, PartialEq)]
pub struct NaturalParams {
    pub mu_alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub phi: f64,
    pub sigma_r: f64,
    pub sigma_s: f64,
    pub pi_conc: f64,
    pub maturation_mean: Vec<f64>,
    pub mu_imp: f64,
    pub sigma_imp: f64,
}

/// Latent trajectory implied by one draw.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentStates {
    /// `N_{a,t}`, `n_yrs × A`.
    pub returns: Vec<Vec<f64>>,
    pub run: Vec<f64>,
    pub harvest: Vec<f64>,
    pub spawners: Vec<f64>,
    /// `R_b`, one per brood year.
    pub recruits: Vec<f64>,
    /// `p_b`, `n_brood × A`.
    pub maturation: Vec<Vec<f64>>,
    /// `ln α_b`.
    pub productivity: Vec<f64>,
    /// Process residuals `w_b`.
    pub process_residuals: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub log_density: f64,
    /// `n_yrs` escapement terms followed by `n_yrs` age-composition terms.
    pub log_lik: Vec<f64>,
    pub params: NaturalParams,
    pub states: LatentStates,
}

/// A [`ModelSpec`] bound to its aligned data, with data-only constants precomputed.
#[derive(Debug, Clone)]
pub struct IpmModel {
    spec: ModelSpec,
    data: Arc<AlignedData>,
    at: Offsets,
    covariate: Option<Vec<f64>>,
    ln_escapement: Vec<f64>,
    multinomial_coef: Vec<f64>,
    /// Observed log harvest for each entry of `spec.harvest_years`.
    ln_harvest_obs: Vec<f64>,
    beta_max: f64,
    imp_prior_mean: f64,
    mu_hyper_norm: f64,
    imp_index: Vec<Vec<Option<usize>>>,
}

impl IpmModel {
    pub fn compile(spec: ModelSpec, data: Arc<AlignedData>) -> Result<Self, AppError> {
        if spec.n_yrs != data.n_yrs || spec.ages != data.ages || spec.n_brood != data.n_brood {
            return Err(AppError::model_spec(format!(
                "Model '{}' was built for different data dimensions.",
                spec.candidate
            )));
        }
        if spec.n_unresolved != data.unresolved_cells.len() {
            return Err(AppError::model_spec("Unresolved cell count does not match the aligned data."));
        }
        let at = Offsets::resolve(&spec.layout)?;

        let covariate = match &spec.covariate {
            Some(term) => Some(
                data.covariate(&term.id)
                    .ok_or_else(|| AppError::model_spec(format!("Covariate '{}' is not aligned.", term.id)))?
                    .standardized
                    .clone(),
            ),
            None => None,
        };

        let max_e = data.escapement.iter().copied().fold(0.0_f64, f64::max);
        let mean_e = data.escapement.iter().sum::<f64>() / data.n_yrs as f64;
        let beta_max = spec.priors.beta_max_scale / max_e;

        let mut imp_index = vec![vec![None; data.n_ages()]; data.n_yrs];
        for (j, &(t, i)) in data.unresolved_cells.iter().enumerate() {
            imp_index[t][i] = Some(j);
        }

        Ok(Self {
            covariate,
            ln_escapement: data.escapement.iter().map(|e| e.ln()).collect(),
            multinomial_coef: data.age_counts.iter().map(|row| multinomial_coefficient(row)).collect(),
            ln_harvest_obs: spec.harvest_years.iter().map(|&t| data.harvest[t].ln()).collect(),
            beta_max,
            imp_prior_mean: mean_e.ln() + spec.priors.mu_imp_offset,
            mu_hyper_norm: dirichlet_norm(&spec.priors.maturation_hyper),
            imp_index,
            at,
            spec,
            data,
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn data(&self) -> &AlignedData {
        &self.data
    }

    pub fn dim(&self) -> usize {
        self.spec.dim()
    }

    /// Log posterior density; `-inf` outside the support.
    pub fn log_density(&self, u: &[f64]) -> f64 {
        self.evaluate(u).map(|e| e.log_density).unwrap_or(f64::NEG_INFINITY)
    }

    pub fn states(&self, u: &[f64]) -> Option<LatentStates> {
        self.evaluate(u).map(|e| e.states)
    }

    /// Names of the derived scalars returned by [`IpmModel::scalars`].
    pub fn scalar_names(&self) -> Vec<String> {
        let mut names = vec!["alpha", "beta", "phi", "sigma_r", "sigma_s"];
        if self.at.gamma.is_some() {
            names.push("gamma");
        }
        names.extend(["pi_conc", "mu_imp", "sigma_imp"]);
        names.into_iter().map(String::from).collect()
    }

    pub fn scalars(&self, eval: &Evaluation) -> Vec<f64> {
        let p = &eval.params;
        let mut out = vec![p.mu_alpha.exp(), p.beta, p.phi, p.sigma_r, p.sigma_s];
        if self.at.gamma.is_some() {
            out.push(p.gamma);
        }
        out.extend([p.pi_conc, p.mu_imp, p.sigma_imp]);
        out
    }

    pub fn evaluate(&self, u: &[f64]) -> Option<Evaluation> {
        if u.len() != self.spec.dim() || u.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let at = self.at;
        let priors = &self.spec.priors;
        let ages = self.spec.ages;
        let n_yrs = self.spec.n_yrs;
        let n_brood = self.spec.n_brood;
        let n_ages = ages.count();
        let mut lp = 0.0;

        // Productivity and density dependence.
        let mu_alpha = u[at.mu_alpha];
        lp += normal_lpdf(mu_alpha, priors.mu_alpha_mean, priors.mu_alpha_sd);

        let ln_beta = u[at.ln_beta];
        let beta = ln_beta.exp();
        if !(beta > 0.0 && beta < self.beta_max) {
            return None;
        }
        lp += ln_beta - self.beta_max.ln();

        let gamma = match at.gamma {
            Some(i) => {
                lp += normal_lpdf(u[i], 0.0, priors.gamma_sd);
                u[i]
            }
            None => 0.0,
        };

        let phi = u[at.atanh_phi].tanh();
        let one_minus_phi2 = 1.0 - phi * phi;
        if one_minus_phi2 <= 0.0 {
            return None;
        }
        lp += one_minus_phi2.ln() - std::f64::consts::LN_2;

        let sigma_r = u[at.ln_sigma_r].exp();
        lp += half_normal_lpdf(sigma_r, priors.sigma_r_scale) + u[at.ln_sigma_r];
        let sigma_s = u[at.ln_sigma_s].exp();
        lp += half_normal_lpdf(sigma_s, priors.sigma_s_scale) + u[at.ln_sigma_s];

        // Hierarchical maturation.
        let mut ln_mu = vec![0.0; n_ages];
        let jac = alr_inverse_ln(&u[at.alr_mu..at.alr_mu + n_ages - 1], &mut ln_mu);
        lp += dirichlet_lpdf_with_norm(&ln_mu, &priors.maturation_hyper, self.mu_hyper_norm) + jac;

        // LogNormal prior on π times the Jacobian of exp is Normal on ln π.
        let ln_pi = u[at.ln_pi];
        let pi_conc = ln_pi.exp();
        lp += normal_lpdf(ln_pi, priors.pi_ln_mean, priors.pi_ln_sd);

        let conc: Vec<f64> = ln_mu.iter().map(|l| l.exp() * pi_conc).collect();
        if conc.iter().any(|c| !(c.is_finite() && *c > 0.0)) {
            return None;
        }
        let conc_norm = dirichlet_norm(&conc);

        let mut ln_maturation = Vec::with_capacity(n_brood);
        for b in 0..n_brood {
            let start = at.alr_p + b * (n_ages - 1);
            let mut ln_p = vec![0.0; n_ages];
            let jac = alr_inverse_ln(&u[start..start + n_ages - 1], &mut ln_p);
            lp += dirichlet_lpdf_with_norm(&ln_p, &conc, conc_norm) + jac;
            ln_maturation.push(ln_p);
        }

        // Cells whose parent brood precedes the data.
        let mu_imp = u[at.mu_imp];
        lp += normal_lpdf(mu_imp, self.imp_prior_mean, priors.mu_imp_sd);
        let sigma_imp = u[at.ln_sigma_imp].exp();
        lp += half_normal_lpdf(sigma_imp, priors.sigma_imp_scale) + u[at.ln_sigma_imp];
        let ln_imp = &u[at.ln_imp..at.ln_imp + self.spec.n_unresolved];
        lp += ln_imp.iter().map(|&v| normal_lpdf(v, mu_imp, sigma_imp)).sum::<f64>();

        // Returns and total run.
        let ln_rec = &u[at.ln_rec..at.ln_rec + n_brood];
        let mut ln_returns = vec![vec![0.0; n_ages]; n_yrs];
        let mut run = vec![0.0; n_yrs];
        for t in 0..n_yrs {
            for i in 0..n_ages {
                let ln_n = match self.imp_index[t][i] {
                    Some(j) => ln_imp[j],
                    None => {
                        let b = t - ages.age(i);
                        ln_rec[b] + ln_maturation[b][i]
                    }
                };
                ln_returns[t][i] = ln_n;
                run[t] += ln_n.exp();
            }
        }

        let mut harvest = self.data.harvest.clone();
        if let (HarvestModel::LogNormal { sd }, Some(offset)) = (self.spec.harvest, at.logit_h) {
            for (j, &t) in self.spec.harvest_years.iter().enumerate() {
                let h = logistic(u[offset + j]);
                if !(h > 0.0 && h < 1.0) {
                    return None;
                }
                // Uniform(0, 1) prior on the rate, logit Jacobian.
                lp += h.ln() + (1.0 - h).ln();
                harvest[t] = h * run[t];
                lp += normal_lpdf(self.ln_harvest_obs[j], harvest[t].ln(), sd);
            }
        }

        let mut spawners = Vec::with_capacity(n_yrs);
        for t in 0..n_yrs {
            let s = run[t] - harvest[t];
            if !(s.is_finite() && s > 0.0) {
                return None;
            }
            spawners.push(s);
        }

        // Ricker recruitment with AR(1) residuals.
        let mut productivity = Vec::with_capacity(n_brood);
        let mut residuals = Vec::with_capacity(n_brood);
        let mut prev_w = 0.0;
        for b in 0..n_brood {
            let ln_alpha = mu_alpha + self.covariate.as_ref().map_or(0.0, |f| gamma * f[b]);
            let s = spawners[b];
            let w = ln_rec[b] - (ln_alpha + s.ln() - beta * s);
            lp += if b == 0 {
                normal_lpdf(w, 0.0, sigma_r / one_minus_phi2.sqrt())
            } else {
                normal_lpdf(w, phi * prev_w, sigma_r)
            };
            prev_w = w;
            productivity.push(ln_alpha);
            residuals.push(w);
        }

        // Observations: log-normal escapement, multinomial age composition.
        let mut log_lik = Vec::with_capacity(2 * n_yrs);
        for t in 0..n_yrs {
            let ln_e = self.ln_escapement[t];
            log_lik.push(normal_lpdf(ln_e, spawners[t].ln(), sigma_s) - ln_e);
        }
        for t in 0..n_yrs {
            let ln_run = run[t].ln();
            let kernel: f64 = self.data.age_counts[t]
                .iter()
                .zip(&ln_returns[t])
                .filter(|(o, _)| **o > 0.0)
                .map(|(o, ln_n)| o * (ln_n - ln_run))
                .sum();
            log_lik.push(self.multinomial_coef[t] + kernel);
        }
        lp += log_lik.iter().sum::<f64>();
        if !lp.is_finite() {
            return None;
        }

        Some(Evaluation {
            log_density: lp,
            log_lik,
            params: NaturalParams {
                mu_alpha,
                beta,
                gamma,
                phi,
                sigma_r,
                sigma_s,
                pi_conc,
                maturation_mean: ln_mu.iter().map(|v| v.exp()).collect(),
                mu_imp,
                sigma_imp,
            },
            states: LatentStates {
                returns: ln_returns
                    .iter()
                    .map(|row| row.iter().map(|v| v.exp()).collect())
                    .collect(),
                run,
                harvest,
                spawners,
                recruits: ln_rec.iter().map(|v| v.exp()).collect(),
                maturation: ln_maturation
                    .iter()
                    .map(|row| row.iter().map(|v| v.exp()).collect())
                    .collect(),
                productivity,
                process_residuals: residuals,
            },
        })
    }

    /// Jittered starting points, one per chain.
    ///
    /// The centre is derived from the data: observed returns split by smoothed
    /// age proportions, recruits reconstructed per brood, and a Ricker fit by
    /// moments. It reproduces the observed run exactly, so it is always inside
    /// the support.
    pub fn initial_values(&self, n_chains: usize, seed: u64) -> Result<Vec<Vec<f64>>, AppError> {
        let base = self.data_driven_point();
        if !self.log_density(&base).is_finite() {
            return Err(AppError::model_spec(format!(
                "No valid starting point for candidate '{}'.",
                self.spec.candidate
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).map_err(|e| AppError::engine(format!("Jitter distribution error: {e}")))?;
        let mut inits = Vec::with_capacity(n_chains);
        for _ in 0..n_chains {
            let mut scale = INIT_JITTER;
            let mut chosen = None;
            for _ in 0..INIT_TRIES {
                let candidate: Vec<f64> = base.iter().map(|v| v + scale * normal.sample(&mut rng)).collect();
                if self.log_density(&candidate).is_finite() {
                    chosen = Some(candidate);
                    break;
                }
                scale *= 0.5;
            }
            inits.push(chosen.unwrap_or_else(|| base.clone()));
        }
        Ok(inits)
    }

    fn data_driven_point(&self) -> Vec<f64> {
        let d = &self.data;
        let at = self.at;
        let ages = self.spec.ages;
        let n_yrs = d.n_yrs;
        let n_brood = d.n_brood;
        let n_ages = ages.count();

        let observed_run: Vec<f64> = (0..n_yrs).map(|t| d.escapement[t] + d.harvest[t]).collect();
        let returns: Vec<Vec<f64>> = (0..n_yrs)
            .map(|t| {
                let total = d.age_totals[t] + 0.5 * n_ages as f64;
                d.age_counts[t]
                    .iter()
                    .map(|o| observed_run[t] * (o + 0.5) / total)
                    .collect()
            })
            .collect();

        let mut mu = vec![0.0; n_ages];
        for t in 0..n_yrs {
            for i in 0..n_ages {
                mu[i] += returns[t][i] / observed_run[t];
            }
        }
        let mu_total: f64 = mu.iter().sum();
        mu.iter_mut().for_each(|v| *v /= mu_total);

        let mut recruits = Vec::with_capacity(n_brood);
        let mut maturation = Vec::with_capacity(n_brood);
        for b in 0..n_brood {
            let (observed, weight) = (0..n_ages)
                .filter(|&i| b + ages.age(i) < n_yrs)
                .fold((0.0, 0.0), |(o, w), i| (o + returns[b + ages.age(i)][i], w + mu[i]));
            let r = observed / weight;
            let p: Vec<f64> = (0..n_ages)
                .map(|i| {
                    let t = b + ages.age(i);
                    if t < n_yrs { returns[t][i] / r } else { mu[i] }
                })
                .collect();
            recruits.push(r);
            maturation.push(p);
        }

        let mean_e = d.escapement.iter().sum::<f64>() / n_yrs as f64;
        let beta = (0.5 / mean_e).min(0.5 * self.beta_max);
        let ricker: Vec<f64> = (0..n_brood)
            .map(|b| {
                let s = d.escapement[b];
                recruits[b].ln() - s.ln() + beta * s
            })
            .collect();
        let mu_alpha = ricker.iter().sum::<f64>() / n_brood as f64;
        let sigma_r = sample_sd(&ricker).clamp(0.05, 2.0);

        let ln_imp: Vec<f64> = d.unresolved_cells.iter().map(|&(t, i)| returns[t][i].ln()).collect();
        let mu_imp = ln_imp.iter().sum::<f64>() / ln_imp.len() as f64;
        let sigma_imp = sample_sd(&ln_imp).clamp(0.1, 2.0);

        let mut u = vec![0.0; self.spec.dim()];
        u[at.mu_alpha] = mu_alpha;
        u[at.ln_beta] = beta.ln();
        u[at.atanh_phi] = 0.0;
        u[at.ln_sigma_r] = sigma_r.ln();
        u[at.ln_sigma_s] = 0.1_f64.ln();
        for (b, r) in recruits.iter().enumerate() {
            u[at.ln_rec + b] = r.ln();
        }
        u[at.alr_mu..at.alr_mu + n_ages - 1].copy_from_slice(&alr_forward(&mu));
        u[at.ln_pi] = self.spec.priors.pi_ln_mean;
        for (b, p) in maturation.iter().enumerate() {
            let start = at.alr_p + b * (n_ages - 1);
            u[start..start + n_ages - 1].copy_from_slice(&alr_forward(p));
        }
        u[at.mu_imp] = mu_imp;
        u[at.ln_sigma_imp] = sigma_imp.ln();
        u[at.ln_imp..at.ln_imp + ln_imp.len()].copy_from_slice(&ln_imp);
        if let Some(offset) = at.logit_h {
            for (j, &t) in self.spec.harvest_years.iter().enumerate() {
                u[offset + j] = logit(d.harvest[t] / observed_run[t]);
            }
        }
        u
    }
}

fn sample_sd(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0)).sqrt()
}
