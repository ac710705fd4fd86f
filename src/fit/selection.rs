//! Leave-one-out model comparison.
//!
//! For each fitted candidate:
//!
//! - sanitize every per-observation log-likelihood column (non-finite values
//!   are replaced by a value strictly worse than the column's worst finite one)
//! - estimate the relative efficiency of each column from the chains
//! - PSIS-LOO: `elpd_loo`, `p_loo`, `LOOIC = -2 elpd_loo` and its standard error
//!
//! Ranking (ascending LOOIC) reports each candidate's `ΔLOOIC` from the best
//! together with the paired standard error; a difference only counts as
//! decisive when `ΔLOOIC > 2·SE(Δ)`. Failed candidates stay in the table.

use std::cmp::Ordering;

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::diagnostics::ConvergenceReport;
use crate::domain::{FitResult, ModelCandidate};
use crate::error::AppError;
use crate::math::{effective_sample_size, log_sum_exp, loo_elpd_i};

/// Pareto `k̂` above which an observation's LOO estimate is unreliable.
pub const HIGH_PARETO_K: f64 = 0.7;

/// Replacement for a column without a single finite value.
const NON_FINITE_COLUMN_FILL: f64 = -1e3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LooEstimate {
    pub elpd_loo: f64,
    pub p_loo: f64,
    pub looic: f64,
    pub se_looic: f64,
    pub pointwise_elpd: Vec<f64>,
    pub pareto_k: Vec<f64>,
    pub n_high_k: usize,
    /// Log-likelihood values replaced during sanitization.
    pub n_sanitized: usize,
}

impl LooEstimate {
    pub fn n_observations(&self) -> usize {
        self.pointwise_elpd.len()
    }
}

/// Replace non-finite entries; returns how many were replaced.
///
/// Replacements equal `worst - max(0.05·|worst|, 1e-6)`, where `worst` is the
/// smallest finite value, so they are strictly more extreme than any finite entry.
pub fn sanitize_log_lik(values: &mut [f64]) -> usize {
    let worst = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::INFINITY, f64::min);
    let fill = if worst.is_finite() {
        worst - (0.05 * worst.abs()).max(1e-6)
    } else {
        NON_FINITE_COLUMN_FILL
    };
    let mut replaced = 0;
    for v in values.iter_mut().filter(|v| !v.is_finite()) {
        *v = fill;
        replaced += 1;
    }
    replaced
}

struct Pointwise {
    elpd: f64,
    lppd: f64,
    pareto_k: f64,
    sanitized: usize,
}

/// PSIS-LOO for one fit. Deterministic for a given [`FitResult`].
pub fn evaluate_loo(fit: &FitResult) -> Result<LooEstimate, AppError> {
    let n_obs = fit.n_observations();
    let total_draws: usize = fit.chains.iter().map(|c| c.log_lik.len()).sum();
    if n_obs == 0 || total_draws == 0 {
        return Err(AppError::engine(format!(
            "Fit for '{}' has no log-likelihood draws.",
            fit.candidate
        )));
    }
    if fit.chains.iter().flat_map(|c| &c.log_lik).any(|row| row.len() != n_obs) {
        return Err(AppError::engine(format!(
            "Fit for '{}' has ragged log-likelihood rows.",
            fit.candidate
        )));
    }

    let pointwise: Vec<Pointwise> = (0..n_obs)
        .into_par_iter()
        .map(|i| pointwise_loo(fit, i, total_draws))
        .collect();

    let elpd: Vec<f64> = pointwise.iter().map(|p| p.elpd).collect();
    let elpd_loo: f64 = elpd.iter().sum();
    let lppd: f64 = pointwise.iter().map(|p| p.lppd).sum();
    let pareto_k: Vec<f64> = pointwise.iter().map(|p| p.pareto_k).collect();
    let n_high_k = pareto_k.iter().filter(|&&k| k > HIGH_PARETO_K).count();
    let n_sanitized = pointwise.iter().map(|p| p.sanitized).sum();
    if n_sanitized > 0 {
        debug!(candidate = %fit.candidate, n_sanitized, "Replaced non-finite log-likelihood values");
    }

    Ok(LooEstimate {
        elpd_loo,
        p_loo: lppd - elpd_loo,
        looic: -2.0 * elpd_loo,
        se_looic: 2.0 * sum_standard_error(&elpd),
        pointwise_elpd: elpd,
        pareto_k,
        n_high_k,
        n_sanitized,
    })
}

fn pointwise_loo(fit: &FitResult, i: usize, total_draws: usize) -> Pointwise {
    let mut column: Vec<f64> = fit
        .chains
        .iter()
        .flat_map(|c| c.log_lik.iter().map(move |row| row[i]))
        .collect();
    let sanitized = sanitize_log_lik(&mut column);

    // Relative efficiency from per-chain draws of the (scaled) likelihood.
    let max = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut per_chain = Vec::with_capacity(fit.chains.len());
    let mut start = 0;
    for chain in &fit.chains {
        let end = start + chain.log_lik.len();
        per_chain.push(column[start..end].iter().map(|v| (v - max).exp()).collect::<Vec<f64>>());
        start = end;
    }
    let r_eff = effective_sample_size(&per_chain) / total_draws as f64;

    let lppd = log_sum_exp(&column) - (total_draws as f64).ln();
    let (elpd, pareto_k) = loo_elpd_i(&column, r_eff);
    Pointwise {
        elpd,
        lppd,
        pareto_k,
        sanitized,
    }
}

/// `sqrt(n · var(x))`, the standard error of `Σ x`.
fn sum_standard_error(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    (n as f64 * var).sqrt()
}

/// `(ΔLOOIC, SE(Δ))` of `other` relative to `best`.
pub fn compare(best: &LooEstimate, other: &LooEstimate) -> (f64, f64) {
    let delta = other.looic - best.looic;
    if best.n_observations() != other.n_observations() {
        return (delta, f64::NAN);
    }
    let diff: Vec<f64> = best
        .pointwise_elpd
        .iter()
        .zip(&other.pointwise_elpd)
        .map(|(b, o)| b - o)
        .collect();
    (delta, 2.0 * sum_standard_error(&diff))
}

/// Input row for [`rank_candidates`].
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: ModelCandidate,
    /// LOO estimate, or the reason the candidate could not be scored.
    pub loo: Result<LooEstimate, String>,
    pub diagnostics: Option<ConvergenceReport>,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub candidate: ModelCandidate,
    /// 1-based rank; `None` for failed candidates.
    pub rank: Option<usize>,
    pub loo: Option<LooEstimate>,
    pub delta_looic: Option<f64>,
    pub se_delta: Option<f64>,
    pub decisive: Option<bool>,
    pub diagnostics: Option<ConvergenceReport>,
    pub failure: Option<String>,
    pub cached: bool,
}

impl RankedCandidate {
    pub fn status(&self) -> &'static str {
        if self.failure.is_some() {
            "failed"
        } else if self.diagnostics.as_ref().is_some_and(|d| d.any_flagged()) {
            "rhat_flagged"
        } else {
            "ok"
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RankingTable {
    pub rows: Vec<RankedCandidate>,
}

impl RankingTable {
    /// Lowest-LOOIC candidate, if any candidate was scored.
    pub fn best(&self) -> Option<&RankedCandidate> {
        self.rows.iter().find(|r| r.rank == Some(1))
    }

    pub fn failed(&self) -> impl Iterator<Item = &RankedCandidate> {
        self.rows.iter().filter(|r| r.failure.is_some())
    }
}

/// Rank scored candidates by ascending LOOIC; failed ones follow in input order.
pub fn rank_candidates(scored: Vec<ScoredCandidate>) -> RankingTable {
    let mut ok = Vec::new();
    let mut failed = Vec::new();
    for s in scored {
        match s.loo {
            Ok(loo) => ok.push((s.candidate, loo, s.diagnostics, s.cached)),
            Err(reason) => failed.push(RankedCandidate {
                candidate: s.candidate,
                rank: None,
                loo: None,
                delta_looic: None,
                se_delta: None,
                decisive: None,
                diagnostics: s.diagnostics,
                failure: Some(reason),
                cached: s.cached,
            }),
        }
    }

    // Ties broken by candidate id for a stable order.
    ok.sort_by(|a, b| {
        a.1.looic
            .partial_cmp(&b.1.looic)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.id.cmp(&b.0.id))
    });

    let best = ok.first().map(|(_, loo, _, _)| loo.clone());
    let mut rows: Vec<RankedCandidate> = ok
        .into_iter()
        .enumerate()
        .map(|(i, (candidate, loo, diagnostics, cached))| {
            let (delta, se) = match &best {
                Some(best) if i > 0 => compare(best, &loo),
                _ => (0.0, 0.0),
            };
            RankedCandidate {
                candidate,
                rank: Some(i + 1),
                delta_looic: Some(delta),
                se_delta: Some(se),
                decisive: Some(se.is_finite() && delta > 2.0 * se),
                loo: Some(loo),
                diagnostics,
                failure: None,
                cached,
            }
        })
        .collect();
    rows.extend(failed);
    RankingTable { rows }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{CandidateId, ChainResult, CovariateMeta, McmcConfig};
    use chrono::Utc;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    /// Fit whose log-likelihood comes from a normal model with a posterior over the mean.
    pub(crate) fn synthetic_fit(id: CandidateId, shift: f64, seed: u64) -> FitResult {
        let mut rng = StdRng::seed_from_u64(seed);
        let posterior = Normal::new(shift, 0.1).unwrap();
        let ys: Vec<f64> = (0..20).map(|i| (i as f64 - 10.0) / 10.0).collect();
        let chains = (0..2)
            .map(|_| {
                let mut log_lik = Vec::new();
                let mut scalars = Vec::new();
                for _ in 0..300 {
                    let mu = posterior.sample(&mut rng);
                    log_lik.push(
                        ys.iter()
                            .map(|y| -0.5 * (y - mu).powi(2) - 0.5 * (2.0 * std::f64::consts::PI).ln())
                            .collect(),
                    );
                    scalars.push(vec![mu]);
                }
                ChainResult {
                    draws: scalars.clone(),
                    scalars,
                    log_lik,
                }
            })
            .collect();
        FitResult {
            candidate: id,
            engine: "synthetic".to_string(),
            fitted_at: Utc::now(),
            fingerprint: 0,
            mcmc: McmcConfig::default(),
            adapt_attempts: 1,
            param_names: vec!["mu".to_string()],
            scalar_names: vec!["alpha".to_string()],
            chains,
        }
    }

    fn candidate(id: &str) -> ModelCandidate {
        ModelCandidate::with_covariate(CovariateMeta {
            id: id.to_string(),
            summary: "max7".to_string(),
            lag: 1,
        })
    }

    #[test]
    fn sanitized_values_are_strictly_worse_than_finite_ones() {
        let mut column = vec![-3.0, f64::NEG_INFINITY, -10.0, f64::NAN, -1.0];
        let replaced = sanitize_log_lik(&mut column);
        assert_eq!(replaced, 2);
        assert!(column.iter().all(|v| v.is_finite()));
        assert_eq!(column[1], -10.5);
        assert!(column[1] < -10.0 && column[3] < -10.0);

        let mut zero = vec![0.0, f64::NEG_INFINITY];
        sanitize_log_lik(&mut zero);
        assert!(zero[1] < 0.0);

        let mut empty = vec![f64::NAN, f64::NEG_INFINITY];
        assert_eq!(sanitize_log_lik(&mut empty), 2);
        assert_eq!(empty, vec![NON_FINITE_COLUMN_FILL; 2]);
    }

    #[test]
    fn loo_is_deterministic() {
        let fit = synthetic_fit(CandidateId::Baseline, 0.0, 3);
        let a = evaluate_loo(&fit).unwrap();
        let b = evaluate_loo(&fit).unwrap();
        assert_eq!(a, b);
        assert!(a.looic.is_finite() && a.se_looic > 0.0);
        assert!(a.p_loo > -0.1 && a.p_loo < 3.0, "p_loo={}", a.p_loo);
        assert_eq!(a.n_high_k, 0);
    }

    #[test]
    fn non_finite_draws_are_recovered_locally() {
        let mut fit = synthetic_fit(CandidateId::Baseline, 0.0, 4);
        fit.chains[0].log_lik[5][2] = f64::NEG_INFINITY;
        fit.chains[1].log_lik[7][9] = f64::NAN;
        let loo = evaluate_loo(&fit).unwrap();
        assert_eq!(loo.n_sanitized, 2);
        assert!(loo.looic.is_finite());
    }

    #[test]
    fn ranking_orders_by_looic_and_keeps_failures() {
        let good = evaluate_loo(&synthetic_fit(CandidateId::Baseline, 0.0, 1)).unwrap();
        let worse = evaluate_loo(&synthetic_fit(CandidateId::Covariate("a".into()), 1.5, 2)).unwrap();
        let table = rank_candidates(vec![
            ScoredCandidate {
                candidate: candidate("a"),
                loo: Ok(worse),
                diagnostics: None,
                cached: false,
            },
            ScoredCandidate {
                candidate: candidate("broken"),
                loo: Err("sampler exploded".to_string()),
                diagnostics: None,
                cached: false,
            },
            ScoredCandidate {
                candidate: ModelCandidate::baseline(),
                loo: Ok(good),
                diagnostics: None,
                cached: true,
            },
        ]);

        assert_eq!(table.rows.len(), 3);
        let best = table.best().unwrap();
        assert_eq!(best.candidate.id, CandidateId::Baseline);
        assert_eq!(best.delta_looic, Some(0.0));
        assert_eq!(best.decisive, Some(false));

        let second = &table.rows[1];
        assert_eq!(second.rank, Some(2));
        assert!(second.delta_looic.unwrap() > 0.0);
        assert_eq!(second.decisive, Some(true));

        let failed: Vec<_> = table.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status(), "failed");
        assert_eq!(failed[0].rank, None);
    }

    #[test]
    fn identical_candidates_are_not_decisive() {
        let loo = evaluate_loo(&synthetic_fit(CandidateId::Baseline, 0.2, 9)).unwrap();
        let (delta, se) = compare(&loo, &loo);
        assert_eq!(delta, 0.0);
        assert_eq!(se, 0.0);
    }
}
