//! Convergence diagnostics for a fitted candidate.
//!
//! Computed per monitored derived scalar (see `FitResult::scalar_names`):
//!
//! - split-chain Gelman–Rubin `R̂`, flagged above the configured threshold
//! - lag autocorrelation at `k·thin` iterations (`k = 1..=5`), averaged over chains
//! - multi-chain effective sample size
//!
//! Diagnostics are advisory: they annotate the ranking, they never block it.

use std::fmt;

use serde::Serialize;

use crate::domain::{CandidateId, FitResult};
use crate::math::{autocorrelation, effective_sample_size};

/// Number of thinned lags reported per parameter.
pub const AUTOCORRELATION_LAGS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterDiagnostics {
    pub name: String,
    pub rhat: f64,
    pub ess: f64,
    /// `(lag in iterations, autocorrelation)`.
    pub autocorrelation: Vec<(usize, f64)>,
    pub flagged: bool,
}

/// `R̂` above threshold for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceWarning {
    pub candidate: CandidateId,
    pub parameter: String,
    pub rhat: f64,
    pub threshold: f64,
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: Rhat for {} is {:.3} (threshold {:.2})",
            self.candidate, self.parameter, self.rhat, self.threshold
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConvergenceReport {
    pub candidate: CandidateId,
    pub rhat_threshold: f64,
    pub parameters: Vec<ParameterDiagnostics>,
}

impl ConvergenceReport {
    pub fn max_rhat(&self) -> f64 {
        self.parameters.iter().map(|p| p.rhat).fold(f64::NAN, f64::max)
    }

    pub fn min_ess(&self) -> f64 {
        self.parameters.iter().map(|p| p.ess).fold(f64::NAN, f64::min)
    }

    pub fn any_flagged(&self) -> bool {
        self.parameters.iter().any(|p| p.flagged)
    }

    pub fn warnings(&self) -> Vec<ConvergenceWarning> {
        self.parameters
            .iter()
            .filter(|p| p.flagged)
            .map(|p| ConvergenceWarning {
                candidate: self.candidate.clone(),
                parameter: p.name.clone(),
                rhat: p.rhat,
                threshold: self.rhat_threshold,
            })
            .collect()
    }
}

/// Split-chain potential scale reduction factor.
///
/// Every chain is cut into two halves (the middle draw of an odd-length chain
/// is dropped). Constant input yields 1.
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let n = chains.iter().map(|c| c.len()).min().unwrap_or(0);
    let half = n / 2;
    if chains.is_empty() || half < 2 {
        return f64::NAN;
    }
    let mut halves: Vec<&[f64]> = Vec::with_capacity(2 * chains.len());
    for chain in chains {
        let chain = &chain[..n];
        halves.push(&chain[..half]);
        halves.push(&chain[n - half..]);
    }

    let m = halves.len() as f64;
    let h = half as f64;
    let means: Vec<f64> = halves.iter().map(|c| c.iter().sum::<f64>() / h).collect();
    let within: f64 = halves
        .iter()
        .zip(&means)
        .map(|(c, mu)| c.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / (h - 1.0))
        .sum::<f64>()
        / m;
    let grand = means.iter().sum::<f64>() / m;
    let between_over_n = means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>() / (m - 1.0);

    if within <= 0.0 {
        return if between_over_n <= 0.0 { 1.0 } else { f64::INFINITY };
    }
    let var_plus = (h - 1.0) / h * within + between_over_n;
    (var_plus / within).sqrt()
}

/// Diagnose every derived scalar of a fit.
pub fn diagnose(fit: &FitResult, rhat_threshold: f64) -> ConvergenceReport {
    let thin = fit.mcmc.thin.max(1);
    let parameters = fit
        .scalar_names
        .iter()
        .filter_map(|name| {
            let traces = fit.scalar_traces(name)?;
            let rhat = split_rhat(&traces);
            let autocorrelation = (1..=AUTOCORRELATION_LAGS)
                .map(|k| {
                    let mean = traces.iter().map(|c| autocorrelation(c, k)).sum::<f64>() / traces.len() as f64;
                    (k * thin, mean)
                })
                .collect();
            Some(ParameterDiagnostics {
                name: name.clone(),
                rhat,
                ess: effective_sample_size(&traces),
                autocorrelation,
                flagged: !(rhat <= rhat_threshold),
            })
        })
        .collect();
    ConvergenceReport {
        candidate: fit.candidate.clone(),
        rhat_threshold,
        parameters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::selection::tests::synthetic_fit;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn normal_chain(seed: u64, mean: f64, n: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(mean, 1.0).unwrap();
        (0..n).map(|_| normal.sample(&mut rng)).collect()
    }

    #[test]
    fn independent_chains_have_rhat_near_one() {
        let chains = vec![normal_chain(1, 0.0, 500), normal_chain(2, 0.0, 500), normal_chain(3, 0.0, 500)];
        let rhat = split_rhat(&chains);
        assert!((rhat - 1.0).abs() < 0.02, "rhat={rhat}");
    }

    #[test]
    fn shifted_chains_are_flagged() {
        let chains = vec![normal_chain(1, 0.0, 500), normal_chain(2, 3.0, 500)];
        assert!(split_rhat(&chains) > 1.1);
    }

    #[test]
    fn constant_chains_have_unit_rhat() {
        assert_eq!(split_rhat(&[vec![2.0; 10], vec![2.0; 10]]), 1.0);
        assert!(split_rhat(&[vec![1.0; 3]]).is_nan());
    }

    #[test]
    fn report_covers_every_scalar_with_thinned_lags() {
        let fit = synthetic_fit(CandidateId::Baseline, 0.0, 5);
        let report = diagnose(&fit, 1.1);
        assert_eq!(report.parameters.len(), fit.scalar_names.len());
        let alpha = &report.parameters[0];
        let lags: Vec<usize> = alpha.autocorrelation.iter().map(|(lag, _)| *lag).collect();
        assert_eq!(lags, vec![2, 4, 6, 8, 10]);
        assert!(!report.any_flagged());
        assert!(report.warnings().is_empty());
        assert!(report.min_ess() > 100.0);
    }

    #[test]
    fn warnings_name_the_flagged_parameter() {
        let mut fit = synthetic_fit(CandidateId::Baseline, 0.0, 6);
        for row in &mut fit.chains[1].scalars {
            row[0] += 5.0;
        }
        let report = diagnose(&fit, 1.1);
        let warnings = report.warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].parameter, "alpha");
        assert!(warnings[0].to_string().contains("alpha"));
    }
}
