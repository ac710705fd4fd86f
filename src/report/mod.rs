//! Reporting utilities: posterior summaries and formatted terminal output.

pub mod format;

pub use format::*;

use serde::Serialize;

use crate::domain::FitResult;
use crate::error::AppError;
use crate::models::IpmModel;

/// Posterior median and central 90% interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Interval {
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    /// Summarize draws; `None` when there are no finite values.
    pub fn from_draws(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(Self {
            median: quantile(&sorted, 0.5),
            lower: quantile(&sorted, 0.05),
            upper: quantile(&sorted, 0.95),
        })
    }
}

/// Linear-interpolation quantile of sorted values.
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Posterior summary of every derived scalar.
pub fn summarize_scalars(fit: &FitResult) -> Vec<(String, Interval)> {
    fit.scalar_names
        .iter()
        .filter_map(|name| {
            let traces = fit.scalar_traces(name)?;
            let pooled: Vec<f64> = traces.into_iter().flatten().collect();
            Interval::from_draws(&pooled).map(|i| (name.clone(), i))
        })
        .collect()
}

/// Posterior summary of the latent trajectory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSummary {
    pub years: Vec<i32>,
    pub run: Vec<Interval>,
    pub spawners: Vec<Interval>,
    pub brood_years: Vec<i32>,
    pub recruits: Vec<Interval>,
    pub brood_complete: Vec<bool>,
    pub age_comp_imputed: Vec<bool>,
}

/// Re-evaluate every retained draw and summarize run, spawners and recruits.
pub fn summarize_states(fit: &FitResult, model: &IpmModel) -> Result<StateSummary, AppError> {
    let data = model.data();
    let n_yrs = data.n_yrs;
    let n_brood = data.n_brood;
    let mut run = vec![Vec::new(); n_yrs];
    let mut spawners = vec![Vec::new(); n_yrs];
    let mut recruits = vec![Vec::new(); n_brood];

    for draw in fit.chains.iter().flat_map(|c| &c.draws) {
        let states = model
            .states(draw)
            .ok_or_else(|| AppError::engine("Stored draw lies outside the model's support."))?;
        for t in 0..n_yrs {
            run[t].push(states.run[t]);
            spawners[t].push(states.spawners[t]);
        }
        for b in 0..n_brood {
            recruits[b].push(states.recruits[b]);
        }
    }

    let summarize = |columns: Vec<Vec<f64>>| -> Result<Vec<Interval>, AppError> {
        columns
            .iter()
            .map(|c| Interval::from_draws(c).ok_or_else(|| AppError::engine("No draws to summarize.")))
            .collect()
    };

    Ok(StateSummary {
        years: (0..n_yrs).map(|t| data.year(t)).collect(),
        run: summarize(run)?,
        spawners: summarize(spawners)?,
        brood_years: (0..n_brood).map(|b| data.year(b)).collect(),
        recruits: summarize(recruits)?,
        brood_complete: data.brood_complete.clone(),
        age_comp_imputed: data.age_comp_imputed.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CandidateId;
    use crate::fit::selection::tests::synthetic_fit;

    #[test]
    fn quantiles_interpolate() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&sorted, 0.5), 3.0);
        assert_eq!(quantile(&sorted, 0.0), 1.0);
        assert!((quantile(&sorted, 0.05) - 1.2).abs() < 1e-12);
    }

    #[test]
    fn interval_skips_non_finite_values() {
        let interval = Interval::from_draws(&[f64::NAN, 2.0, 1.0, 3.0]).unwrap();
        assert_eq!(interval.median, 2.0);
        assert!(Interval::from_draws(&[f64::NAN]).is_none());
    }

    #[test]
    fn scalar_summary_pools_chains() {
        let fit = synthetic_fit(CandidateId::Baseline, 1.0, 4);
        let summary = summarize_scalars(&fit);
        assert_eq!(summary.len(), 1);
        let (name, interval) = &summary[0];
        assert_eq!(name, "alpha");
        assert!((interval.median - 1.0).abs() < 0.05);
        assert!(interval.lower < interval.median && interval.median < interval.upper);
    }
}
