//! Covariate summary functions.
//!
//! Upstream collaborators deliver daily environmental series per calendar year;
//! each candidate covariate names the summary that turns a season of daily
//! values into one number per year. Names are resolved once, when candidates
//! are constructed, through an explicit [`SummaryRegistry`].
//!
//! Built-in identifiers:
//!
//! - `min7`, `max7`, `median7`, `range7`: statistics of the 7-day rolling mean
//! - `exceed:<threshold>`: number of days strictly above `threshold`

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::domain::CovariateInput;
use crate::error::AppError;

/// Rolling window (days) used by the `*7` summaries.
pub const ROLLING_WINDOW: usize = 7;

/// Collapse one year of daily values into a single covariate value.
pub trait SummaryFunction: Send + Sync + fmt::Debug {
    fn name(&self) -> String;

    /// Returns `None` when the daily series is too short or contains non-finite values.
    fn summarize(&self, daily: &[f64]) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollingStat {
    Min,
    Max,
    Median,
    Range,
}

/// A statistic of the 7-day rolling mean.
#[derive(Debug, Clone, Copy)]
pub struct RollingMeanSummary {
    stat: RollingStat,
}

impl RollingMeanSummary {
    pub fn min() -> Self {
        Self { stat: RollingStat::Min }
    }

    pub fn max() -> Self {
        Self { stat: RollingStat::Max }
    }

    pub fn median() -> Self {
        Self { stat: RollingStat::Median }
    }

    pub fn range() -> Self {
        Self { stat: RollingStat::Range }
    }
}

impl SummaryFunction for RollingMeanSummary {
    fn name(&self) -> String {
        match self.stat {
            RollingStat::Min => "min7",
            RollingStat::Max => "max7",
            RollingStat::Median => "median7",
            RollingStat::Range => "range7",
        }
        .to_string()
    }

    fn summarize(&self, daily: &[f64]) -> Option<f64> {
        let mut means = rolling_means(daily, ROLLING_WINDOW)?;
        let lo = means.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = means.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let value = match self.stat {
            RollingStat::Min => lo,
            RollingStat::Max => hi,
            RollingStat::Range => hi - lo,
            RollingStat::Median => median_mut(&mut means)?,
        };
        value.is_finite().then_some(value)
    }
}

/// Count of days strictly above a threshold.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdExceedance {
    pub threshold: f64,
}

impl SummaryFunction for ThresholdExceedance {
    fn name(&self) -> String {
        format!("exceed:{}", self.threshold)
    }

    fn summarize(&self, daily: &[f64]) -> Option<f64> {
        if daily.is_empty() || daily.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(daily.iter().filter(|&&v| v > self.threshold).count() as f64)
    }
}

/// Identifier → summary implementation.
#[derive(Debug, Clone, Default)]
pub struct SummaryRegistry {
    entries: BTreeMap<String, Arc<dyn SummaryFunction>>,
}

impl SummaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the rolling-mean summaries.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RollingMeanSummary::min()));
        registry.register(Arc::new(RollingMeanSummary::max()));
        registry.register(Arc::new(RollingMeanSummary::median()));
        registry.register(Arc::new(RollingMeanSummary::range()));
        registry
    }

    pub fn register(&mut self, summary: Arc<dyn SummaryFunction>) {
        self.entries.insert(summary.name(), summary);
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Resolve a summary identifier.
    ///
    /// `exceed:<threshold>` is parameterized and resolved without registration.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn SummaryFunction>, AppError> {
        if let Some(found) = self.entries.get(name) {
            return Ok(Arc::clone(found));
        }
        if let Some(raw) = name.strip_prefix("exceed:") {
            let threshold: f64 = raw.trim().parse().map_err(|_| {
                AppError::model_spec(format!("Invalid exceedance threshold in summary '{name}'."))
            })?;
            if !threshold.is_finite() {
                return Err(AppError::model_spec(format!(
                    "Non-finite exceedance threshold in summary '{name}'."
                )));
            }
            return Ok(Arc::new(ThresholdExceedance { threshold }));
        }
        Err(AppError::model_spec(format!(
            "Unknown covariate summary '{name}' (known: {}, exceed:<threshold>).",
            self.names().join(", ")
        )))
    }
}

/// Summarize every year of a covariate input, sorted by year.
pub fn summarize_covariate(
    input: &CovariateInput,
    summary: &dyn SummaryFunction,
) -> Result<Vec<(i32, f64)>, AppError> {
    let mut out = Vec::with_capacity(input.values.len());
    for year in &input.values {
        let value = summary.summarize(&year.daily).ok_or_else(|| {
            AppError::alignment(format!(
                "Covariate '{}' cannot be summarized with '{}' in {} ({} daily values).",
                input.id,
                summary.name(),
                year.year,
                year.daily.len()
            ))
        })?;
        out.push((year.year, value));
    }
    out.sort_by_key(|(year, _)| *year);
    if out.windows(2).any(|w| w[0].0 == w[1].0) {
        return Err(AppError::alignment(format!(
            "Covariate '{}' has duplicate years.",
            input.id
        )));
    }
    Ok(out)
}

fn rolling_means(daily: &[f64], window: usize) -> Option<Vec<f64>> {
    if window == 0 || daily.len() < window || daily.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut sum: f64 = daily[..window].iter().sum();
    let mut out = Vec::with_capacity(daily.len() - window + 1);
    out.push(sum / window as f64);
    for i in window..daily.len() {
        sum += daily[i] - daily[i - window];
        out.push(sum / window as f64);
    }
    Some(out)
}

fn median_mut(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CovariateYear;

    fn ramp(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn rolling_mean_summaries_on_a_ramp() {
        // 7-day means of 0..10 are 3, 4, 5, 6.
        let daily = ramp(10);
        assert_eq!(RollingMeanSummary::min().summarize(&daily), Some(3.0));
        assert_eq!(RollingMeanSummary::max().summarize(&daily), Some(6.0));
        assert_eq!(RollingMeanSummary::median().summarize(&daily), Some(4.5));
        assert_eq!(RollingMeanSummary::range().summarize(&daily), Some(3.0));
    }

    #[test]
    fn short_series_cannot_be_summarized() {
        assert_eq!(RollingMeanSummary::min().summarize(&ramp(6)), None);
    }

    #[test]
    fn registry_resolves_builtins_and_thresholds() {
        let registry = SummaryRegistry::with_defaults();
        for name in ["min7", "max7", "median7", "range7"] {
            assert_eq!(registry.resolve(name).unwrap().name(), name);
        }
        let exceed = registry.resolve("exceed:4.5").unwrap();
        assert_eq!(exceed.summarize(&ramp(10)), Some(5.0));
        assert!(registry.resolve("mean30").is_err());
        assert!(registry.resolve("exceed:abc").is_err());
    }

    #[test]
    fn summarize_covariate_sorts_and_rejects_duplicates() {
        let registry = SummaryRegistry::with_defaults();
        let summary = registry.resolve("max7").unwrap();
        let mut input = CovariateInput {
            id: "flow".to_string(),
            summary: "max7".to_string(),
            lag: 1,
            include: true,
            values: vec![
                CovariateYear { year: 2001, daily: ramp(8) },
                CovariateYear { year: 2000, daily: ramp(7) },
            ],
        };
        let out = summarize_covariate(&input, summary.as_ref()).unwrap();
        assert_eq!(out, vec![(2000, 3.0), (2001, 4.0)]);

        input.values.push(CovariateYear { year: 2000, daily: ramp(7) });
        assert!(summarize_covariate(&input, summary.as_ref()).is_err());
    }
}
