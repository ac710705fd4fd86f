//! Calendar-year / brood-year alignment of raw observation series.
//!
//! Indexing conventions used everywhere downstream:
//!
//! - calendar year `t ∈ 0..n_yrs` is `first_year + t`
//! - brood year `b ∈ 0..n_brood` (with `n_brood = n_yrs - age_min`) spawns in
//!   calendar year `b`; its age-`a` offspring return in calendar year `b + a`
//! - age class index `i ∈ 0..A` is age `age_min + i`
//!
//! Two kinds of cells cannot be computed from modeled broods:
//!
//! - *unresolved* cells `(t, i)` with `t < age(i)`: the parent brood precedes
//!   the first modeled brood, so the cell is drawn from a shared
//!   hyper-distribution in the model
//! - cells of *incomplete* recent broods that fall after the last calendar year;
//!   they never enter the likelihood

use tracing::{debug, info};

use crate::data::covariate::{SummaryRegistry, summarize_covariate};
use crate::domain::{AgeRange, CovariateMeta, Dataset, RunConfig, StableDigest, YearCount};
use crate::error::AppError;

/// One covariate aligned to brood years.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedCovariate {
    pub meta: CovariateMeta,
    /// Summary value acting on brood `b`, i.e. calendar year `b + lag`.
    pub raw: Vec<f64>,
    /// `raw` standardized to zero mean and unit standard deviation.
    pub standardized: Vec<f64>,
}

/// Immutable, index-aligned inputs for every candidate of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedData {
    pub stock: String,
    pub first_year: i32,
    pub ages: AgeRange,
    pub n_yrs: usize,
    pub n_brood: usize,
    pub escapement: Vec<f64>,
    pub harvest: Vec<f64>,
    /// `n_yrs × A` age counts after zero-total replacement.
    pub age_counts: Vec<Vec<f64>>,
    /// Multinomial order `Y_t` (sum of the row of `age_counts`).
    pub age_totals: Vec<f64>,
    /// True where a zero-total year was replaced by uniform pseudo-counts.
    pub age_comp_imputed: Vec<bool>,
    /// Cells `(t, age_index)` whose parent brood precedes the data.
    pub unresolved_cells: Vec<(usize, usize)>,
    /// Whether every age of brood `b` returns within the data window.
    pub brood_complete: Vec<bool>,
    pub covariates: Vec<AlignedCovariate>,
}

impl AlignedData {
    pub fn n_ages(&self) -> usize {
        self.ages.count()
    }

    pub fn year(&self, t: usize) -> i32 {
        self.first_year + t as i32
    }

    /// Number of per-observation log-likelihood terms (escapement + age composition).
    pub fn n_observations(&self) -> usize {
        2 * self.n_yrs
    }

    pub fn covariate(&self, id: &str) -> Option<&AlignedCovariate> {
        self.covariates.iter().find(|c| c.meta.id == id)
    }

    /// Stable hash of everything the likelihood depends on.
    pub fn fingerprint(&self) -> u64 {
        let mut digest = StableDigest::new();
        digest
            .str(&self.stock)
            .i64(i64::from(self.first_year))
            .u64(self.ages.min as u64)
            .u64(self.ages.max as u64)
            .f64s(&self.escapement)
            .f64s(&self.harvest);
        for row in &self.age_counts {
            digest.f64s(row);
        }
        for cov in &self.covariates {
            digest
                .str(&cov.meta.id)
                .str(&cov.meta.summary)
                .u64(cov.meta.lag as u64)
                .f64s(&cov.raw);
        }
        digest.finish()
    }
}

/// Builds [`AlignedData`] from a raw [`Dataset`].
pub struct DataAligner<'a> {
    config: &'a RunConfig,
    registry: &'a SummaryRegistry,
}

impl<'a> DataAligner<'a> {
    pub fn new(config: &'a RunConfig, registry: &'a SummaryRegistry) -> Self {
        Self { config, registry }
    }

    pub fn align(&self, dataset: &Dataset) -> Result<AlignedData, AppError> {
        let ages = AgeRange::new(dataset.age_min, dataset.age_max);
        if ages.min < 1 || ages.max < ages.min {
            return Err(AppError::model_spec(format!(
                "Invalid age range {}..={} (need 1 <= age_min <= age_max).",
                ages.min, ages.max
            )));
        }
        let n_ages = ages.count();

        let (first_year, escapement) = contiguous_series("escapement", &dataset.escapement)?;
        let n_yrs = escapement.len();
        if n_yrs <= ages.max {
            return Err(AppError::model_spec(format!(
                "{n_yrs} years of data cannot resolve ages up to {} (need more than age_max years).",
                ages.max
            )));
        }
        if let Some((t, e)) = escapement.iter().enumerate().find(|(_, e)| !(e.is_finite() && **e > 0.0)) {
            return Err(AppError::alignment(format!(
                "Escapement must be positive; got {e} in {}.",
                first_year + t as i32
            )));
        }

        let (harvest_first, harvest) = contiguous_series("harvest", &dataset.harvest)?;
        if harvest_first != first_year || harvest.len() != n_yrs {
            return Err(AppError::alignment(format!(
                "Harvest covers {}..={} but escapement covers {}..={}.",
                harvest_first,
                harvest_first + harvest.len() as i32 - 1,
                first_year,
                first_year + n_yrs as i32 - 1
            )));
        }
        if let Some((t, h)) = harvest.iter().enumerate().find(|(_, h)| !(h.is_finite() && **h >= 0.0)) {
            return Err(AppError::alignment(format!(
                "Harvest must be non-negative; got {h} in {}.",
                first_year + t as i32
            )));
        }

        let (age_counts, age_totals, age_comp_imputed) =
            align_age_composition(dataset, first_year, n_yrs, n_ages)?;

        let n_brood = n_yrs - ages.min;
        let mut unresolved_cells = Vec::new();
        for t in 0..n_yrs {
            for i in 0..n_ages {
                if t < ages.age(i) {
                    unresolved_cells.push((t, i));
                }
            }
        }
        let brood_complete: Vec<bool> = (0..n_brood).map(|b| b + ages.max < n_yrs).collect();

        let covariates = self.align_covariates(dataset, ages, first_year, n_brood)?;

        let imputed_years = age_comp_imputed.iter().filter(|&&f| f).count();
        let incomplete = brood_complete.iter().filter(|&&c| !c).count();
        info!(
            stock = %dataset.stock,
            first_year,
            n_yrs,
            n_brood,
            covariates = covariates.len(),
            "Aligned observation series"
        );
        debug!(
            imputed_age_years = imputed_years,
            unresolved_cells = unresolved_cells.len(),
            incomplete_broods = incomplete,
            "Alignment details"
        );

        Ok(AlignedData {
            stock: dataset.stock.clone(),
            first_year,
            ages,
            n_yrs,
            n_brood,
            escapement,
            harvest,
            age_counts,
            age_totals,
            age_comp_imputed,
            unresolved_cells,
            brood_complete,
            covariates,
        })
    }

    fn align_covariates(
        &self,
        dataset: &Dataset,
        ages: AgeRange,
        first_year: i32,
        n_brood: usize,
    ) -> Result<Vec<AlignedCovariate>, AppError> {
        let mut out = Vec::new();
        for input in &dataset.covariates {
            if !input.include {
                continue;
            }
            if !self.config.only.is_empty() && !self.config.only.iter().any(|id| id == &input.id) {
                continue;
            }
            if out.iter().any(|c: &AlignedCovariate| c.meta.id == input.id) {
                return Err(AppError::alignment(format!("Duplicate covariate id '{}'.", input.id)));
            }
            if input.lag > ages.max {
                return Err(AppError::model_spec(format!(
                    "Covariate '{}' lag {} exceeds age_max {}.",
                    input.id, input.lag, ages.max
                )));
            }

            let summary = self.registry.resolve(&input.summary)?;
            let yearly = summarize_covariate(input, summary.as_ref())?;

            let mut raw = Vec::with_capacity(n_brood);
            for b in 0..n_brood {
                let year = first_year + (b + input.lag) as i32;
                let value = yearly
                    .iter()
                    .find(|(y, _)| *y == year)
                    .map(|(_, v)| *v)
                    .ok_or_else(|| {
                        AppError::alignment(format!(
                            "Covariate '{}' (lag {}) has no value for {year}; brood years need {}..={}.",
                            input.id,
                            input.lag,
                            first_year + input.lag as i32,
                            first_year + (n_brood - 1 + input.lag) as i32
                        ))
                    })?;
                raw.push(value);
            }

            let standardized = standardize(&raw).ok_or_else(|| {
                AppError::alignment(format!(
                    "Covariate '{}' is constant over the brood years and carries no signal.",
                    input.id
                ))
            })?;

            out.push(AlignedCovariate {
                meta: CovariateMeta {
                    id: input.id.clone(),
                    summary: summary.name(),
                    lag: input.lag,
                },
                raw,
                standardized,
            });
        }
        Ok(out)
    }
}

/// Sort a `(year, count)` series and require contiguous, unique years.
fn contiguous_series(label: &str, series: &[YearCount]) -> Result<(i32, Vec<f64>), AppError> {
    if series.is_empty() {
        return Err(AppError::alignment(format!("The {label} series is empty.")));
    }
    let mut sorted: Vec<&YearCount> = series.iter().collect();
    sorted.sort_by_key(|r| r.year);
    let first = sorted[0].year;
    for (t, row) in sorted.iter().enumerate() {
        let expected = first + t as i32;
        if row.year != expected {
            return Err(AppError::alignment(format!(
                "The {label} series is not contiguous: expected {expected}, found {}.",
                row.year
            )));
        }
    }
    Ok((first, sorted.iter().map(|r| r.count).collect()))
}

type AgeComposition = (Vec<Vec<f64>>, Vec<f64>, Vec<bool>);

fn align_age_composition(
    dataset: &Dataset,
    first_year: i32,
    n_yrs: usize,
    n_ages: usize,
) -> Result<AgeComposition, AppError> {
    let mut rows: Vec<Option<&[f64]>> = vec![None; n_yrs];
    for row in &dataset.age_composition {
        let t = row.year - first_year;
        if t < 0 || t as usize >= n_yrs {
            return Err(AppError::alignment(format!(
                "Age composition year {} is outside {}..={}.",
                row.year,
                first_year,
                first_year + n_yrs as i32 - 1
            )));
        }
        let t = t as usize;
        if rows[t].is_some() {
            return Err(AppError::alignment(format!("Duplicate age composition year {}.", row.year)));
        }
        if row.counts.len() != n_ages {
            return Err(AppError::alignment(format!(
                "Age composition for {} has {} classes; expected {n_ages}.",
                row.year,
                row.counts.len()
            )));
        }
        if row.counts.iter().any(|c| !(c.is_finite() && *c >= 0.0)) {
            return Err(AppError::alignment(format!(
                "Age counts for {} must be finite and non-negative.",
                row.year
            )));
        }
        rows[t] = Some(row.counts.as_slice());
    }

    let mut counts = Vec::with_capacity(n_yrs);
    let mut totals = Vec::with_capacity(n_yrs);
    let mut imputed = Vec::with_capacity(n_yrs);
    for (t, row) in rows.into_iter().enumerate() {
        let row = row.ok_or_else(|| {
            AppError::alignment(format!("Missing age composition for {}.", first_year + t as i32))
        })?;
        let total: f64 = row.iter().sum();
        if total > 0.0 {
            counts.push(row.to_vec());
            totals.push(total);
            imputed.push(false);
        } else {
            // Uninformative uniform pseudo-counts summing to A.
            counts.push(vec![1.0; n_ages]);
            totals.push(n_ages as f64);
            imputed.push(true);
        }
    }
    Ok((counts, totals, imputed))
}

fn standardize(values: &[f64]) -> Option<Vec<f64>> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n as f64 - 1.0);
    let sd = var.sqrt();
    if !(sd.is_finite() && sd > 1e-12) {
        return None;
    }
    Some(values.iter().map(|v| (v - mean) / sd).collect())
}
