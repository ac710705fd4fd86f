//! Synthetic datasets from known generating parameters.
//!
//! The simulator runs the same process the IPM assumes (Ricker recruitment
//! with AR(1) residuals, Dirichlet maturation, log-normal escapement error,
//! multinomial age samples) and emits a [`Dataset`] plus the true latent
//! trajectory. Broods that spawn before the first calendar year are seeded
//! from `initial_recruits`, so early years start away from equilibrium.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Binomial, Dirichlet, Normal};

use crate::domain::{AgeCompRow, AgeRange, CovariateInput, CovariateYear, Dataset, YearCount};
use crate::error::AppError;

/// One simulated environmental covariate.
#[derive(Debug, Clone, PartialEq)]
pub struct SimCovariate {
    pub id: String,
    pub summary: String,
    pub lag: usize,
    /// Effect on `ln α` per standard deviation of the yearly driver.
    pub effect: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationParams {
    pub stock: String,
    pub first_year: i32,
    pub n_yrs: usize,
    pub ages: AgeRange,
    pub alpha: f64,
    pub beta: f64,
    pub phi: f64,
    pub sigma_r: f64,
    pub sigma_s: f64,
    pub maturation_mean: Vec<f64>,
    pub pi_conc: f64,
    pub harvest_rate: f64,
    /// Fish aged per year.
    pub age_sample_size: u64,
    pub initial_recruits: f64,
    pub covariates: Vec<SimCovariate>,
    pub days_per_year: usize,
    pub seed: u64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            stock: "synthetic".to_string(),
            first_year: 1990,
            n_yrs: 30,
            ages: AgeRange::new(3, 5),
            alpha: 2.0,
            beta: 1.0e-3,
            phi: 0.3,
            sigma_r: 0.3,
            sigma_s: 0.1,
            maturation_mean: vec![0.25, 0.55, 0.2],
            pi_conc: 40.0,
            harvest_rate: 0.2,
            age_sample_size: 150,
            initial_recruits: 300.0,
            covariates: vec![
                SimCovariate {
                    id: "flow_max".to_string(),
                    summary: "max7".to_string(),
                    lag: 1,
                    effect: 0.3,
                },
                SimCovariate {
                    id: "flow_min".to_string(),
                    summary: "min7".to_string(),
                    lag: 1,
                    effect: 0.0,
                },
            ],
            days_per_year: 60,
            seed: 42,
        }
    }
}

/// True latent trajectory behind a simulated dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationTruth {
    pub run: Vec<f64>,
    pub spawners: Vec<f64>,
    pub harvest: Vec<f64>,
    /// Recruits of modeled broods `0..n_brood`.
    pub recruits: Vec<f64>,
    pub ln_alpha: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct Simulation {
    pub dataset: Dataset,
    pub truth: SimulationTruth,
}

fn validate(params: &SimulationParams) -> Result<(), AppError> {
    let ages = params.ages;
    if ages.min < 1 || ages.max < ages.min || params.n_yrs <= ages.max {
        return Err(AppError::config(format!(
            "Cannot simulate ages {}..={} over {} years.",
            ages.min, ages.max, params.n_yrs
        )));
    }
    if params.maturation_mean.len() != ages.count()
        || params.maturation_mean.iter().any(|p| !(p.is_finite() && *p > 0.0))
    {
        return Err(AppError::config("Maturation mean needs one positive entry per age."));
    }
    if !(params.alpha > 0.0 && params.beta > 0.0 && params.pi_conc > 0.0 && params.initial_recruits > 0.0) {
        return Err(AppError::config("alpha, beta, pi and initial recruits must be positive."));
    }
    if !(params.phi.abs() < 1.0 && params.sigma_r > 0.0 && params.sigma_s > 0.0) {
        return Err(AppError::config("Need |phi| < 1 and positive error scales."));
    }
    if !(0.0..1.0).contains(&params.harvest_rate) {
        return Err(AppError::config("Harvest rate must lie in [0, 1)."));
    }
    if params.age_sample_size == 0 || params.days_per_year < 7 {
        return Err(AppError::config("Need a positive age sample and at least 7 days per year."));
    }
    if params.covariates.iter().any(|c| c.lag > ages.max) {
        return Err(AppError::config("Covariate lags cannot exceed age_max."));
    }
    Ok(())
}

pub fn simulate(params: &SimulationParams) -> Result<Simulation, AppError> {
    validate(params)?;
    let ages = params.ages;
    let n_yrs = params.n_yrs;
    let n_ages = ages.count();
    let n_brood = n_yrs - ages.min;

    let mut rng = StdRng::seed_from_u64(params.seed);
    let std_normal =
        Normal::new(0.0, 1.0).map_err(|e| AppError::config(format!("Noise distribution error: {e}")))?;
    let mat_total: f64 = params.maturation_mean.iter().sum();
    let conc: Vec<f64> = params
        .maturation_mean
        .iter()
        .map(|p| p / mat_total * params.pi_conc)
        .collect();
    let dirichlet =
        Dirichlet::new(&conc).map_err(|e| AppError::config(format!("Maturation distribution error: {e}")))?;

    // Yearly drivers cover every calendar year a lagged covariate can reach.
    let driver_years = n_yrs + ages.max;
    let drivers: Vec<Vec<f64>> = params
        .covariates
        .iter()
        .map(|_| (0..driver_years).map(|_| std_normal.sample(&mut rng)).collect())
        .collect();

    // Brood slot k holds brood year k - age_max.
    let offset = ages.max;
    let mut recruits = vec![0.0; offset + n_brood];
    let mut maturation = vec![Vec::new(); offset + n_brood];
    for k in 0..offset {
        recruits[k] = params.initial_recruits * (params.sigma_r * std_normal.sample(&mut rng)).exp();
        maturation[k] = dirichlet.sample(&mut rng);
    }

    let mut run = Vec::with_capacity(n_yrs);
    let mut harvest = Vec::with_capacity(n_yrs);
    let mut spawners = Vec::with_capacity(n_yrs);
    let mut returns = Vec::with_capacity(n_yrs);
    let mut ln_alpha = Vec::with_capacity(n_brood);
    let mut prev_w = 0.0;
    for t in 0..n_yrs {
        let row: Vec<f64> = (0..n_ages)
            .map(|i| {
                let k = t + offset - ages.age(i);
                recruits[k] * maturation[k][i]
            })
            .collect();
        let total: f64 = row.iter().sum();
        let h = params.harvest_rate * total;
        let s = total - h;
        run.push(total);
        harvest.push(h);
        spawners.push(s);
        returns.push(row);

        if t < n_brood {
            let effect: f64 = params
                .covariates
                .iter()
                .zip(&drivers)
                .map(|(c, x)| c.effect * x[t + c.lag])
                .sum();
            let la = params.alpha.ln() + effect;
            let innovation = std_normal.sample(&mut rng) * params.sigma_r;
            let w = if t == 0 {
                innovation / (1.0 - params.phi * params.phi).sqrt()
            } else {
                params.phi * prev_w + innovation
            };
            recruits[t + offset] = (la + s.ln() - params.beta * s + w).exp();
            maturation[t + offset] = dirichlet.sample(&mut rng);
            ln_alpha.push(la);
            prev_w = w;
        }
    }

    let year = |t: usize| params.first_year + t as i32;
    let escapement: Vec<YearCount> = spawners
        .iter()
        .enumerate()
        .map(|(t, s)| YearCount {
            year: year(t),
            count: s * (params.sigma_s * std_normal.sample(&mut rng)).exp(),
        })
        .collect();
    let harvest_obs: Vec<YearCount> = harvest
        .iter()
        .enumerate()
        .map(|(t, h)| YearCount { year: year(t), count: *h })
        .collect();

    let mut age_composition = Vec::with_capacity(n_yrs);
    for (t, row) in returns.iter().enumerate() {
        let counts = multinomial(&mut rng, params.age_sample_size, row)?;
        age_composition.push(AgeCompRow { year: year(t), counts });
    }

    let mut covariates = Vec::with_capacity(params.covariates.len());
    for (c, x) in params.covariates.iter().zip(&drivers) {
        let values = x
            .iter()
            .enumerate()
            .map(|(t, &level)| CovariateYear {
                year: year(t),
                daily: daily_series(&mut rng, level, params.days_per_year),
            })
            .collect();
        covariates.push(CovariateInput {
            id: c.id.clone(),
            summary: c.summary.clone(),
            lag: c.lag,
            include: true,
            values,
        });
    }

    Ok(Simulation {
        dataset: Dataset {
            stock: params.stock.clone(),
            age_min: ages.min,
            age_max: ages.max,
            escapement,
            harvest: harvest_obs,
            age_composition,
            covariates,
        },
        truth: SimulationTruth {
            run,
            spawners,
            harvest,
            recruits: recruits[offset..].to_vec(),
            ln_alpha,
        },
    })
}

/// Multinomial draw by sequential conditional binomials.
fn multinomial(rng: &mut StdRng, n: u64, weights: &[f64]) -> Result<Vec<f64>, AppError> {
    let total: f64 = weights.iter().sum();
    let mut remaining = n;
    let mut mass = 1.0;
    let mut out = Vec::with_capacity(weights.len());
    for (i, w) in weights.iter().enumerate() {
        let p = w / total;
        let count = if i + 1 == weights.len() || remaining == 0 {
            remaining
        } else {
            let q = (p / mass).clamp(0.0, 1.0);
            Binomial::new(remaining, q)
                .map_err(|e| AppError::config(format!("Age sampling error: {e}")))?
                .sample(rng)
        };
        out.push(count as f64);
        remaining -= count;
        mass -= p;
    }
    Ok(out)
}

/// A season of daily values whose level tracks the yearly driver.
fn daily_series(rng: &mut StdRng, level: f64, days: usize) -> Vec<f64> {
    (0..days)
        .map(|d| {
            let season = (2.0 * std::f64::consts::PI * d as f64 / days as f64).sin();
            100.0 + 25.0 * level + 10.0 * season + rng.gen_range(-2.0..2.0)
        })
        .collect()
}
