//! Command-line parsing for the IPM model-selection tool.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! modeling code. Store location and seed fall back to `IPM_STORE_DIR` and
//! `IPM_SEED` (a `.env` file is honoured).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::HarvestKind;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "ipm", version, about = "Integrated population model fitting and LOO covariate selection")]
pub struct Cli {
    /// Enable debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit the baseline and every covariate candidate, then rank them by LOOIC.
    Select(SelectArgs),
    /// Write a synthetic dataset with known generating parameters.
    Simulate(SimulateArgs),
    /// Print the posterior summary of a stored candidate fit.
    Show(ShowArgs),
}

/// Options for a selection run.
#[derive(Debug, Parser, Clone)]
pub struct SelectArgs {
    /// Dataset JSON (escapement, harvest, age composition, covariates).
    #[arg(long, value_name = "JSON")]
    pub data: PathBuf,

    /// Directory of memoized fit results.
    #[arg(long, env = "IPM_STORE_DIR", default_value = ".ipm-store")]
    pub store: PathBuf,

    /// Directory for ranking.csv, diagnostics.csv and best_draws.json.
    #[arg(short, long, default_value = "ipm-out")]
    pub output: PathBuf,

    /// Run seed; per-candidate seeds are derived from it.
    #[arg(long, env = "IPM_SEED", default_value_t = 42)]
    pub seed: u64,

    /// Only fit these covariate ids (repeatable). The baseline is always fitted.
    #[arg(long = "only", value_name = "ID")]
    pub only: Vec<String>,

    /// Number of chains.
    #[arg(long, default_value_t = 3)]
    pub chains: usize,

    /// Iterations per adaptation round.
    #[arg(long, default_value_t = 500)]
    pub adapt: usize,

    /// Maximum adaptation rounds before a candidate fails.
    #[arg(long, default_value_t = 5)]
    pub max_adapt_attempts: usize,

    /// Burn-in iterations per chain.
    #[arg(long, default_value_t = 2000)]
    pub burn_in: usize,

    /// Post-burn-in iterations per chain (before thinning).
    #[arg(long, default_value_t = 2000)]
    pub draws: usize,

    /// Keep every n-th iteration.
    #[arg(long, default_value_t = 2)]
    pub thin: usize,

    /// Rhat above this value raises a convergence warning.
    #[arg(long, default_value_t = 1.1)]
    pub rhat_threshold: f64,

    /// Harvest observation model.
    #[arg(long, value_enum, default_value_t = HarvestKind::Known)]
    pub harvest: HarvestKind,

    /// Observation SD of log harvest (lognormal harvest model only).
    #[arg(long, default_value_t = 0.1)]
    pub harvest_sd: f64,

    /// Skip writing best_draws.json.
    #[arg(long)]
    pub no_draws: bool,
}

/// Options for synthetic data generation.
#[derive(Debug, Parser, Clone)]
pub struct SimulateArgs {
    /// Output dataset JSON.
    #[arg(short, long, value_name = "JSON")]
    pub output: PathBuf,

    #[arg(long, env = "IPM_SEED", default_value_t = 42)]
    pub seed: u64,

    /// Number of calendar years.
    #[arg(long, default_value_t = 30)]
    pub years: usize,

    #[arg(long, default_value_t = 1990)]
    pub first_year: i32,

    /// Ricker productivity.
    #[arg(long, default_value_t = 2.0)]
    pub alpha: f64,

    /// Ricker density dependence.
    #[arg(long, default_value_t = 1.0e-3)]
    pub beta: f64,

    /// Effect of the `flow_max` covariate on ln(alpha).
    #[arg(long, default_value_t = 0.3)]
    pub effect: f64,

    /// Harvest rate applied to the run each year.
    #[arg(long, default_value_t = 0.2)]
    pub harvest_rate: f64,
}

/// Options for inspecting a stored fit.
#[derive(Debug, Parser, Clone)]
pub struct ShowArgs {
    /// Candidate id (`baseline` or a covariate id).
    pub candidate: String,

    #[arg(long, env = "IPM_STORE_DIR", default_value = ".ipm-store")]
    pub store: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_defaults_match_run_defaults() {
        let cli = Cli::parse_from(["ipm", "select", "--data", "d.json", "--store", "s"]);
        let Command::Select(args) = cli.command else {
            panic!("expected select");
        };
        assert_eq!(args.chains, 3);
        assert_eq!(args.thin, 2);
        assert_eq!(args.harvest, HarvestKind::Known);
        assert!(args.only.is_empty());
    }

    #[test]
    fn only_is_repeatable() {
        let cli = Cli::parse_from([
            "ipm", "select", "--data", "d.json", "--only", "flow", "--only", "snow", "--harvest", "lognormal",
        ]);
        let Command::Select(args) = cli.command else {
            panic!("expected select");
        };
        assert_eq!(args.only, vec!["flow", "snow"]);
        assert_eq!(args.harvest, HarvestKind::Lognormal);
    }
}
