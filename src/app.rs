//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - loads `.env` and installs the tracing subscriber
//! - parses CLI arguments
//! - runs candidate fitting + LOO selection, or simulation, or inspection
//! - prints reports and writes exports

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::{Command, SelectArgs, ShowArgs, SimulateArgs};
use crate::data::simulate::{SimCovariate, SimulationParams, simulate};
use crate::domain::{CandidateId, HarvestKind, HarvestModel, McmcConfig, RunConfig};
use crate::error::AppError;
use crate::fit::store::{FileStore, ResultStore};

pub mod pipeline;

/// Entry point for the `ipm` binary.
pub fn run() -> Result<(), AppError> {
    // Env fallbacks (IPM_STORE_DIR, IPM_SEED) must be visible before parsing.
    let _ = dotenvy::dotenv();
    let cli = crate::cli::Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Select(args) => handle_select(args),
        Command::Simulate(args) => handle_simulate(args),
        Command::Show(args) => handle_show(args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Ignore the error when a subscriber is already installed.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn handle_select(args: SelectArgs) -> Result<(), AppError> {
    let config = run_config_from_args(&args)?;
    let run = pipeline::run_selection(&config)?;

    println!(
        "{}",
        crate::report::format_run_summary(&run.data, &config, run.prepared.len())
    );
    println!("{}", crate::report::format_ranking(&run.table));
    if let Some(best) = run.best_fit() {
        println!("Best candidate:\n{}", crate::report::format_scalar_summary(best));
    }
    if let Some(states) = &run.best_states {
        println!("{}", crate::report::format_state_summary(states));
    }

    let paths = pipeline::write_outputs(&run, &config.output_dir, !args.no_draws)?;
    println!("Ranking: {}", paths.ranking.display());
    println!("Diagnostics: {}", paths.diagnostics.display());
    if let Some(path) = paths.draws {
        println!("Best draws: {}", path.display());
    }
    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let defaults = SimulationParams::default();
    let covariates = defaults
        .covariates
        .iter()
        .map(|c| SimCovariate {
            effect: if c.id == "flow_max" { args.effect } else { c.effect },
            ..c.clone()
        })
        .collect();
    let params = SimulationParams {
        first_year: args.first_year,
        n_yrs: args.years,
        alpha: args.alpha,
        beta: args.beta,
        harvest_rate: args.harvest_rate,
        covariates,
        seed: args.seed,
        ..defaults
    };
    let sim = simulate(&params)?;
    crate::io::write_dataset_json(&args.output, &sim.dataset)?;
    println!(
        "Wrote {} years ({}..={}) with {} covariates to {}",
        params.n_yrs,
        params.first_year,
        params.first_year + params.n_yrs as i32 - 1,
        sim.dataset.covariates.len(),
        args.output.display()
    );
    Ok(())
}

fn handle_show(args: ShowArgs) -> Result<(), AppError> {
    let id = if args.candidate == "baseline" {
        CandidateId::Baseline
    } else {
        CandidateId::Covariate(args.candidate.clone())
    };
    let store = FileStore::open(&args.store)?;
    let fit = store.get(&id.store_key())?.ok_or_else(|| {
        AppError::config(format!(
            "No stored result for '{}' in '{}'.",
            args.candidate,
            args.store.display()
        ))
    })?;
    println!("{}", crate::report::format_scalar_summary(&fit));
    Ok(())
}

pub fn run_config_from_args(args: &SelectArgs) -> Result<RunConfig, AppError> {
    let harvest = match args.harvest {
        HarvestKind::Known => HarvestModel::Known,
        HarvestKind::Lognormal => {
            if !(args.harvest_sd.is_finite() && args.harvest_sd > 0.0) {
                return Err(AppError::config("--harvest-sd must be positive."));
            }
            HarvestModel::LogNormal { sd: args.harvest_sd }
        }
    };
    Ok(RunConfig {
        data_path: args.data.clone(),
        store_dir: args.store.clone(),
        output_dir: args.output.clone(),
        seed: args.seed,
        mcmc: McmcConfig {
            chains: args.chains,
            adapt_iters: args.adapt,
            max_adapt_attempts: args.max_adapt_attempts,
            burn_in: args.burn_in,
            draws: args.draws,
            thin: args.thin,
        },
        rhat_threshold: args.rhat_threshold,
        harvest,
        only: args.only.clone(),
    })
}
