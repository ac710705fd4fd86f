//! Formatted terminal output.
//!
//! We keep formatting code in one place so the fitting code stays free of
//! presentation concerns and output changes are localized.

use crate::data::aligner::AlignedData;
use crate::domain::{FitResult, HarvestModel, RunConfig};
use crate::fit::selection::RankingTable;
use crate::report::{Interval, StateSummary, summarize_scalars};

/// Header block: dataset dimensions and run settings.
pub fn format_run_summary(data: &AlignedData, config: &RunConfig, n_candidates: usize) -> String {
    let mut out = String::new();
    out.push_str("=== ipm - integrated population model selection ===\n");
    out.push_str(&format!("Stock: {}\n", data.stock));
    out.push_str(&format!(
        "Years: {}..={} (n={}) | ages {}..={} | broods n={}\n",
        data.year(0),
        data.year(data.n_yrs - 1),
        data.n_yrs,
        data.ages.min,
        data.ages.max,
        data.n_brood
    ));

    let incomplete = data.brood_complete.iter().filter(|&&c| !c).count();
    let imputed: Vec<String> = data
        .age_comp_imputed
        .iter()
        .enumerate()
        .filter(|(_, f)| **f)
        .map(|(t, _)| data.year(t).to_string())
        .collect();
    out.push_str(&format!(
        "Incomplete broods: {incomplete} | unresolved return cells: {}\n",
        data.unresolved_cells.len()
    ));
    if !imputed.is_empty() {
        out.push_str(&format!("Age composition imputed (no fish aged): {}\n", imputed.join(", ")));
    }

    let harvest = match config.harvest {
        HarvestModel::Known => "known".to_string(),
        HarvestModel::LogNormal { sd } => format!("lognormal(sd={sd})"),
    };
    let m = &config.mcmc;
    out.push_str(&format!(
        "Candidates: {n_candidates} | harvest: {harvest} | chains={} adapt={}x{} burn-in={} draws={} thin={}\n",
        m.chains, m.max_adapt_attempts, m.adapt_iters, m.burn_in, m.draws, m.thin
    ));
    out
}

/// Ranking table, failure reasons and convergence warnings.
pub fn format_ranking(table: &RankingTable) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:>4}  {:<20} {:<9} {:>3} {:>10} {:>8} {:>9} {:>8} {:>8}  {:<8} {:>6} {:>3}\n",
        "rank", "candidate", "summary", "lag", "LOOIC", "SE", "dLOOIC", "SE(d)", "p_loo", "decisive", "Rhat", "k>"
    ));
    for row in &table.rows {
        let meta = row.candidate.covariate.as_ref();
        let rank = row.rank.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
        let summary = meta.map(|m| m.summary.as_str()).unwrap_or("");
        let lag = meta.map(|m| m.lag.to_string()).unwrap_or_default();
        match &row.loo {
            Some(loo) => {
                let decisive = match row.decisive {
                    Some(true) => "yes",
                    _ => "",
                };
                let rhat = row
                    .diagnostics
                    .as_ref()
                    .map(|d| format!("{:.3}", d.max_rhat()))
                    .unwrap_or_default();
                out.push_str(&format!(
                    "{rank:>4}  {:<20} {summary:<9} {lag:>3} {:>10.2} {:>8.2} {:>9.2} {:>8.2} {:>8.2}  {decisive:<8} {rhat:>6} {:>3}\n",
                    truncate(&row.candidate.id.to_string(), 20),
                    loo.looic,
                    loo.se_looic,
                    row.delta_looic.unwrap_or(f64::NAN),
                    row.se_delta.unwrap_or(f64::NAN),
                    loo.p_loo,
                    loo.n_high_k,
                ));
            }
            None => {
                out.push_str(&format!(
                    "{rank:>4}  {:<20} {summary:<9} {lag:>3} FAILED: {}\n",
                    truncate(&row.candidate.id.to_string(), 20),
                    row.failure.as_deref().unwrap_or("unknown error"),
                ));
            }
        }
    }

    let warnings: Vec<String> = table
        .rows
        .iter()
        .filter_map(|r| r.diagnostics.as_ref())
        .flat_map(|d| d.warnings())
        .map(|w| format!("  warning: {w}"))
        .collect();
    if !warnings.is_empty() {
        out.push_str("\nConvergence warnings:\n");
        out.push_str(&warnings.join("\n"));
        out.push('\n');
    }
    let high_k: Vec<String> = table
        .rows
        .iter()
        .filter_map(|r| r.loo.as_ref().map(|l| (r, l)))
        .filter(|(_, l)| l.n_high_k > 0)
        .map(|(r, l)| format!("  {}: {} observation(s) with Pareto k > 0.7", r.candidate.id, l.n_high_k))
        .collect();
    if !high_k.is_empty() {
        out.push_str("\nUnreliable LOO terms:\n");
        out.push_str(&high_k.join("\n"));
        out.push('\n');
    }
    out
}

/// Posterior summaries of the derived scalars.
pub fn format_scalar_summary(fit: &FitResult) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Candidate: {} | engine: {} | fitted: {} | chains={} draws/chain={}\n",
        fit.candidate,
        fit.engine,
        fit.fitted_at.format("%Y-%m-%d %H:%M:%S UTC"),
        fit.n_chains(),
        fit.draws_per_chain()
    ));
    out.push_str(&format!("{:<10} {:>12} {:>12} {:>12}\n", "parameter", "median", "5%", "95%"));
    for (name, i) in summarize_scalars(fit) {
        out.push_str(&format_interval_row(&name, &i));
    }
    out
}

/// Spawner and recruit trajectory of the best candidate.
pub fn format_state_summary(states: &StateSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!("{:<6} {:>12} {:>12} {:>12}\n", "year", "spawners", "5%", "95%"));
    for (year, s) in states.years.iter().zip(&states.spawners) {
        out.push_str(&format_interval_row(&year.to_string(), s));
    }
    out.push_str(&format!("\n{:<6} {:>12} {:>12} {:>12}\n", "brood", "recruits", "5%", "95%"));
    for ((year, r), complete) in states.brood_years.iter().zip(&states.recruits).zip(&states.brood_complete) {
        let marker = if *complete { "" } else { " (incomplete)" };
        out.push_str(&format!(
            "{:<6} {:>12.1} {:>12.1} {:>12.1}{marker}\n",
            year, r.median, r.lower, r.upper
        ));
    }
    out
}

fn format_interval_row(label: &str, i: &Interval) -> String {
    format!("{label:<10} {:>12.4} {:>12.4} {:>12.4}\n", i.median, i.lower, i.upper)
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(width.saturating_sub(1)).collect();
        t.push('~');
        t
    }
}
