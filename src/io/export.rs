//! Export ranking and diagnostics tables to CSV.
//!
//! Failed candidates are written with empty numeric fields so every attempted
//! candidate appears in the output.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::AppError;
use crate::fit::selection::RankingTable;

pub const RANKING_HEADER: &str = "candidate,covariate,summary,lag,status,p_loo,looic,se_looic,delta_looic,se_delta,decisive,max_rhat,rhat_flagged,min_ess,high_pareto_k";

fn create(path: &Path, label: &str) -> Result<BufWriter<File>, AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::io(format!("Failed to create {label} CSV '{}': {e}", path.display())))?;
    Ok(BufWriter::new(file))
}

fn fmt_opt(value: Option<f64>, precision: usize) -> String {
    value.map(|v| format!("{v:.precision$}")).unwrap_or_default()
}

/// Quote a text field when it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Write the ranking table (one row per attempted candidate).
pub fn write_ranking_csv(path: &Path, table: &RankingTable) -> Result<(), AppError> {
    let mut out = create(path, "ranking")?;
    let row_err = |e: std::io::Error| AppError::io(format!("Failed to write ranking CSV: {e}"));

    writeln!(out, "{RANKING_HEADER}").map_err(row_err)?;
    for row in &table.rows {
        let meta = row.candidate.covariate.as_ref();
        let loo = row.loo.as_ref();
        let diag = row.diagnostics.as_ref();
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            csv_field(&row.candidate.id.to_string()),
            csv_field(meta.map(|m| m.id.as_str()).unwrap_or("")),
            csv_field(meta.map(|m| m.summary.as_str()).unwrap_or("")),
            meta.map(|m| m.lag.to_string()).unwrap_or_default(),
            row.status(),
            fmt_opt(loo.map(|l| l.p_loo), 4),
            fmt_opt(loo.map(|l| l.looic), 4),
            fmt_opt(loo.map(|l| l.se_looic), 4),
            fmt_opt(row.delta_looic, 4),
            fmt_opt(row.se_delta, 4),
            row.decisive.map(|d| d.to_string()).unwrap_or_default(),
            fmt_opt(diag.map(|d| d.max_rhat()), 4),
            diag.map(|d| d.any_flagged().to_string()).unwrap_or_default(),
            fmt_opt(diag.map(|d| d.min_ess()), 1),
            loo.map(|l| l.n_high_k.to_string()).unwrap_or_default(),
        )
        .map_err(row_err)?;
    }
    out.flush().map_err(row_err)?;
    Ok(())
}

/// Write per-parameter diagnostics for every scored candidate.
pub fn write_diagnostics_csv(path: &Path, table: &RankingTable) -> Result<(), AppError> {
    let mut out = create(path, "diagnostics")?;
    let row_err = |e: std::io::Error| AppError::io(format!("Failed to write diagnostics CSV: {e}"));

    writeln!(out, "candidate,parameter,rhat,ess,flagged,lag,autocorrelation").map_err(row_err)?;
    for row in &table.rows {
        let Some(report) = &row.diagnostics else {
            continue;
        };
        let candidate = row.candidate.id.to_string();
        let candidate = csv_field(&candidate);
        for p in &report.parameters {
            for (lag, acf) in &p.autocorrelation {
                writeln!(
                    out,
                    "{},{},{:.4},{:.1},{},{},{:.4}",
                    candidate,
                    csv_field(&p.name),
                    p.rhat,
                    p.ess,
                    p.flagged,
                    lag,
                    acf
                )
                .map_err(row_err)?;
            }
        }
    }
    out.flush().map_err(row_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::diagnose;
    use crate::domain::{CandidateId, CovariateMeta, ModelCandidate};
    use crate::fit::selection::tests::synthetic_fit;
    use crate::fit::selection::{ScoredCandidate, evaluate_loo, rank_candidates};

    fn table() -> RankingTable {
        let fit = synthetic_fit(CandidateId::Baseline, 0.0, 1);
        rank_candidates(vec![
            ScoredCandidate {
                candidate: ModelCandidate::baseline(),
                loo: evaluate_loo(&fit).map_err(|e| e.to_string()),
                diagnostics: Some(diagnose(&fit, 1.1)),
                cached: false,
            },
            ScoredCandidate {
                candidate: ModelCandidate::baseline(),
                loo: Err("engine failure".to_string()),
                diagnostics: None,
                cached: false,
            },
        ])
    }

    #[test]
    fn ranking_csv_lists_every_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranking.csv");
        write_ranking_csv(&path, &table()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], RANKING_HEADER);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("baseline,,,,ok,"));
        assert!(lines[2].contains(",failed,"));
        assert_eq!(lines[2].split(',').count(), RANKING_HEADER.split(',').count());
    }

    #[test]
    fn diagnostics_csv_has_one_row_per_lag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diagnostics.csv");
        write_diagnostics_csv(&path, &table()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        // One scalar, five lags, plus the header.
        assert_eq!(text.lines().count(), 6);
    }

    #[test]
    fn text_fields_with_delimiters_are_quoted() {
        assert_eq!(csv_field("flow_max"), "flow_max");
        assert_eq!(csv_field("flow,max"), "\"flow,max\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");

        let id = "flow, \"daily\"";
        let fit = synthetic_fit(CandidateId::Covariate(id.to_string()), 0.0, 2);
        let table = rank_candidates(vec![ScoredCandidate {
            candidate: ModelCandidate::with_covariate(CovariateMeta {
                id: id.to_string(),
                summary: "exceed:1,5".to_string(),
                lag: 1,
            }),
            loo: evaluate_loo(&fit).map_err(|e| e.to_string()),
            diagnostics: Some(diagnose(&fit, 1.1)),
            cached: false,
        }]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ranking.csv");
        write_ranking_csv(&path, &table).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert!(row.starts_with("\"flow, \"\"daily\"\"\",\"flow, \"\"daily\"\"\",\"exceed:1,5\",1,"));
        // Commas outside quotes still delimit exactly the header's columns.
        let mut in_quotes = false;
        let delimiters = row
            .chars()
            .filter(|&c| {
                if c == '"' {
                    in_quotes = !in_quotes;
                }
                c == ',' && !in_quotes
            })
            .count();
        assert_eq!(delimiters + 1, RANKING_HEADER.split(',').count());
    }
}
