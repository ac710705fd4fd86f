//! Export the best candidate's posterior draws as JSON.
//!
//! The file carries the derived scalars per chain and draw, the raw
//! unconstrained draws with their parameter names, and a posterior summary of
//! the latent trajectory.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::{CandidateId, FitResult};
use crate::error::AppError;
use crate::report::StateSummary;

#[derive(Debug, Clone, Serialize)]
pub struct DrawsFile<'a> {
    pub tool: &'static str,
    pub candidate: &'a CandidateId,
    pub engine: &'a str,
    pub fitted_at: DateTime<Utc>,
    pub scalar_names: &'a [String],
    /// `chains × draws × scalars`.
    pub scalars: Vec<&'a [Vec<f64>]>,
    pub param_names: &'a [String],
    /// `chains × draws × parameters` on the unconstrained scale.
    pub draws: Vec<&'a [Vec<f64>]>,
    pub states: Option<&'a StateSummary>,
}

pub fn write_draws_json(path: &Path, fit: &FitResult, states: Option<&StateSummary>) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::io(format!("Failed to create draws JSON '{}': {e}", path.display())))?;
    let payload = DrawsFile {
        tool: "ipm",
        candidate: &fit.candidate,
        engine: &fit.engine,
        fitted_at: fit.fitted_at,
        scalar_names: &fit.scalar_names,
        scalars: fit.chains.iter().map(|c| c.scalars.as_slice()).collect(),
        param_names: &fit.param_names,
        draws: fit.chains.iter().map(|c| c.draws.as_slice()).collect(),
        states,
    };
    serde_json::to_writer(BufWriter::new(file), &payload)
        .map_err(|e| AppError::io(format!("Failed to write draws JSON: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::selection::tests::synthetic_fit;

    #[test]
    fn draws_file_contains_scalars_per_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best.json");
        let fit = synthetic_fit(CandidateId::Baseline, 0.0, 2);
        write_draws_json(&path, &fit, None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["candidate"]["kind"], "baseline");
        assert_eq!(value["scalars"].as_array().unwrap().len(), 2);
        assert_eq!(value["scalars"][0].as_array().unwrap().len(), 300);
    }
}
