//! Read/write dataset JSON files.
//!
//! The schema is [`Dataset`]: escapement and harvest as `{year, count}`
//! records, per-year age counts ordered `age_min..=age_max`, and optional
//! covariates with daily values per calendar year.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tracing::info;

use crate::domain::Dataset;
use crate::error::AppError;

pub fn read_dataset_json(path: &Path) -> Result<Dataset, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::io(format!("Failed to open dataset '{}': {e}", path.display())))?;
    let dataset: Dataset = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| AppError::alignment(format!("Invalid dataset JSON '{}': {e}", path.display())))?;
    info!(
        path = %path.display(),
        stock = %dataset.stock,
        years = dataset.escapement.len(),
        covariates = dataset.covariates.len(),
        "Dataset loaded"
    );
    Ok(dataset)
}

pub fn write_dataset_json(path: &Path, dataset: &Dataset) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::io(format!("Failed to create dataset '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(BufWriter::new(file), dataset)
        .map_err(|e| AppError::io(format!("Failed to write dataset JSON: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::simulate::{SimulationParams, simulate};

    #[test]
    fn dataset_survives_a_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let dataset = simulate(&SimulationParams::default()).unwrap().dataset;
        write_dataset_json(&path, &dataset).unwrap();
        assert_eq!(read_dataset_json(&path).unwrap(), dataset);
    }

    #[test]
    fn include_flag_defaults_to_true() {
        let json = r#"{
            "stock": "s", "age_min": 1, "age_max": 2,
            "escapement": [], "harvest": [], "age_composition": [],
            "covariates": [{"id": "flow", "summary": "max7", "lag": 0, "values": []}]
        }"#;
        let dataset: Dataset = serde_json::from_str(json).unwrap();
        assert!(dataset.covariates[0].include);
    }

    #[test]
    fn malformed_json_is_an_alignment_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ \"stock\": 3 }").unwrap();
        assert!(matches!(read_dataset_json(&path), Err(AppError::DataAlignment(_))));
        assert!(matches!(read_dataset_json(&dir.path().join("missing.json")), Err(AppError::Io(_))));
    }
}
