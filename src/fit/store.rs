//! Result stores for memoized fits.
//!
//! - **ResultStore**: trait used by the orchestrator (`has` / `get` / `put`)
//! - **MemoryStore**: in-process store, used by tests and one-off runs
//! - **FileStore**: one JSON file per candidate key, written atomically
//!
//! Entries are serialized [`FitResult`]s. An entry that cannot be decoded is
//! reported as [`AppError::CacheCorruption`] so the caller can refit.

use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::domain::FitResult;
use crate::error::AppError;

/// Keyed persistence of fit results.
pub trait ResultStore: Send + Sync {
    /// Store name for logging.
    fn name(&self) -> &str;

    fn has(&self, key: &str) -> bool;

    /// `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<FitResult>, AppError>;

    /// Replace the entry for `key`. Readers never observe a partial entry.
    fn put(&self, key: &str, result: &FitResult) -> Result<(), AppError>;
}

fn decode(key: &str, bytes: &[u8]) -> Result<FitResult, AppError> {
    serde_json::from_slice(bytes)
        .map_err(|e| AppError::cache(format!("Stored result '{key}' is unreadable: {e}")))
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes under `key`, bypassing serialization.
    pub fn put_raw(&self, key: &str, bytes: Vec<u8>) {
        self.data.write().insert(key.to_string(), bytes);
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl ResultStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn has(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    fn get(&self, key: &str) -> Result<Option<FitResult>, AppError> {
        let data = self.data.read();
        data.get(key).map(|bytes| decode(key, bytes)).transpose()
    }

    fn put(&self, key: &str, result: &FitResult) -> Result<(), AppError> {
        let bytes = serde_json::to_vec(result)
            .map_err(|e| AppError::io(format!("Failed to serialize result '{key}': {e}")))?;
        self.put_raw(key, bytes);
        Ok(())
    }
}

/// Directory-backed store: `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (and create if needed) the store directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, AppError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| AppError::io(format!("Failed to create store '{}': {e}", dir.display())))?;
        info!(path = %dir.display(), "Result store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl ResultStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    fn has(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }

    fn get(&self, key: &str) -> Result<Option<FitResult>, AppError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => decode(key, &bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::cache(format!(
                "Failed to read stored result '{}': {e}",
                path.display()
            ))),
        }
    }

    fn put(&self, key: &str, result: &FitResult) -> Result<(), AppError> {
        let path = self.path_for(key);
        let tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| AppError::io(format!("Failed to create temp file in '{}': {e}", self.dir.display())))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, result)
                .map_err(|e| AppError::io(format!("Failed to serialize result '{key}': {e}")))?;
            writer
                .flush()
                .map_err(|e| AppError::io(format!("Failed to write result '{key}': {e}")))?;
        }
        tmp.persist(&path)
            .map_err(|e| AppError::io(format!("Failed to persist '{}': {e}", path.display())))?;
        debug!(key, path = %path.display(), "Stored fit result");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CandidateId, ChainResult, McmcConfig};
    use chrono::Utc;

    fn sample_result() -> FitResult {
        FitResult {
            candidate: CandidateId::Covariate("flow".to_string()),
            engine: "test".to_string(),
            fitted_at: Utc::now(),
            fingerprint: 42,
            mcmc: McmcConfig::default(),
            adapt_attempts: 1,
            param_names: vec!["a".to_string()],
            scalar_names: vec!["alpha".to_string()],
            chains: vec![ChainResult {
                draws: vec![vec![0.5], vec![0.25]],
                scalars: vec![vec![1.6], vec![1.3]],
                log_lik: vec![vec![-1.0, -2.0], vec![-1.5, -2.5]],
            }],
        }
    }

    #[test]
    fn file_store_round_trips_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store")).unwrap();
        let result = sample_result();
        assert!(!store.has("cov-flow"));
        assert!(store.get("cov-flow").unwrap().is_none());

        store.put("cov-flow", &result).unwrap();
        store.put("cov-flow", &result).unwrap();
        assert!(store.has("cov-flow"));
        assert_eq!(store.get("cov-flow").unwrap(), Some(result));

        let files: Vec<_> = fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn unreadable_entries_are_cache_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("baseline.json"), b"{ truncated").unwrap();
        assert!(matches!(store.get("baseline"), Err(AppError::CacheCorruption(_))));

        let memory = MemoryStore::new();
        memory.put_raw("baseline", b"not json".to_vec());
        assert!(matches!(memory.get("baseline"), Err(AppError::CacheCorruption(_))));
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        store.put("k", &sample_result()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k").unwrap().map(|r| r.fingerprint), Some(42));
    }
}
