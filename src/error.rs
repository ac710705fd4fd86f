//! Application error type.
//!
//! Every variant maps to a process exit code (see [`AppError::exit_code`]) so the
//! binary can report failures the same way regardless of where they originate.
//!
//! Alignment, specification, config and io errors abort a run; `InferenceEngine`
//! and `CacheCorruption` only affect one candidate.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Invalid CLI flags or run configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input series cannot be aligned (mismatched ranges, invalid values).
    #[error("data alignment error: {0}")]
    DataAlignment(String),

    /// Invalid age/lag configuration for a model candidate.
    #[error("model specification error: {0}")]
    ModelSpec(String),

    /// Sampler failure, non-finite draws or exhausted adaptation.
    #[error("inference engine error: {0}")]
    InferenceEngine(String),

    /// A persisted fit result could not be read back.
    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    /// Filesystem or serialization failure outside the result store.
    #[error("io error: {0}")]
    Io(String),
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn alignment(message: impl Into<String>) -> Self {
        Self::DataAlignment(message.into())
    }

    pub fn model_spec(message: impl Into<String>) -> Self {
        Self::ModelSpec(message.into())
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::InferenceEngine(message.into())
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::CacheCorruption(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) | AppError::ModelSpec(_) => 2,
            AppError::DataAlignment(_) => 3,
            AppError::InferenceEngine(_) | AppError::CacheCorruption(_) => 4,
            AppError::Io(_) => 5,
        }
    }
}
