use thiserror::Error;

/// Failure taxonomy of the prediction engine.
///
/// Only `InvalidResult`, `UnknownModel` and the I/O-ish variants ever reach a
/// caller; the first three are recovered inside the engine (defaults, model
/// exclusion, fresh state) and surface through logs and the health snapshot.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("data source '{provider}' unavailable: {reason}")]
    DataUnavailable { provider: String, reason: String },

    #[error("model '{model}' degenerate: {reason}")]
    ModelDegenerate { model: String, reason: String },

    #[error("persisted state for '{model}' unusable: {reason}")]
    PersistenceCorrupt { model: String, reason: String },

    #[error("invalid match result: {0}")]
    InvalidResult(String),

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("model '{0}' registered twice")]
    DuplicateModel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    #[error("ledger lock poisoned")]
    LedgerPoisoned,
}

impl EngineError {
    pub fn degenerate(model: &str, reason: impl Into<String>) -> Self {
        EngineError::ModelDegenerate {
            model: model.to_string(),
            reason: reason.into(),
        }
    }

    pub fn corrupt(model: &str, reason: impl Into<String>) -> Self {
        EngineError::PersistenceCorrupt {
            model: model.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
