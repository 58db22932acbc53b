//! Error types shared across components.
//!
//! Component-specific errors (engine, runner, canceler, side-effect senders)
//! live next to their component; this module holds the ones that cross
//! component boundaries.

use thiserror::Error;

/// Datastore errors.
///
/// An [`StoreError::OptimisticLock`] means the row moved on since it was read;
/// callers use [`StoreError::is_optimistic_lock`] to tell a lost race apart from
/// an I/O failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("optimistic lock error: {kind} {id} was updated concurrently")]
    OptimisticLock { kind: &'static str, id: i64 },

    #[error("datastore error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Self::OptimisticLock { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Pipeline configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read pipeline config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse pipeline config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}

/// Result type for datastore operations.
pub type StoreResult<T> = Result<T, StoreError>;
