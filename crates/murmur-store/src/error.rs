use murmur_shared::error::ValidationError;
use thiserror::Error;

use crate::storage::Lifecycle;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Malformed channel, message or certificate shape.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown channel or thread address.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Substrate failed to open, load, append or close a log.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Operation issued outside the `Ready` state.
    #[error("Storage is not ready (state: {0:?})")]
    NotReady(Lifecycle),

    /// Lifecycle transition not allowed from the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the community directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Coarse classification used to decide how a failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Infrastructure,
    /// `NotReady` and `InvalidState`; never surfaced to clients.
    Lifecycle,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NotReady(_) | Self::InvalidState(_) => ErrorKind::Lifecycle,
            Self::Infrastructure(_)
            | Self::Sqlite(_)
            | Self::Io(_)
            | Self::Serde(_)
            | Self::Migration(_) => ErrorKind::Infrastructure,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err: StoreError = ValidationError::EmptyChannelName.into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            StoreError::NotReady(Lifecycle::Closed).kind(),
            ErrorKind::Lifecycle
        );
        assert_eq!(
            StoreError::Migration("boom".into()).kind(),
            ErrorKind::Infrastructure
        );
    }
}
