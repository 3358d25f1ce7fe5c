use thiserror::Error;

use crate::backend::BackendKind;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(err.to_string())
    }
}

/// Errors returned by the permission manager.
#[derive(Debug, Error)]
pub enum PermsError {
    #[error("group '{0}' not found")]
    GroupNotFound(String),

    #[error("user '{0}' not found")]
    UserNotFound(String),

    #[error("group '{0}' already exists")]
    GroupExists(String),

    #[error("user '{0}' already exists")]
    UserExists(String),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("migration to {target} backend failed: {source}")]
    Migration {
        target: BackendKind,
        #[source]
        source: BackendError,
    },
}
