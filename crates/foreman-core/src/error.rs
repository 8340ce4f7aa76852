//! Error types shared by the collaborator traits.

use thiserror::Error;

use crate::BuildId;

/// Failure reported by a [`BuildStore`](crate::BuildStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend-specific failure; the message is surfaced unchanged.
    #[error("{0}")]
    Backend(String),

    #[error("build not found: {0}")]
    NotFound(BuildId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure reported by an [`Executor`](crate::Executor).
///
/// Only the message is kept on the build record, so it is also the whole
/// `Display` output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ExecutorError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}
