//! Distributor error types.

use foreman_core::StoreError;
use thiserror::Error;

/// Why a project can't be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectNotRunnable {
    #[error("Can't find project \"{0}\"")]
    NotFound(String),

    #[error("Can't run archived project \"{0}\"")]
    Archived(String),
}

/// Errors returned directly by [`Distributor`](crate::Distributor) calls.
///
/// Only failures that happen before a build is durably queued show up here;
/// everything later is recorded on the build and announced as an event.
#[derive(Debug, Error)]
pub enum DistributorError {
    #[error(transparent)]
    ProjectNotRunnable(#[from] ProjectNotRunnable),

    /// The store rejected the queued write. The build was not scheduled.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type DistributorResult<T> = std::result::Result<T, DistributorError>;
