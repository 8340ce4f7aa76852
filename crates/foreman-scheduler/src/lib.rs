//! Build distribution for Foreman.
//!
//! The [`Distributor`] admits build requests, persists their lifecycle
//! through a [`BuildStore`](foreman_core::BuildStore) and hands queued builds
//! to a scheduler loop that binds them to free executor slots on the
//! configured nodes.

pub mod distributor;
pub mod error;
pub mod events;
pub mod pool;
pub mod registry;
mod scheduler;

pub use distributor::{Distributor, DistributorBuilder, RunRequest, RunResult};
pub use error::{DistributorError, DistributorResult, ProjectNotRunnable};
pub use events::DistributorEvent;
pub use pool::NodeUsage;
pub use registry::{ProjectRegistry, ResolvedProject};
pub use scheduler::{PendingBuild, SchedulerSnapshot};
