//! Core domain types and traits for the Foreman build distributor.
//!
//! This crate contains:
//! - Build identifiers and the build record lifecycle
//! - Project and node descriptors
//! - Per-transition change sets written to the build store
//! - The `BuildStore` and `Executor` collaborator traits

pub mod build;
pub mod error;
pub mod executor;
pub mod id;
pub mod node;
pub mod project;
pub mod store;

pub use build::{Build, BuildChanges, BuildError, BuildParams, BuildStatus, Initiator};
pub use error::{ExecutorError, StoreError, StoreResult};
pub use executor::{ExecutionContext, Executor};
pub use id::BuildId;
pub use node::{Node, NodeRef};
pub use project::{Project, Scm, Step};
pub use store::BuildStore;
