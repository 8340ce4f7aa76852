//! Executor trait.
//!
//! Executors perform the actual build steps (source checkout, commands) for a
//! build that the distributor already bound to a node.

use async_trait::async_trait;

use crate::{BuildId, BuildParams, ExecutorError, NodeRef, Project};

/// Everything an executor gets to know about the build it runs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub build_id: BuildId,
    /// Resolved project, already pinned to the requested revision.
    pub project: Project,
    pub params: BuildParams,
    /// Node the build was assigned to.
    pub node: NodeRef,
}

/// Trait for build executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run the build to completion.
    ///
    /// Any error fails the build; its message is recorded on the build.
    async fn run(&self, ctx: &ExecutionContext) -> Result<(), ExecutorError>;
}
