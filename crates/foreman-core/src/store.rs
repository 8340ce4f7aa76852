//! Build store trait.

use async_trait::async_trait;

use crate::{BuildChanges, BuildId, StoreResult};

/// Durable storage of build records.
///
/// `update` merges the fields of `changes` into the record identified by
/// `build_id`, creating it on the first (queued) write and keeping every field
/// that `changes` does not mention. The distributor never issues two
/// concurrent updates for the same build.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn update(&self, build_id: BuildId, changes: &BuildChanges) -> StoreResult<()>;
}
