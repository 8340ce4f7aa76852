//! In-memory build store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use foreman_core::{Build, BuildChanges, BuildId, BuildStore, StoreError, StoreResult};
use tokio::sync::RwLock;

use crate::{BuildDocument, decode, merge};

#[derive(Debug, Default)]
struct State {
    builds: BTreeMap<BuildId, BuildDocument>,
    history: Vec<(BuildId, BuildChanges)>,
}

/// Keeps build records in memory, ordered by id.
///
/// Every accepted write is also kept in a history, which makes the store
/// handy for inspecting what a distributor did.
#[derive(Debug, Default)]
pub struct MemoryBuildStore {
    state: RwLock<State>,
}

impl MemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw document of a build.
    pub async fn get(&self, id: BuildId) -> Option<BuildDocument> {
        self.state.read().await.builds.get(&id).cloned()
    }

    /// Typed record of a build.
    pub async fn get_build(&self, id: BuildId) -> StoreResult<Build> {
        let state = self.state.read().await;
        let document = state.builds.get(&id).ok_or(StoreError::NotFound(id))?;
        decode(document)
    }

    /// All builds, oldest first.
    pub async fn list(&self) -> StoreResult<Vec<Build>> {
        self.state.read().await.builds.values().map(decode).collect()
    }

    /// Every accepted write in order.
    pub async fn history(&self) -> Vec<(BuildId, BuildChanges)> {
        self.state.read().await.history.clone()
    }

    /// Highest id seen so far.
    pub async fn last_id(&self) -> Option<BuildId> {
        self.state.read().await.builds.keys().next_back().copied()
    }
}

#[async_trait]
impl BuildStore for MemoryBuildStore {
    async fn update(&self, build_id: BuildId, changes: &BuildChanges) -> StoreResult<()> {
        let fields = changes.to_json()?;
        let mut state = self.state.write().await;
        let document = state.builds.entry(build_id).or_default();
        merge(document, build_id, fields);
        state.history.push((build_id, changes.clone()));
        Ok(())
    }
}
