//! Append-only journal store.
//!
//! Each accepted write is appended to a JSON-lines file as
//! `{"id": <build id>, "changes": {...}}`. Opening a journal replays it, so
//! records survive restarts.
//!
//! A failed append is rolled back to the previous end of the file, so a
//! rejected write never shows up on replay and the next entry starts on a
//! fresh line. If the rollback fails too, the store refuses further writes
//! until it is reopened.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use foreman_core::{Build, BuildChanges, BuildId, BuildStore, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::{BuildDocument, decode, merge};

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    id: BuildId,
    changes: BuildDocument,
}

/// Build store persisted as an append-only JSON-lines journal.
pub struct JournalBuildStore {
    path: PathBuf,
    journal: Mutex<Journal>,
    builds: RwLock<BTreeMap<BuildId, BuildDocument>>,
}

struct Journal {
    file: File,
    /// End of the last complete entry.
    len: u64,
    poisoned: bool,
}

impl Journal {
    async fn append(&mut self, line: &[u8]) -> StoreResult<()> {
        if self.poisoned {
            return Err(StoreError::backend(
                "Journal is unusable after a failed write, reopen it",
            ));
        }

        if let Err(e) = write_synced(&mut self.file, line).await {
            if let Err(rollback) = truncate(&mut self.file, self.len).await {
                error!(
                    error = %rollback,
                    "Failed to roll back journal, refusing further writes"
                );
                self.poisoned = true;
            }
            return Err(e.into());
        }
        self.len += line.len() as u64;
        Ok(())
    }
}

async fn write_synced(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.sync_data().await
}

async fn truncate(file: &mut File, len: u64) -> std::io::Result<()> {
    file.set_len(len).await?;
    file.sync_all().await
}

impl JournalBuildStore {
    /// Open the journal at `path`, creating it if missing.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let (builds, torn) = replay(&path).await?;
        debug!(path = %path.display(), builds = builds.len(), "Journal replayed");

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if torn {
            // keep the next entry off the unterminated line
            file.write_all(b"\n").await?;
        }
        let len = file.metadata().await?.len();

        Ok(Self {
            path,
            journal: Mutex::new(Journal {
                file,
                len,
                poisoned: false,
            }),
            builds: RwLock::new(builds),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, id: BuildId) -> Option<BuildDocument> {
        self.builds.read().await.get(&id).cloned()
    }

    pub async fn get_build(&self, id: BuildId) -> StoreResult<Build> {
        let builds = self.builds.read().await;
        let document = builds.get(&id).ok_or(StoreError::NotFound(id))?;
        decode(document)
    }

    /// All builds, oldest first.
    pub async fn list(&self) -> StoreResult<Vec<Build>> {
        self.builds.read().await.values().map(decode).collect()
    }

    /// Highest id in the journal, used to continue numbering after a restart.
    pub async fn last_id(&self) -> Option<BuildId> {
        self.builds.read().await.keys().next_back().copied()
    }
}

#[async_trait]
impl BuildStore for JournalBuildStore {
    async fn update(&self, build_id: BuildId, changes: &BuildChanges) -> StoreResult<()> {
        let entry = JournalEntry {
            id: build_id,
            changes: changes.to_json()?,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        self.journal.lock().await.append(&line).await?;

        let mut builds = self.builds.write().await;
        merge(builds.entry(build_id).or_default(), build_id, entry.changes);
        Ok(())
    }
}

/// Rebuild documents from the journal. Also reports whether the last line is
/// unterminated.
async fn replay(path: &Path) -> StoreResult<(BTreeMap<BuildId, BuildDocument>, bool)> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok((BTreeMap::new(), false));
        }
        Err(e) => return Err(e.into()),
    };

    let mut builds: BTreeMap<BuildId, BuildDocument> = BTreeMap::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => merge(builds.entry(entry.id).or_default(), entry.id, entry.changes),
            // a write torn by a crash
            Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed journal entry"),
        }
    }
    let torn = !content.is_empty() && !content.ends_with('\n');
    Ok((builds, torn))
}
