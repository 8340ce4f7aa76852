//! Events published by the distributor.

use std::sync::{Mutex, MutexGuard, PoisonError};

use foreman_core::{Build, BuildChanges, BuildId};
use tokio::sync::mpsc;

/// Notification about a build, delivered to every subscriber.
#[derive(Debug, Clone)]
pub enum DistributorEvent {
    /// The store accepted a lifecycle write; `build` already includes it.
    BuildUpdated { build: Build, changes: BuildChanges },
    /// The build reached `done` or `error`. Sent exactly once per build,
    /// after its terminal write succeeded.
    BuildCompleted { build: Build },
    /// A build failed to make progress after it was queued, e.g. because the
    /// scheduler was stopped or a lifecycle write was rejected.
    BuildFault { build_id: BuildId, message: String },
}

impl DistributorEvent {
    pub fn build_id(&self) -> BuildId {
        match self {
            DistributorEvent::BuildUpdated { build, .. } => build.id,
            DistributorEvent::BuildCompleted { build } => build.id,
            DistributorEvent::BuildFault { build_id, .. } => *build_id,
        }
    }
}

/// Fans events out to every subscriber.
///
/// Each subscriber owns an unbounded queue, so a slow reader never loses an
/// event. Subscribers whose receiver was dropped are forgotten on the next
/// emit.
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DistributorEvent>>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<DistributorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: DistributorEvent) {
        self.subscribers()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<DistributorEvent>>> {
        // senders are only pushed or retained, so a poisoned list is still usable
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
