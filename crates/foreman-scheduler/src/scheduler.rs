//! Scheduler loop - binds queued builds to free executor slots.
//!
//! The loop runs as a single task that owns the node pool and the pending
//! queue. Allocation and slot reservation happen inside one turn of the loop;
//! each bound build is then driven by its own [`BuildRunner`] task, which
//! reports back with a `Release` command once it is finished.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use foreman_core::{
    Build, BuildChanges, BuildId, BuildStore, ExecutionContext, Executor, NodeRef, StoreResult,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::events::{DistributorEvent, EventBus};
use crate::pool::{NodePool, NodeUsage, SlotId};

/// Fault reported for builds still queued when the scheduler stops.
pub(crate) const STOPPED: &str = "Scheduler stopped";

/// Collaborators shared by the distributor and all build runners.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn BuildStore>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) events: EventBus,
}

pub(crate) enum Command {
    Enqueue(Build),
    Release(SlotId),
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
    Shutdown,
}

/// A build waiting for a free executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingBuild {
    pub build_id: BuildId,
    pub project: String,
    pub wait_reason: String,
}

/// Point-in-time view of the scheduler state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    pub pending: Vec<PendingBuild>,
    pub nodes: Vec<NodeUsage>,
}

/// Start the scheduler loop for `pool`.
pub(crate) fn spawn(
    handle: &tokio::runtime::Handle,
    pool: NodePool,
    shared: Arc<Shared>,
) -> mpsc::UnboundedSender<Command> {
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = SchedulerLoop {
        pool,
        pending: VecDeque::new(),
        shared,
        // weak, so the loop ends once the distributor and all runners are gone
        commands: tx.downgrade(),
        rx,
    };
    handle.spawn(scheduler.run());
    tx
}

struct SchedulerLoop {
    pool: NodePool,
    pending: VecDeque<Build>,
    shared: Arc<Shared>,
    commands: mpsc::WeakUnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl SchedulerLoop {
    async fn run(mut self) {
        debug!(capacity = self.pool.capacity(), "Scheduler started");

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Enqueue(build) => {
                    debug!(build_id = %build.id, project = %build.project.name, "Build enqueued");
                    self.pending.push_back(build);
                }
                Command::Release(slot) => self.pool.release(slot),
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                    continue;
                }
                Command::Shutdown => break,
            }
            self.dispatch();
        }

        // builds enqueued after the shutdown request are stranded too
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            if let Command::Enqueue(build) = command {
                self.pending.push_back(build);
            }
        }

        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "Scheduler stopped with queued builds");
        }
        for build in self.pending.drain(..) {
            error!(
                build_id = %build.id,
                project = %build.project.name,
                "Build left in queue, scheduler stopped"
            );
            self.shared.events.emit(DistributorEvent::BuildFault {
                build_id: build.id,
                message: STOPPED.to_string(),
            });
        }
        info!("Scheduler stopped");
    }

    /// Bind pending builds, oldest first, to free slots until either runs out.
    fn dispatch(&mut self) {
        while let Some(build) = self.pending.pop_front() {
            let Some(slot) = self.pool.reserve() else {
                debug!(
                    build_id = %build.id,
                    pending = self.pending.len() + 1,
                    "No free executor, build stays queued"
                );
                self.pending.push_front(build);
                break;
            };

            let node = self.pool.node(slot).map(|node| node.reference());
            let (Some(node), Some(commands)) = (node, self.commands.upgrade()) else {
                self.pool.release(slot);
                self.pending.push_front(build);
                break;
            };

            info!(build_id = %build.id, node = %node, "Assigned build to node");
            let runner = BuildRunner {
                build,
                slot,
                node,
                shared: self.shared.clone(),
                commands,
            };
            tokio::spawn(runner.run());
        }
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let wait_reason = format!(
            "Waiting for a free executor ({} of {} busy)",
            self.pool.in_use(),
            self.pool.capacity()
        );
        SchedulerSnapshot {
            pending: self
                .pending
                .iter()
                .map(|build| PendingBuild {
                    build_id: build.id,
                    project: build.project.name.clone(),
                    wait_reason: wait_reason.clone(),
                })
                .collect(),
            nodes: self.pool.usage(),
        }
    }
}

/// Drives one build from its assigned slot to a terminal state.
struct BuildRunner {
    build: Build,
    slot: SlotId,
    node: NodeRef,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl BuildRunner {
    async fn run(mut self) {
        let build_id = self.build.id;

        let started = BuildChanges::started(self.node.clone(), Utc::now());
        if let Err(e) = self.persist(started).await {
            error!(build_id = %build_id, error = %e, "Failed to mark build in-progress");
            self.release();
            self.fault(format!("Failed to mark build in-progress: {}", e));
            return;
        }

        let ctx = ExecutionContext {
            build_id,
            project: self.build.project.clone(),
            params: self.build.params.clone(),
            node: self.node.clone(),
        };
        info!(
            build_id = %build_id,
            project = %ctx.project.name,
            node = %ctx.node,
            executor = self.shared.executor.name(),
            "Running build"
        );

        // run on a separate task so a panicking executor still fails the build
        let executor = self.shared.executor.clone();
        let outcome = tokio::spawn(async move { executor.run(&ctx).await }).await;

        let finished = match outcome {
            Ok(Ok(())) => {
                info!(build_id = %build_id, "Build succeeded");
                BuildChanges::done(Utc::now())
            }
            Ok(Err(e)) => {
                warn!(build_id = %build_id, error = %e, "Build failed");
                BuildChanges::failed(e.message, Utc::now())
            }
            Err(e) => {
                error!(build_id = %build_id, error = %e, "Executor task aborted");
                BuildChanges::failed(format!("Executor aborted: {}", e), Utc::now())
            }
        };

        let persisted = self.persist(finished).await;
        self.release();

        match persisted {
            Ok(()) => self.shared.events.emit(DistributorEvent::BuildCompleted {
                build: self.build.clone(),
            }),
            Err(e) => {
                error!(build_id = %build_id, error = %e, "Failed to record build result");
                self.fault(format!("Failed to record build result: {}", e));
            }
        }
    }

    /// Write `changes` and mirror them on the in-memory record once accepted.
    async fn persist(&mut self, changes: BuildChanges) -> StoreResult<()> {
        self.shared.store.update(self.build.id, &changes).await?;
        self.build.apply(&changes);
        self.shared.events.emit(DistributorEvent::BuildUpdated {
            build: self.build.clone(),
            changes,
        });
        Ok(())
    }

    fn release(&self) {
        if self.commands.send(Command::Release(self.slot)).is_err() {
            debug!(build_id = %self.build.id, "Scheduler gone, slot not released");
        }
    }

    fn fault(&self, message: String) {
        self.shared.events.emit(DistributorEvent::BuildFault {
            build_id: self.build.id,
            message,
        });
    }
}
