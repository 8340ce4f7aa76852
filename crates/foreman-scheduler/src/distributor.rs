//! The distributor - admission, queueing and completion reporting.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use foreman_core::{Build, BuildId, BuildParams, BuildStore, Executor, Initiator, Node, Project};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::events::{DistributorEvent, EventBus};
use crate::pool::NodePool;
use crate::registry::ProjectRegistry;
use crate::scheduler::{self, Command, SchedulerSnapshot, Shared};
use crate::{DistributorError, DistributorResult};

/// A request to build one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub project_name: String,
    #[serde(default)]
    pub build_params: BuildParams,
    #[serde(default)]
    pub initiator: Initiator,
}

impl RunRequest {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            build_params: BuildParams::default(),
            initiator: Initiator::default(),
        }
    }

    /// Build the given scm revision instead of the configured one.
    pub fn with_scm_rev(mut self, rev: impl Into<String>) -> Self {
        self.build_params.scm_rev = Some(rev.into());
        self
    }

    pub fn with_initiator(mut self, initiator: Initiator) -> Self {
        self.initiator = initiator;
        self
    }
}

/// Builds admitted by one [`Distributor::run`] call, in their queued state.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub builds: Vec<Build>,
}

/// Schedules builds of known projects onto a fixed set of nodes.
///
/// `run` returns as soon as the build is durably queued. Execution happens in
/// the background; its outcome is observable through [`subscribe`](Self::subscribe).
pub struct Distributor {
    projects: ProjectRegistry,
    nodes: Vec<Node>,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Distributor {
    pub fn builder() -> DistributorBuilder {
        DistributorBuilder::default()
    }

    /// Create a distributor with default settings.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        projects: Vec<Project>,
        nodes: Vec<Node>,
        store: Arc<dyn BuildStore>,
        executor: Arc<dyn Executor>,
    ) -> DistributorResult<Self> {
        Self::builder()
            .projects(projects)
            .nodes(nodes)
            .store(store)
            .executor(executor)
            .build()
    }

    pub fn projects(&self) -> &[Project] {
        self.projects.projects()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Listen for build events. Every subscriber gets every event sent after
    /// it subscribed, however far behind it reads.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DistributorEvent> {
        self.shared.events.subscribe()
    }

    /// Admit a build request.
    ///
    /// Fails without side effects when the project is unknown or archived,
    /// and with the store's error when the queued state can't be written. On
    /// success the queued build is returned while scheduling continues in the
    /// background.
    pub async fn run(&self, request: RunRequest) -> DistributorResult<RunResult> {
        let resolved = self
            .projects
            .resolve(&request.project_name, &request.build_params)?;

        let id = BuildId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let build = Build::new(
            id,
            resolved.project,
            resolved.params,
            request.initiator,
            Utc::now(),
        );

        let changes = build.queued_changes();
        if let Err(e) = self.shared.store.update(id, &changes).await {
            error!(build_id = %id, project = %build.project.name, error = %e, "Failed to queue build");
            return Err(DistributorError::Store(e));
        }
        info!(build_id = %id, project = %build.project.name, "Build queued");

        self.shared.events.emit(DistributorEvent::BuildUpdated {
            build: build.clone(),
            changes,
        });

        let result = RunResult {
            builds: vec![build.clone()],
        };

        if self.commands.send(Command::Enqueue(build)).is_err() {
            // the caller still gets the queued build; the build stays queued
            error!(build_id = %id, "Scheduler is not running, build left in queue");
            self.shared.events.emit(DistributorEvent::BuildFault {
                build_id: id,
                message: "Scheduler is not running".to_string(),
            });
        }

        Ok(result)
    }

    /// Current scheduler state, or `None` once the scheduler stopped.
    pub async fn snapshot(&self) -> Option<SchedulerSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Stop the scheduler loop.
    ///
    /// Running builds still finish. Builds still waiting for a slot are never
    /// started and each gets a [`DistributorEvent::BuildFault`].
    pub fn shutdown(&self) {
        debug!("Stopping scheduler");
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Configures and starts a [`Distributor`].
pub struct DistributorBuilder {
    projects: Vec<Project>,
    nodes: Vec<Node>,
    store: Option<Arc<dyn BuildStore>>,
    executor: Option<Arc<dyn Executor>>,
    first_build_id: u64,
}

impl Default for DistributorBuilder {
    fn default() -> Self {
        Self {
            projects: Vec::new(),
            nodes: Vec::new(),
            store: None,
            executor: None,
            first_build_id: 1,
        }
    }
}

impl DistributorBuilder {
    pub fn project(mut self, project: Project) -> Self {
        self.projects.push(project);
        self
    }

    pub fn projects(mut self, projects: impl IntoIterator<Item = Project>) -> Self {
        self.projects.extend(projects);
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn store(mut self, store: Arc<dyn BuildStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Id given to the first admitted build, e.g. to continue after the last
    /// id found in a persisted store.
    pub fn first_build_id(mut self, id: u64) -> Self {
        self.first_build_id = id;
        self
    }

    /// Validate the settings and start the scheduler loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> DistributorResult<Distributor> {
        let store = self
            .store
            .ok_or_else(|| DistributorError::Config("a build store is required".to_string()))?;
        let executor = self
            .executor
            .ok_or_else(|| DistributorError::Config("an executor is required".to_string()))?;

        if self.nodes.is_empty() {
            return Err(DistributorError::Config(
                "at least one node is required".to_string(),
            ));
        }
        if let Some(node) = self.nodes.iter().find(|n| n.max_executors_count == 0) {
            return Err(DistributorError::Config(format!(
                "node \"{}\" needs at least one executor",
                node.reference()
            )));
        }

        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            DistributorError::Config("the distributor needs a Tokio runtime".to_string())
        })?;

        let shared = Arc::new(Shared {
            store,
            executor,
            events: EventBus::new(),
        });
        let pool = NodePool::new(self.nodes.clone());
        let commands = scheduler::spawn(&handle, pool, shared.clone());

        info!(
            projects = self.projects.len(),
            nodes = self.nodes.len(),
            "Distributor started"
        );

        Ok(Distributor {
            projects: ProjectRegistry::new(self.projects),
            nodes: self.nodes,
            next_id: AtomicU64::new(self.first_build_id),
            shared,
            commands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foreman_core::{
        BuildChanges, BuildStatus, ExecutionContext, ExecutorError, Scm, StoreError, StoreResult,
    };
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    use crate::ProjectNotRunnable;

    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(BuildId, BuildChanges)>>,
        fail_at: Option<(usize, &'static str)>,
    }

    impl RecordingStore {
        /// Fails the `call`-th update (zero based) with `message`.
        fn failing_at(call: usize, message: &'static str) -> Self {
            Self {
                writes: Mutex::new(Vec::new()),
                fail_at: Some((call, message)),
            }
        }

        fn writes(&self) -> Vec<(BuildId, BuildChanges)> {
            self.writes.lock().unwrap().clone()
        }

        fn statuses(&self, id: BuildId) -> Vec<BuildStatus> {
            self.writes()
                .into_iter()
                .filter(|(build_id, _)| *build_id == id)
                .map(|(_, changes)| changes.status())
                .collect()
        }
    }

    #[async_trait]
    impl BuildStore for RecordingStore {
        async fn update(&self, build_id: BuildId, changes: &BuildChanges) -> StoreResult<()> {
            let call = {
                let mut writes = self.writes.lock().unwrap();
                writes.push((build_id, changes.clone()));
                writes.len() - 1
            };
            match self.fail_at {
                Some((at, message)) if at == call => Err(StoreError::backend(message)),
                _ => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct MockExecutor {
        error: Option<&'static str>,
        gate: Option<Arc<Semaphore>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        seen: Mutex<Vec<ExecutionContext>>,
    }

    impl MockExecutor {
        fn failing(message: &'static str) -> Self {
            Self {
                error: Some(message),
                ..Default::default()
            }
        }

        /// Each run waits for one permit of `gate`.
        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Executor for MockExecutor {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn run(&self, ctx: &ExecutionContext) -> Result<(), ExecutorError> {
            self.seen.lock().unwrap().push(ctx.clone());
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);

            match &self.gate {
                Some(gate) => gate
                    .acquire()
                    .await
                    .map_err(|e| ExecutorError::new(e.to_string()))?
                    .forget(),
                None => tokio::time::sleep(Duration::from_millis(10)).await,
            }

            self.running.fetch_sub(1, Ordering::SeqCst);
            match self.error {
                Some(message) => Err(ExecutorError::new(message)),
                None => Ok(()),
            }
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl Executor for PanickingExecutor {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn run(&self, _ctx: &ExecutionContext) -> Result<(), ExecutorError> {
            panic!("executor blew up");
        }
    }

    fn project1() -> Project {
        Project::new("project1")
    }

    fn local_node() -> Node {
        Node::new("local", 1)
    }

    fn distributor(
        projects: Vec<Project>,
        nodes: Vec<Node>,
        store: &Arc<RecordingStore>,
        executor: &Arc<MockExecutor>,
    ) -> Distributor {
        Distributor::new(projects, nodes, store.clone(), executor.clone()).unwrap()
    }

    fn keys(changes: &BuildChanges) -> Vec<String> {
        let mut keys: Vec<String> = changes.to_json().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Collect events until `done` matches one, which is returned last.
    async fn events_until(
        rx: &mut mpsc::UnboundedReceiver<DistributorEvent>,
        done: impl Fn(&DistributorEvent) -> bool,
    ) -> Vec<DistributorEvent> {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut seen = Vec::new();
            loop {
                let Some(event) = rx.recv().await else {
                    panic!("event stream closed");
                };
                let finished = done(&event);
                seen.push(event);
                if finished {
                    return seen;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_completed(rx: &mut mpsc::UnboundedReceiver<DistributorEvent>) -> Build {
        let events = events_until(rx, |e| matches!(e, DistributorEvent::BuildCompleted { .. })).await;
        match events.into_iter().last() {
            Some(DistributorEvent::BuildCompleted { build }) => build,
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_successful_build() {
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);
        let mut events = distributor.subscribe();

        let result = distributor.run(RunRequest::new("project1")).await.unwrap();
        assert_eq!(result.builds.len(), 1);
        let queued = &result.builds[0];
        assert_eq!(queued.status, BuildStatus::Queued);
        assert!(!queued.completed);
        assert!(queued.node.is_none());
        assert!(queued.start_date.is_none());
        assert!(queued.wait_reason.is_none());
        assert!(queued.error.is_none());
        assert_eq!(store.statuses(queued.id)[0], BuildStatus::Queued);

        let completed = wait_completed(&mut events).await;
        assert_eq!(completed.id, queued.id);
        assert_eq!(completed.status, BuildStatus::Done);
        assert!(completed.completed);
        assert_eq!(completed.node, Some(local_node().reference()));
        assert_eq!(completed.wait_reason.as_deref(), Some(""));
        assert!(completed.start_date.is_some());
        assert!(completed.end_date.is_some());
        assert!(completed.error.is_none());

        let writes = store.writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|(id, _)| *id == queued.id));

        assert_eq!(
            keys(&writes[0].1),
            vec!["completed", "createDate", "initiator", "params", "project", "status"]
        );
        let queued_json = writes[0].1.to_json().unwrap();
        assert_eq!(queued_json["status"], "queued");
        assert_eq!(queued_json["completed"], false);

        assert_eq!(
            keys(&writes[1].1),
            vec!["node", "startDate", "status", "waitReason"]
        );
        match &writes[1].1 {
            BuildChanges::Started {
                wait_reason, node, ..
            } => {
                assert_eq!(wait_reason, "");
                assert_eq!(node, &distributor.nodes()[0].reference());
            }
            other => panic!("expected in-progress write, got {:?}", other),
        }

        assert_eq!(keys(&writes[2].1), vec!["completed", "endDate", "status"]);
        let done_json = writes[2].1.to_json().unwrap();
        assert_eq!(done_json["status"], "done");
        assert_eq!(done_json["completed"], true);

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].build_id, queued.id);
        assert_eq!(seen[0].project, project1());
    }

    #[tokio::test]
    async fn test_failing_build() {
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::failing("Some error"));
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);
        let mut events = distributor.subscribe();

        let result = distributor.run(RunRequest::new("project1")).await.unwrap();
        assert_eq!(result.builds.len(), 1);
        assert_eq!(result.builds[0].status, BuildStatus::Queued);

        let completed = wait_completed(&mut events).await;
        assert_eq!(completed.status, BuildStatus::Error);
        assert!(completed.completed);
        assert_eq!(completed.error.unwrap().message, "Some error");

        let writes = store.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(
            store.statuses(completed.id),
            vec![
                BuildStatus::Queued,
                BuildStatus::InProgress,
                BuildStatus::Error
            ]
        );
        let failed = writes[2].1.to_json().unwrap();
        assert_eq!(failed["status"], "error");
        assert_eq!(failed["completed"], true);
        assert_eq!(failed["error"]["message"], "Some error");
    }

    #[tokio::test]
    async fn test_queue_write_failure_is_returned() {
        let store = Arc::new(RecordingStore::failing_at(0, "Some error at update build"));
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);
        let mut events = distributor.subscribe();

        let err = distributor
            .run(RunRequest::new("project1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DistributorError::Store(_)));
        assert_eq!(err.to_string(), "Some error at update build");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.writes().len(), 1);
        assert!(executor.seen.lock().unwrap().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scheduler_fault_keeps_build_queued() {
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);
        let mut events = distributor.subscribe();

        distributor.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = distributor.run(RunRequest::new("project1")).await.unwrap();
        assert_eq!(result.builds.len(), 1);
        let id = result.builds[0].id;

        let events = events_until(&mut events, |e| {
            matches!(e, DistributorEvent::BuildFault { .. })
        })
        .await;
        match events.last() {
            Some(DistributorEvent::BuildFault { build_id, message }) => {
                assert_eq!(*build_id, id);
                assert_eq!(message, "Scheduler is not running");
            }
            other => panic!("expected fault, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.statuses(id), vec![BuildStatus::Queued]);
        assert_eq!(store.writes().len(), 1);
        assert!(distributor.snapshot().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_faults_builds_still_waiting() {
        let gate = Arc::new(Semaphore::new(0));
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::gated(gate.clone()));
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);
        let mut events = distributor.subscribe();

        let running = distributor.run(RunRequest::new("project1")).await.unwrap();
        let waiting = distributor.run(RunRequest::new("project1")).await.unwrap();
        let (running, waiting) = (running.builds[0].id, waiting.builds[0].id);

        tokio::time::sleep(Duration::from_millis(20)).await;
        distributor.shutdown();

        let seen = events_until(&mut events, |e| {
            matches!(e, DistributorEvent::BuildFault { .. })
        })
        .await;
        match seen.last() {
            Some(DistributorEvent::BuildFault { build_id, message }) => {
                assert_eq!(*build_id, waiting);
                assert_eq!(message, "Scheduler stopped");
            }
            other => panic!("expected fault, got {:?}", other),
        }

        gate.add_permits(1);
        let completed = wait_completed(&mut events).await;
        assert_eq!(completed.id, running);
        assert_eq!(completed.status, BuildStatus::Done);

        assert_eq!(store.statuses(waiting), vec![BuildStatus::Queued]);
        assert_eq!(executor.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_executor_fails_build() {
        let store = Arc::new(RecordingStore::default());
        let distributor = Distributor::new(
            vec![project1()],
            vec![local_node()],
            store.clone(),
            Arc::new(PanickingExecutor),
        )
        .unwrap();
        let mut events = distributor.subscribe();

        let first = distributor.run(RunRequest::new("project1")).await.unwrap();
        let completed = wait_completed(&mut events).await;
        assert_eq!(completed.id, first.builds[0].id);
        assert_eq!(completed.status, BuildStatus::Error);
        assert!(completed.completed);
        assert!(
            completed
                .error
                .as_ref()
                .unwrap()
                .message
                .starts_with("Executor aborted")
        );
        assert_eq!(
            store.statuses(completed.id),
            vec![
                BuildStatus::Queued,
                BuildStatus::InProgress,
                BuildStatus::Error
            ]
        );

        let snapshot = distributor.snapshot().await.unwrap();
        assert_eq!(snapshot.nodes[0].in_use, 0);

        // the slot is free again for the next build
        let second = distributor.run(RunRequest::new("project1")).await.unwrap();
        assert_eq!(wait_completed(&mut events).await.id, second.builds[0].id);
    }

    #[tokio::test]
    async fn test_slow_subscriber_sees_every_completion() {
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(
            vec![project1()],
            vec![Node::new("local", 4)],
            &store,
            &executor,
        );
        let mut events = distributor.subscribe();

        let mut ids = Vec::new();
        for _ in 0..100 {
            let result = distributor.run(RunRequest::new("project1")).await.unwrap();
            ids.push(result.builds[0].id);
        }

        // read nothing until every build has finished
        tokio::time::timeout(Duration::from_secs(10), async {
            while store.writes().len() < 300 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("builds did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut completed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DistributorEvent::BuildCompleted { build } = event {
                completed.push(build.id);
            }
        }
        completed.sort();
        assert_eq!(completed, ids);
    }

    #[tokio::test]
    async fn test_scm_rev_not_set() {
        let project = Project::new("project1").with_scm(Scm::new("mercurial", "1"));
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project.clone()], vec![local_node()], &store, &executor);

        distributor.run(RunRequest::new("project1")).await.unwrap();

        match &store.writes()[0].1 {
            BuildChanges::Queued {
                project: queued,
                params,
                ..
            } => {
                assert_eq!(queued, &project);
                assert_eq!(params, &BuildParams::default());
            }
            other => panic!("expected queued write, got {:?}", other),
        }
        assert_eq!(
            store.writes()[0].1.to_json().unwrap()["params"],
            serde_json::json!({})
        );
    }

    #[tokio::test]
    async fn test_scm_rev_set() {
        let project = Project::new("project1").with_scm(Scm::new("mercurial", "1"));
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project.clone()], vec![local_node()], &store, &executor);
        let mut events = distributor.subscribe();

        let result = distributor
            .run(RunRequest::new("project1").with_scm_rev("2"))
            .await
            .unwrap();
        assert_eq!(result.builds[0].project, project.at_rev("2"));

        let json = store.writes()[0].1.to_json().unwrap();
        assert_eq!(json["params"], serde_json::json!({"scmRev": "2"}));
        assert_eq!(
            json["project"],
            serde_json::json!({"name": "project1", "scm": {"type": "mercurial", "rev": "2"}})
        );

        wait_completed(&mut events).await;
        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].project.scm.as_ref().unwrap().rev, "2");
        assert_eq!(seen[0].params.scm_rev.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_archived_project_is_rejected() {
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(
            vec![Project::new("test_project").archived()],
            vec![local_node()],
            &store,
            &executor,
        );

        let err = distributor
            .run(RunRequest::new("test_project"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DistributorError::ProjectNotRunnable(ProjectNotRunnable::Archived(_))
        ));
        assert_eq!(err.to_string(), "Can't run archived project \"test_project\"");
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_project_is_rejected() {
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);

        let err = distributor
            .run(RunRequest::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DistributorError::ProjectNotRunnable(ProjectNotRunnable::NotFound(_))
        ));
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_single_slot_runs_builds_one_at_a_time() {
        let gate = Arc::new(Semaphore::new(0));
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::gated(gate.clone()));
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);
        let mut events = distributor.subscribe();

        let (a, b) = tokio::join!(
            distributor.run(RunRequest::new("project1")),
            distributor.run(RunRequest::new("project1"))
        );
        let (a, b) = (a.unwrap().builds[0].id, b.unwrap().builds[0].id);
        assert_ne!(a, b);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = distributor.snapshot().await.unwrap();
        assert_eq!(snapshot.nodes[0].in_use, 1);
        assert_eq!(snapshot.pending.len(), 1);
        let waiting = snapshot.pending[0].build_id;
        assert!(
            snapshot.pending[0]
                .wait_reason
                .starts_with("Waiting for a free executor")
        );
        assert_eq!(store.statuses(waiting), vec![BuildStatus::Queued]);

        gate.add_permits(1);
        let first = wait_completed(&mut events).await;
        assert_ne!(first.id, waiting);

        gate.add_permits(1);
        let second = wait_completed(&mut events).await;
        assert_eq!(second.id, waiting);
        assert_eq!(executor.max_running.load(Ordering::SeqCst), 1);

        let writes = store.writes();
        let first_finished = writes
            .iter()
            .position(|(id, c)| *id == first.id && c.status().is_terminal())
            .unwrap();
        let second_started = writes
            .iter()
            .position(|(id, c)| *id == second.id && c.status() == BuildStatus::InProgress)
            .unwrap();
        assert!(first_finished < second_started);
    }

    #[tokio::test]
    async fn test_builds_spread_over_nodes_first_fit() {
        let gate = Arc::new(Semaphore::new(0));
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::gated(gate.clone()));
        let nodes = vec![
            Node::new("local", 1).with_name("a"),
            Node::new("local", 1).with_name("b"),
        ];
        let distributor = distributor(vec![project1()], nodes, &store, &executor);
        let mut events = distributor.subscribe();

        let first = distributor.run(RunRequest::new("project1")).await.unwrap();
        let second = distributor.run(RunRequest::new("project1")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = distributor.snapshot().await.unwrap();
        assert!(snapshot.pending.is_empty());
        assert!(snapshot.nodes.iter().all(|usage| usage.in_use == 1));
        assert_eq!(executor.max_running.load(Ordering::SeqCst), 2);

        gate.add_permits(2);
        let mut completed = vec![
            wait_completed(&mut events).await,
            wait_completed(&mut events).await,
        ];
        completed.sort_by_key(|build| build.id);

        assert_eq!(completed[0].id, first.builds[0].id);
        assert_eq!(completed[0].node.as_ref().unwrap().name.as_deref(), Some("a"));
        assert_eq!(completed[1].id, second.builds[0].id);
        assert_eq!(completed[1].node.as_ref().unwrap().name.as_deref(), Some("b"));

        let snapshot = distributor.snapshot().await.unwrap();
        assert!(snapshot.nodes.iter().all(|usage| usage.in_use == 0));
    }

    #[tokio::test]
    async fn test_in_progress_write_failure_releases_slot() {
        let store = Arc::new(RecordingStore::failing_at(1, "disk full"));
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);
        let mut events = distributor.subscribe();

        let first = distributor.run(RunRequest::new("project1")).await.unwrap();
        let events_seen = events_until(&mut events, |e| {
            matches!(e, DistributorEvent::BuildFault { .. })
        })
        .await;
        match events_seen.last() {
            Some(DistributorEvent::BuildFault { build_id, message }) => {
                assert_eq!(*build_id, first.builds[0].id);
                assert!(message.contains("disk full"));
            }
            other => panic!("expected fault, got {:?}", other),
        }

        let second = distributor.run(RunRequest::new("project1")).await.unwrap();
        let completed = wait_completed(&mut events).await;
        assert_eq!(completed.id, second.builds[0].id);
        assert_eq!(completed.status, BuildStatus::Done);

        assert_eq!(executor.seen.lock().unwrap().len(), 1);
        assert_eq!(
            store.statuses(first.builds[0].id),
            vec![BuildStatus::Queued, BuildStatus::InProgress]
        );
    }

    #[tokio::test]
    async fn test_terminal_write_failure_is_not_a_completion() {
        let store = Arc::new(RecordingStore::failing_at(2, "disk full"));
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);
        let mut events = distributor.subscribe();

        distributor.run(RunRequest::new("project1")).await.unwrap();
        let seen = events_until(&mut events, |e| {
            matches!(e, DistributorEvent::BuildFault { .. })
        })
        .await;
        assert!(
            !seen
                .iter()
                .any(|e| matches!(e, DistributorEvent::BuildCompleted { .. }))
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = distributor.snapshot().await.unwrap();
        assert_eq!(snapshot.nodes[0].in_use, 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_completion() {
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);
        let mut first = distributor.subscribe();
        let mut second = distributor.subscribe();

        let result = distributor.run(RunRequest::new("project1")).await.unwrap();
        let id = result.builds[0].id;

        assert_eq!(wait_completed(&mut first).await.id, id);
        assert_eq!(wait_completed(&mut second).await.id, id);
    }

    #[tokio::test]
    async fn test_updates_follow_lifecycle_order() {
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);
        let mut events = distributor.subscribe();

        distributor.run(RunRequest::new("project1")).await.unwrap();
        let seen = events_until(&mut events, |e| {
            matches!(e, DistributorEvent::BuildCompleted { .. })
        })
        .await;

        let updates: Vec<(BuildStatus, bool)> = seen
            .iter()
            .filter_map(|e| match e {
                DistributorEvent::BuildUpdated { build, changes } => {
                    assert_eq!(build.status, changes.status());
                    Some((build.status, build.completed))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            updates,
            vec![
                (BuildStatus::Queued, false),
                (BuildStatus::InProgress, false),
                (BuildStatus::Done, true),
            ]
        );
    }

    #[tokio::test]
    async fn test_build_ids_are_sequential() {
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = Distributor::builder()
            .project(project1())
            .node(local_node())
            .store(store.clone())
            .executor(executor.clone())
            .first_build_id(100)
            .build()
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let result = distributor.run(RunRequest::new("project1")).await.unwrap();
            ids.push(result.builds[0].id);
        }
        assert_eq!(
            ids,
            vec![BuildId::new(100), BuildId::new(101), BuildId::new(102)]
        );
    }

    #[tokio::test]
    async fn test_initiator_is_recorded() {
        let store = Arc::new(RecordingStore::default());
        let executor = Arc::new(MockExecutor::default());
        let distributor = distributor(vec![project1()], vec![local_node()], &store, &executor);

        let initiator = Initiator::new("scheduler").with_name("nightly");
        let result = distributor
            .run(RunRequest::new("project1").with_initiator(initiator.clone()))
            .await
            .unwrap();
        assert_eq!(result.builds[0].initiator, initiator);
        assert_eq!(
            store.writes()[0].1.to_json().unwrap()["initiator"],
            serde_json::json!({"type": "scheduler", "name": "nightly"})
        );
    }

    #[test]
    fn test_run_request_from_json() {
        let request: RunRequest = serde_json::from_value(serde_json::json!({
            "projectName": "project1",
            "buildParams": {"scmRev": "2"}
        }))
        .unwrap();
        assert_eq!(request.project_name, "project1");
        assert_eq!(request.build_params.scm_rev.as_deref(), Some("2"));
        assert_eq!(request.initiator, Initiator::default());
    }

    #[tokio::test]
    async fn test_builder_validation() {
        let store: Arc<dyn BuildStore> = Arc::new(RecordingStore::default());
        let executor: Arc<dyn Executor> = Arc::new(MockExecutor::default());

        let Err(err) = Distributor::builder()
            .project(project1())
            .store(store.clone())
            .executor(executor.clone())
            .build()
        else {
            panic!("a distributor without nodes must be rejected");
        };
        assert!(matches!(err, DistributorError::Config(_)));

        let Err(err) = Distributor::builder()
            .node(Node::new("local", 0))
            .store(store.clone())
            .executor(executor.clone())
            .build()
        else {
            panic!("a node without executors must be rejected");
        };
        assert!(err.to_string().contains("needs at least one executor"));

        let Err(err) = Distributor::builder()
            .node(local_node())
            .executor(executor)
            .build()
        else {
            panic!("a distributor without store must be rejected");
        };
        assert!(err.to_string().contains("build store"));
    }

    #[test]
    fn test_builder_requires_runtime() {
        let Err(err) = Distributor::builder()
            .node(local_node())
            .store(Arc::new(RecordingStore::default()))
            .executor(Arc::new(MockExecutor::default()))
            .build()
        else {
            panic!("building outside a runtime must fail");
        };
        assert!(err.to_string().contains("Tokio runtime"));
    }
}
