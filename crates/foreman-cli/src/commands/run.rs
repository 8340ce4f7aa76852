//! Local build command.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use foreman_core::{Build, BuildStatus, BuildStore, Initiator};
use foreman_executor::ShellExecutor;
use foreman_scheduler::{Distributor, DistributorEvent, RunRequest};
use foreman_store::{JournalBuildStore, MemoryBuildStore};
use tracing::debug;

use super::read_config;

const DEFAULT_WORKSPACE: &str = ".foreman";

/// Build `project` with the shell executor and wait until it finishes.
pub async fn run(
    config_path: &Path,
    project: &str,
    rev: Option<String>,
    journal: Option<PathBuf>,
) -> Result<()> {
    let config = read_config(config_path)?;
    let workspace = config
        .workspace
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE));
    let executor = Arc::new(ShellExecutor::new(workspace));

    // continue numbering after the builds already in the journal
    let (store, first_build_id): (Arc<dyn BuildStore>, u64) = match journal {
        Some(path) => {
            let store = JournalBuildStore::open(&path)
                .await
                .with_context(|| format!("Failed to open journal: {}", path.display()))?;
            let next = match store.last_id().await {
                Some(last) => last.next().context("Journal has no build ids left")?.value(),
                None => 1,
            };
            (Arc::new(store), next)
        }
        None => (Arc::new(MemoryBuildStore::new()), 1),
    };

    let distributor = Distributor::builder()
        .projects(config.projects)
        .nodes(config.nodes)
        .store(store)
        .executor(executor)
        .first_build_id(first_build_id)
        .build()
        .context("Failed to start distributor")?;
    let mut events = distributor.subscribe();

    let mut request = RunRequest::new(project).with_initiator(Initiator::new("cli"));
    if let Some(rev) = rev {
        request = request.with_scm_rev(rev);
    }

    let result = distributor.run(request).await?;
    let build = result.builds.first().context("No build was queued")?;
    let build_id = build.id;
    println!("Build #{} queued for project '{}'", build_id, build.project.name);
    debug!(build_id = %build_id, "Waiting for build to finish");

    loop {
        match events.recv().await {
            Some(DistributorEvent::BuildUpdated { build, .. }) if build.id == build_id => {
                if let (BuildStatus::InProgress, Some(node)) = (build.status, &build.node) {
                    println!("▶ Build #{} running on {}", build_id, node);
                }
            }
            Some(DistributorEvent::BuildCompleted { build }) if build.id == build_id => {
                return report(&build);
            }
            Some(DistributorEvent::BuildFault { build_id: id, message }) if id == build_id => {
                bail!("Build #{} could not run: {}", id, message);
            }
            Some(_) => {}
            None => {
                bail!("Distributor stopped before build #{} completed", build_id);
            }
        }
    }
}

fn report(build: &Build) -> Result<()> {
    let duration = match (build.start_date, build.end_date) {
        (Some(start), Some(end)) => {
            let seconds = (end - start).num_milliseconds() as f64 / 1000.0;
            format!(" in {:.1}s", seconds)
        }
        _ => String::new(),
    };

    match (&build.status, &build.error) {
        (BuildStatus::Done, _) => {
            println!("✓ Build #{} done{}", build.id, duration);
            Ok(())
        }
        (_, Some(error)) => bail!("✗ Build #{} failed{}: {}", build.id, duration, error.message),
        (status, None) => bail!("✗ Build #{} finished as {}", build.id, status),
    }
}
