//! Shell executor for local nodes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use foreman_core::{ExecutionContext, Executor, ExecutorError, Project};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::scm::checkout_commands;

/// Node type served by this executor.
pub const LOCAL_NODE: &str = "local";

/// Runs builds on the local machine.
///
/// Every project gets its own working copy below the workspace root. A
/// project with a repository is checked out at the build's revision before
/// its steps run through `sh -c`, one after another, until one fails.
///
/// Builds of the same project share the working copy, so they run one at a
/// time. Builds of different projects run concurrently.
pub struct ShellExecutor {
    workspace: PathBuf,
    working_copies: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ShellExecutor {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            working_copies: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Working copy of `project`.
    pub fn project_dir(&self, project: &Project) -> PathBuf {
        self.workspace.join(&project.name)
    }

    async fn checkout(&self, ctx: &ExecutionContext, dir: &Path) -> Result<(), ExecutorError> {
        let Some(scm) = &ctx.project.scm else {
            return Ok(());
        };
        let Some(repository) = &scm.repository else {
            debug!(project = %ctx.project.name, "No repository configured, skipping checkout");
            return Ok(());
        };

        info!(build_id = %ctx.build_id, scm = %scm.kind, rev = %scm.rev, "Checking out sources");
        for command in checkout_commands(scm, repository, dir)? {
            let Some((program, args)) = command.split_first() else {
                continue;
            };
            let output = Command::new(program)
                .args(args)
                .current_dir(dir)
                .output()
                .await
                .map_err(|e| ExecutorError::new(format!("Can't run {}: {}", program, e)))?;
            log_output(&command.join(" "), &output);

            if !output.status.success() {
                return Err(ExecutorError::new(format!(
                    "Checkout failed: `{}` {}",
                    command.join(" "),
                    describe_exit(&output)
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<(), ExecutorError> {
        if ctx.node.kind != LOCAL_NODE {
            return Err(ExecutorError::new(format!(
                "Unsupported node type \"{}\"",
                ctx.node.kind
            )));
        }

        let working_copy = self
            .working_copies
            .lock()
            .await
            .entry(ctx.project.name.clone())
            .or_default()
            .clone();
        let _guard = match working_copy.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(
                    build_id = %ctx.build_id,
                    project = %ctx.project.name,
                    "Waiting for working copy"
                );
                working_copy.lock().await
            }
        };

        let dir = self.project_dir(&ctx.project);
        tokio::fs::create_dir_all(&dir).await?;
        self.checkout(ctx, &dir).await?;

        let rev = ctx
            .project
            .scm
            .as_ref()
            .map(|scm| scm.rev.clone())
            .unwrap_or_default();

        for step in &ctx.project.steps {
            info!(build_id = %ctx.build_id, step = %step.name, "Running step");
            let output = Command::new("sh")
                .arg("-c")
                .arg(&step.cmd)
                .current_dir(&dir)
                .env("FOREMAN_BUILD_ID", ctx.build_id.to_string())
                .env("FOREMAN_PROJECT", &ctx.project.name)
                .env("FOREMAN_NODE", ctx.node.to_string())
                .env("FOREMAN_SCM_REV", &rev)
                .output()
                .await?;
            log_output(&step.name, &output);

            if !output.status.success() {
                return Err(ExecutorError::new(format!(
                    "Step \"{}\" {}",
                    step.name,
                    describe_exit(&output)
                )));
            }
        }

        Ok(())
    }
}

fn describe_exit(output: &Output) -> String {
    match output.status.code() {
        Some(code) => format!("failed with exit code {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

fn log_output(source: &str, output: &Output) {
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(source = %source, "{}", line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        debug!(source = %source, stream = "stderr", "{}", line);
    }
}
