//! CLI command implementations.

use std::path::Path;

use anyhow::{Context, Result};
use foreman_config::{ForemanConfig, load_config};

pub mod run;

pub(crate) fn read_config(path: &Path) -> Result<ForemanConfig> {
    load_config(path).with_context(|| format!("Failed to load config: {}", path.display()))
}

/// Check the configuration and print a summary.
pub fn validate(path: &Path) -> Result<()> {
    let config = read_config(path)?;
    let capacity: u32 = config.nodes.iter().map(|n| n.max_executors_count).sum();

    println!("✓ Configuration is valid: {}", path.display());
    println!(
        "  {} node(s), {} executor slot(s), {} project(s)",
        config.nodes.len(),
        capacity,
        config.projects.len()
    );
    Ok(())
}

/// Print the configured projects.
pub fn projects(path: &Path) -> Result<()> {
    let config = read_config(path)?;

    if config.projects.is_empty() {
        println!("No projects configured");
        return Ok(());
    }

    for project in &config.projects {
        let scm = project
            .scm
            .as_ref()
            .map(|scm| format!("{}@{}", scm.kind, scm.rev))
            .unwrap_or_else(|| "-".to_string());
        let state = if project.archived { "archived" } else { "runnable" };
        println!(
            "{:<24} {:<9} {:<20} {} step(s)",
            project.name,
            state,
            scm,
            project.steps.len()
        );
    }
    Ok(())
}
