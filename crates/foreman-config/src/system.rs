//! Distributor configuration parsing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use foreman_core::{Node, Project, Scm, Step};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

/// Everything a distributor is started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Root directory for project working copies.
    pub workspace: Option<PathBuf>,
    pub nodes: Vec<Node>,
    pub projects: Vec<Project>,
}

impl ForemanConfig {
    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }
}

/// Read and parse a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<ForemanConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse a configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<ForemanConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut workspace = None;
    let mut nodes = Vec::new();
    let mut projects = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "workspace" => {
                let path = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("workspace path".to_string()))?;
                workspace = Some(PathBuf::from(path));
            }
            "node" => {
                nodes.push(parse_node(node)?);
            }
            "project" => {
                projects.push(parse_project(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if nodes.is_empty() {
        return Err(ConfigError::MissingField("node".to_string()));
    }

    let mut node_ids = HashSet::new();
    for node in &nodes {
        if !node_ids.insert(node.reference()) {
            return Err(ConfigError::Duplicate(format!("node '{}'", node.reference())));
        }
    }

    let mut project_names = HashSet::new();
    for project in &projects {
        if !project_names.insert(project.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("project '{}'", project.name)));
        }
    }

    Ok(ForemanConfig {
        workspace,
        nodes,
        projects,
    })
}

fn parse_node(node: &KdlNode) -> ConfigResult<Node> {
    let kind = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("node type".to_string()))?;
    let name = get_string_prop(node, "name");

    let executors = node
        .get("executors")
        .ok_or_else(|| ConfigError::MissingField(format!("executors for node '{}'", kind)))?;
    let executors = executors
        .as_integer()
        .and_then(|n| u32::try_from(n).ok())
        .filter(|n| *n >= 1)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: format!("executors of node '{}'", kind),
            message: format!("expected a positive integer, got {}", executors),
        })?;

    Ok(Node {
        kind,
        name,
        max_executors_count: executors,
    })
}

fn parse_project(node: &KdlNode) -> ConfigResult<Project> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;
    let archived = get_bool_prop(node, "archived").unwrap_or(false);

    let mut scm = None;
    let mut steps = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "scm" => {
                    scm = Some(parse_scm(child, &name)?);
                }
                "step" => {
                    steps.push(parse_step(child, &name)?);
                }
                _ => {}
            }
        }
    }

    Ok(Project {
        name,
        scm,
        archived,
        steps,
    })
}

fn parse_scm(node: &KdlNode, project: &str) -> ConfigResult<Scm> {
    let kind = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("scm type for project '{}'", project)))?;
    let rev = get_string_prop(node, "rev")
        .ok_or_else(|| ConfigError::MissingField(format!("scm rev for project '{}'", project)))?;

    Ok(Scm {
        kind,
        rev,
        repository: get_string_prop(node, "repository"),
    })
}

fn parse_step(node: &KdlNode, project: &str) -> ConfigResult<Step> {
    let mut args = get_all_string_args(node).into_iter();
    let name = args
        .next()
        .ok_or_else(|| ConfigError::MissingField(format!("step name in project '{}'", project)))?;
    let cmd = args
        .next()
        .or_else(|| get_string_prop(node, "cmd"))
        .ok_or_else(|| {
            ConfigError::MissingField(format!("command of step '{}' in project '{}'", name, project))
        })?;

    Ok(Step { name, cmd })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}
