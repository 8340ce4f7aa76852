//! Project definitions.

use serde::{Deserialize, Serialize};

/// A buildable project as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scm: Option<Scm>,
    /// Archived projects stay visible but can't be built.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scm: None,
            archived: false,
            steps: Vec::new(),
        }
    }

    pub fn with_scm(mut self, scm: Scm) -> Self {
        self.scm = Some(scm);
        self
    }

    pub fn with_step(mut self, name: impl Into<String>, cmd: impl Into<String>) -> Self {
        self.steps.push(Step {
            name: name.into(),
            cmd: cmd.into(),
        });
        self
    }

    pub fn archived(mut self) -> Self {
        self.archived = true;
        self
    }

    /// Copy of this project pinned to another revision.
    ///
    /// Projects without scm are returned unchanged.
    pub fn at_rev(&self, rev: &str) -> Self {
        let mut project = self.clone();
        if let Some(scm) = project.scm.as_mut() {
            scm.rev = rev.to_string();
        }
        project
    }
}

/// Source control settings of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scm {
    /// Scm kind, e.g. `git` or `mercurial`.
    #[serde(rename = "type")]
    pub kind: String,
    pub rev: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl Scm {
    pub fn new(kind: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            rev: rev.into(),
            repository: None,
        }
    }
}

/// A named shell command run as part of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub cmd: String,
}
