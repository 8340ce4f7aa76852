//! Worker node descriptors.

use serde::{Deserialize, Serialize};

/// A worker able to run up to `max_executors_count` builds at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub max_executors_count: u32,
}

impl Node {
    pub fn new(kind: impl Into<String>, max_executors_count: u32) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            max_executors_count,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Reduced identity recorded on builds assigned to this node.
    pub fn reference(&self) -> NodeRef {
        NodeRef {
            kind: self.kind.clone(),
            name: self.name.clone(),
        }
    }
}

/// Node identity as stored on a build record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}/{}", self.kind, name),
            None => f.write_str(&self.kind),
        }
    }
}
