//! Build records and their lifecycle.
//!
//! A build moves through `queued -> in-progress -> (done | error)` and every
//! step is persisted as one [`BuildChanges`] value. The in-memory [`Build`] is
//! only advanced with [`Build::apply`] after the store accepted the change.

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::{BuildId, NodeRef, Project};

/// Lifecycle status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Queued,
    InProgress,
    Done,
    Error,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Done | BuildStatus::Error)
    }

    /// Whether `next` is the immediate successor of this status.
    pub fn can_advance_to(&self, next: BuildStatus) -> bool {
        matches!(
            (self, next),
            (BuildStatus::Queued, BuildStatus::InProgress)
                | (BuildStatus::InProgress, BuildStatus::Done)
                | (BuildStatus::InProgress, BuildStatus::Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::InProgress => "in-progress",
            BuildStatus::Done => "done",
            BuildStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters the build was requested with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scm_rev: Option<String>,
}

/// Who asked for the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiator {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Initiator {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Default for Initiator {
    fn default() -> Self {
        Self::new("user")
    }
}

/// Error recorded on a failed build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    pub message: String,
}

/// State of one build attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: BuildId,
    pub project: Project,
    pub initiator: Initiator,
    pub params: BuildParams,
    pub create_date: DateTime<Utc>,
    pub status: BuildStatus,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BuildError>,
}

impl Build {
    /// A freshly queued build.
    pub fn new(
        id: BuildId,
        project: Project,
        params: BuildParams,
        initiator: Initiator,
        create_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            project,
            initiator,
            params,
            create_date,
            status: BuildStatus::Queued,
            completed: false,
            wait_reason: None,
            node: None,
            start_date: None,
            end_date: None,
            error: None,
        }
    }

    /// The change set that persists this build in its queued state.
    pub fn queued_changes(&self) -> BuildChanges {
        BuildChanges::Queued {
            project: self.project.clone(),
            initiator: self.initiator.clone(),
            params: self.params.clone(),
            create_date: self.create_date,
        }
    }

    /// Merge an accepted change set into this record.
    pub fn apply(&mut self, changes: &BuildChanges) {
        debug_assert!(
            matches!(changes, BuildChanges::Queued { .. })
                || self.status.can_advance_to(changes.status()),
            "illegal build transition {} -> {}",
            self.status,
            changes.status()
        );

        match changes {
            BuildChanges::Queued {
                project,
                initiator,
                params,
                create_date,
            } => {
                self.project = project.clone();
                self.initiator = initiator.clone();
                self.params = params.clone();
                self.create_date = *create_date;
            }
            BuildChanges::Started {
                start_date,
                wait_reason,
                node,
            } => {
                self.start_date = Some(*start_date);
                self.wait_reason = Some(wait_reason.clone());
                self.node = Some(node.clone());
            }
            BuildChanges::Done { end_date } => {
                self.end_date = Some(*end_date);
            }
            BuildChanges::Failed { end_date, error } => {
                self.end_date = Some(*end_date);
                self.error = Some(error.clone());
            }
        }

        self.status = changes.status();
        self.completed = changes.status().is_terminal();
    }
}

/// The fields written to the store by one lifecycle transition.
///
/// Serializes to exactly the keys of that transition, `status` and
/// `completed` included.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildChanges {
    Queued {
        project: Project,
        initiator: Initiator,
        params: BuildParams,
        create_date: DateTime<Utc>,
    },
    Started {
        start_date: DateTime<Utc>,
        wait_reason: String,
        node: NodeRef,
    },
    Done {
        end_date: DateTime<Utc>,
    },
    Failed {
        end_date: DateTime<Utc>,
        error: BuildError,
    },
}

impl BuildChanges {
    pub fn started(node: NodeRef, start_date: DateTime<Utc>) -> Self {
        BuildChanges::Started {
            start_date,
            wait_reason: String::new(),
            node,
        }
    }

    pub fn done(end_date: DateTime<Utc>) -> Self {
        BuildChanges::Done { end_date }
    }

    pub fn failed(message: impl Into<String>, end_date: DateTime<Utc>) -> Self {
        BuildChanges::Failed {
            end_date,
            error: BuildError {
                message: message.into(),
            },
        }
    }

    /// Status the build has after this change.
    pub fn status(&self) -> BuildStatus {
        match self {
            BuildChanges::Queued { .. } => BuildStatus::Queued,
            BuildChanges::Started { .. } => BuildStatus::InProgress,
            BuildChanges::Done { .. } => BuildStatus::Done,
            BuildChanges::Failed { .. } => BuildStatus::Error,
        }
    }

    /// Convert to the JSON object handed to document-style stores.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "build changes must serialize to an object, got {}",
                other
            ))),
        }
    }
}

impl Serialize for BuildChanges {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            BuildChanges::Queued {
                project,
                initiator,
                params,
                create_date,
            } => {
                map.serialize_entry("project", project)?;
                map.serialize_entry("initiator", initiator)?;
                map.serialize_entry("params", params)?;
                map.serialize_entry("createDate", create_date)?;
            }
            BuildChanges::Started {
                start_date,
                wait_reason,
                node,
            } => {
                map.serialize_entry("startDate", start_date)?;
                map.serialize_entry("waitReason", wait_reason)?;
                map.serialize_entry("node", node)?;
            }
            BuildChanges::Done { end_date } => {
                map.serialize_entry("endDate", end_date)?;
            }
            BuildChanges::Failed { end_date, error } => {
                map.serialize_entry("endDate", end_date)?;
                map.serialize_entry("error", error)?;
            }
        }
        map.serialize_entry("status", &self.status())?;
        // in-progress writes leave `completed` as the queued write set it
        if !matches!(self, BuildChanges::Started { .. }) {
            map.serialize_entry("completed", &self.status().is_terminal())?;
        }
        map.end()
    }
}
