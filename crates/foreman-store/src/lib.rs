//! Build record stores for Foreman.
//!
//! Both stores keep builds as JSON documents and merge every change set into
//! the document of its build, so readers see the same shape the distributor
//! writes.

pub mod journal;
pub mod memory;

pub use journal::JournalBuildStore;
pub use memory::MemoryBuildStore;

use foreman_core::{Build, BuildId, StoreResult};
use serde_json::{Map, Value};

/// A build record as a JSON document.
pub type BuildDocument = Map<String, Value>;

/// Merge `changes` into the document of `build_id`, creating it if needed.
pub(crate) fn merge(document: &mut BuildDocument, build_id: BuildId, changes: BuildDocument) {
    document
        .entry("id")
        .or_insert_with(|| Value::from(build_id.value()));
    document.extend(changes);
}

/// Decode a merged document into a typed build.
pub(crate) fn decode(document: &BuildDocument) -> StoreResult<Build> {
    Ok(serde_json::from_value(Value::Object(document.clone()))?)
}
