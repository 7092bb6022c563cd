//! Issue records consumed by the scheduler.
//!
//! Production and parsing of these records belongs to an external
//! collaborator; this module only defines the read-only shape the
//! scheduler and overlap detector operate on.

use crate::priority::Priority;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// One unit of work. Immutable once read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Stable identifier, e.g. "BUG-001"
    pub id: String,
    #[serde(default)]
    pub priority: Priority,
    /// Identifiers of issues that must be merged before this one is dispatchable
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Hints for files this issue is expected to touch, used by overlap detection
    #[serde(default)]
    pub touched_files: Vec<PathBuf>,
}

impl Issue {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            priority: Priority::Normal,
            depends_on: BTreeSet::new(),
            touched_files: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.insert(dep.into());
        self
    }

    pub fn with_touched_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.touched_files.push(path.into());
        self
    }
}
