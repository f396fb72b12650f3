//! Result of one apply or delete call.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::inventory::ResourceInventory;
use crate::object::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Created,
    Configured,
    Unchanged,
    Skipped,
    Deleted,
    Failed,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Configured => "configured",
            Action::Unchanged => "unchanged",
            Action::Skipped => "skipped",
            Action::Deleted => "deleted",
            Action::Failed => "failed",
        }
    }

    /// Whether the entry reflects a change made to the cluster.
    pub fn is_change(&self) -> bool {
        !matches!(self, Action::Unchanged | Action::Skipped)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetEntry {
    pub key: ObjectKey,
    pub action: Action,
}

impl fmt::Display for ChangeSetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key, self.action)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entries: Vec<ChangeSetEntry>,
}

impl ChangeSet {
    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn add(&mut self, key: ObjectKey, action: Action) {
        self.entries.push(ChangeSetEntry { key, action });
    }

    pub fn append(&mut self, other: ChangeSet) {
        self.entries.extend(other.entries);
    }

    pub fn count(&self, action: Action) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// Entries other than `Unchanged` and `Skipped`.
    pub fn changes(&self) -> ChangeSet {
        ChangeSet { entries: self.entries.iter().filter(|e| e.action.is_change()).cloned().collect() }
    }

    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.entries.iter().map(|e| &e.key)
    }

    /// Every applied object is live and owned, changed or not; failed and
    /// deleted entries are not.
    pub fn to_inventory(&self) -> ResourceInventory {
        ResourceInventory::from_keys(
            self.entries.iter().filter(|e| !matches!(e.action, Action::Failed | Action::Deleted)).map(|e| &e.key),
        )
    }

    /// One line per entry, e.g. `ConfigMap/apps/settings created`.
    pub fn log(&self) -> String {
        self.entries.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n")
    }
}
