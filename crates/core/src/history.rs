//! Reconciliation history: one entry per distinct digest, most recent first.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub digest: String,
    pub first_reconciled: DateTime<Utc>,
    pub last_reconciled: DateTime<Utc>,
    pub last_reconciled_duration: String,
    pub last_reconciled_status: String,
    pub total_reconciliations: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct History(pub Vec<HistoryEntry>);

impl History {
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn latest(&self) -> Option<&HistoryEntry> { self.0.first() }
    pub fn iter(&self) -> std::slice::Iter<'_, HistoryEntry> { self.0.iter() }

    /// Record a reconciliation. A known digest moves to the front keeping its
    /// `first_reconciled`; an unknown digest is prepended.
    pub fn upsert(
        &mut self,
        digest: &str,
        now: DateTime<Utc>,
        duration: Duration,
        status: &str,
        metadata: BTreeMap<String, String>,
    ) {
        let rendered = crate::duration::format(duration);
        match self.0.iter().position(|e| e.digest == digest) {
            Some(idx) => {
                let mut entry = self.0.remove(idx);
                entry.last_reconciled = now;
                entry.last_reconciled_duration = rendered;
                entry.last_reconciled_status = status.to_string();
                entry.total_reconciliations += 1;
                entry.metadata = metadata;
                self.0.insert(0, entry);
            }
            None => self.0.insert(
                0,
                HistoryEntry {
                    digest: digest.to_string(),
                    first_reconciled: now,
                    last_reconciled: now,
                    last_reconciled_duration: rendered,
                    last_reconciled_status: status.to_string(),
                    total_reconciliations: 1,
                    metadata,
                },
            ),
        }
    }

    /// Keep the `limit` most recent digests; 0 disables the cap.
    pub fn truncate(&mut self, limit: usize) {
        if limit > 0 {
            self.0.truncate(limit);
        }
    }
}
