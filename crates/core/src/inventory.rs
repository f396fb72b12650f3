//! Inventory of the objects owned by a ResourceSet.
//!
//! Entries are keyed by `{namespace}_{name}_{group}_{kind}` with an empty
//! namespace segment for cluster-scoped objects. The inventory is a snapshot
//! written after each apply; garbage collection is the set difference between
//! the previous snapshot and the new one, never a live query.

use std::collections::HashSet;

use anyhow::{bail, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::object::ObjectKey;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceInventory {
    #[serde(default)]
    pub entries: Vec<ResourceRef>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ResourceRef {
    pub id: String,
    #[serde(rename = "v")]
    pub version: String,
}

impl ResourceRef {
    pub fn from_key(key: &ObjectKey) -> Self {
        Self { id: format_id(key), version: key.version.clone() }
    }

    pub fn to_key(&self) -> Result<ObjectKey> {
        parse_id(&self.id, &self.version)
    }
}

pub fn format_id(key: &ObjectKey) -> String {
    format!("{}_{}_{}_{}", key.namespace.as_deref().unwrap_or(""), key.name, key.group, key.kind)
}

/// Names, namespaces, groups and kinds cannot contain `_`, so the id splits
/// into exactly four segments.
pub fn parse_id(id: &str, version: &str) -> Result<ObjectKey> {
    let parts: Vec<&str> = id.split('_').collect();
    let [namespace, name, group, kind] = parts.as_slice() else {
        bail!("invalid inventory id {:?}: expected namespace_name_group_kind", id);
    };
    if name.is_empty() || kind.is_empty() {
        bail!("invalid inventory id {:?}: empty name or kind", id);
    }
    Ok(ObjectKey {
        group: group.to_string(),
        version: version.to_string(),
        kind: kind.to_string(),
        namespace: if namespace.is_empty() { None } else { Some(namespace.to_string()) },
        name: name.to_string(),
    })
}

impl ResourceInventory {
    /// Build an inventory from object keys; duplicates keep their first position.
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a ObjectKey>) -> Self {
        let mut seen = HashSet::new();
        let entries = keys
            .into_iter()
            .map(ResourceRef::from_key)
            .filter(|r| seen.insert(r.id.clone()))
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Entries present in `self` and absent from `newer`. Identity ignores the
    /// version, so an object moving to a new served version is not stale.
    pub fn diff(&self, newer: &ResourceInventory) -> Vec<ResourceRef> {
        let keep: HashSet<&str> = newer.entries.iter().map(|e| e.id.as_str()).collect();
        self.entries.iter().filter(|e| !keep.contains(e.id.as_str())).cloned().collect()
    }

    pub fn keys(&self) -> Result<Vec<ObjectKey>> {
        self.entries.iter().map(ResourceRef::to_key).collect()
    }
}
