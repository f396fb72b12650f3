//! Object identity (group/version/kind + namespace + name) and small helpers
//! over raw JSON objects.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::Json;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self {
            group,
            version,
            kind: kind.to_string(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
            name: name.to_string(),
        }
    }

    /// Read the identity of a raw object, failing on missing apiVersion, kind or name.
    pub fn from_object(obj: &Json) -> Result<Self> {
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing apiVersion"))?;
        let kind = obj.get("kind").and_then(|v| v.as_str()).ok_or_else(|| anyhow!("object missing kind"))?;
        let meta = obj.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("{} object missing metadata.name", kind))?;
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
        Ok(Self::new(api_version, kind, namespace, name))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// Identity without the version: two keys that differ only by served
    /// version address the same object.
    pub fn same_object(&self, other: &ObjectKey) -> bool {
        self.group == other.group && self.kind == other.kind && self.namespace == other.namespace && self.name == other.name
    }

    pub fn is_core_kind(&self, kind: &str) -> bool {
        self.group.is_empty() && self.version == "v1" && self.kind == kind
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Split `group/version` into its parts; the core group is the empty string.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

fn string_map(v: Option<&Json>) -> BTreeMap<String, String> {
    v.and_then(|m| m.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

pub fn labels(obj: &Json) -> BTreeMap<String, String> {
    string_map(obj.get("metadata").and_then(|m| m.get("labels")))
}

pub fn annotations(obj: &Json) -> BTreeMap<String, String> {
    string_map(obj.get("metadata").and_then(|m| m.get("annotations")))
}

pub fn annotation<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    obj.get("metadata")?.get("annotations")?.get(key)?.as_str()
}

/// Mutable access to `.metadata`, creating it when absent. `None` if the
/// object itself is not a JSON object.
pub fn metadata_mut(obj: &mut Json) -> Option<&mut Map<String, Json>> {
    obj.as_object_mut()?
        .entry("metadata")
        .or_insert_with(|| Json::Object(Map::new()))
        .as_object_mut()
}

fn string_map_mut<'a>(obj: &'a mut Json, field: &str) -> Option<&'a mut Map<String, Json>> {
    let meta = metadata_mut(obj)?;
    let slot = meta.entry(field).or_insert_with(|| Json::Object(Map::new()));
    if !slot.is_object() {
        *slot = Json::Object(Map::new());
    }
    slot.as_object_mut()
}

pub fn set_label(obj: &mut Json, key: &str, value: &str) {
    if let Some(labels) = string_map_mut(obj, "labels") {
        labels.insert(key.to_string(), Json::String(value.to_string()));
    }
}

pub fn set_annotation(obj: &mut Json, key: &str, value: &str) {
    if let Some(annotations) = string_map_mut(obj, "annotations") {
        annotations.insert(key.to_string(), Json::String(value.to_string()));
    }
}
