//! In-memory `ClusterStore` for tests and offline builds.
//!
//! Behaves like an API server closely enough for the reconciler: objects get
//! a uid, generation and resourceVersion; finalizers hold deletion until
//! they are cleared; dry-run applies never persist. Every call is recorded
//! in a request log and individual keys can be rigged to fail.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Map;

use rset_core::object::{self, ObjectKey};
use rset_core::selector::LabelSelector;
use rset_core::Json;

use crate::{ApplyParams, ClusterStore, StoreError, StoreFactory};

/// Identity without the served version.
type SlotKey = (String, String, Option<String>, String);

fn slot(key: &ObjectKey) -> SlotKey {
    (key.group.clone(), key.kind.clone(), key.namespace.clone(), key.name.clone())
}

/// Metadata fields owned by the server and carried across applies.
const SERVER_FIELDS: &[&str] = &["uid", "creationTimestamp", "resourceVersion", "generation", "deletionTimestamp", "finalizers", "managedFields"];

#[derive(Default)]
struct Inner {
    objects: BTreeMap<SlotKey, Json>,
    requests: Vec<String>,
    fail_apply: BTreeMap<SlotKey, String>,
    fail_get: BTreeMap<SlotKey, String>,
    immutable: BTreeSet<SlotKey>,
    revision: u64,
}

impl Inner {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }

    /// Store an object as-is, filling in server metadata when absent.
    pub fn insert(&self, mut obj: Json) -> Result<ObjectKey> {
        let key = ObjectKey::from_object(&obj)?;
        let mut inner = self.lock()?;
        let rv = inner.next_revision();
        let meta = object::metadata_mut(&mut obj).ok_or_else(|| anyhow!("{} is not an object", key))?;
        meta.entry("uid").or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
        meta.entry("generation").or_insert(Json::from(1));
        meta.entry("creationTimestamp").or_insert_with(|| Json::String(now()));
        meta.insert("resourceVersion".into(), Json::String(rv));
        inner.objects.insert(slot(&key), obj);
        Ok(key)
    }

    pub fn object(&self, key: &ObjectKey) -> Option<Json> {
        self.lock().ok()?.objects.get(&slot(key)).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.object(key).is_some()
    }

    /// Every stored object, in key order.
    pub fn objects(&self) -> Vec<Json> {
        self.lock().map(|i| i.objects.values().cloned().collect()).unwrap_or_default()
    }

    /// Stored objects of one kind (any group).
    pub fn objects_of_kind(&self, kind: &str) -> Vec<Json> {
        self.lock()
            .map(|i| i.objects.iter().filter(|(k, _)| k.1 == kind).map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }

    /// Replace the status of a stored object.
    pub fn set_status(&self, key: &ObjectKey, status: Json) -> Result<()> {
        let mut inner = self.lock()?;
        let obj = inner.objects.get_mut(&slot(key)).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(map) = obj.as_object_mut() {
            map.insert("status".into(), status);
        }
        Ok(())
    }

    /// Request log lines such as `apply ConfigMap/apps/a` or `get Deployment/apps/web`.
    pub fn requests(&self) -> Vec<String> {
        self.lock().map(|i| i.requests.clone()).unwrap_or_default()
    }

    pub fn clear_requests(&self) {
        if let Ok(mut i) = self.lock() {
            i.requests.clear();
        }
    }

    /// Fail every apply (including dry-run) of `key` with `message`.
    pub fn fail_apply_for(&self, key: &ObjectKey, message: &str) {
        if let Ok(mut i) = self.lock() {
            i.fail_apply.insert(slot(key), message.to_string());
        }
    }

    /// Fail every get of `key` with `message`.
    pub fn fail_get_for(&self, key: &ObjectKey, message: &str) {
        if let Ok(mut i) = self.lock() {
            i.fail_get.insert(slot(key), message.to_string());
        }
    }

    /// Reject applies that change anything outside metadata of an existing `key`.
    pub fn immutable_for(&self, key: &ObjectKey) {
        if let Ok(mut i) = self.lock() {
            i.immutable.insert(slot(key));
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut i) = self.lock() {
            i.fail_apply.clear();
            i.fail_get.clear();
            i.immutable.clear();
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Some(patch_map) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Some(target_map) = target.as_object_mut() {
        for (k, v) in patch_map {
            if v.is_null() {
                target_map.remove(k);
            } else {
                merge_patch(target_map.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

/// Everything but metadata and status.
fn content(obj: &Json) -> Json {
    let mut c = obj.clone();
    if let Some(m) = c.as_object_mut() {
        m.remove("metadata");
        m.remove("status");
    }
    c
}

fn has_finalizers(obj: &Json) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(|f| f.as_array())
        .map_or(false, |f| !f.is_empty())
}

fn is_terminating(obj: &Json) -> bool {
    obj.get("metadata").and_then(|m| m.get("deletionTimestamp")).map_or(false, |v| !v.is_null())
}

fn generation(obj: &Json) -> i64 {
    obj.get("metadata").and_then(|m| m.get("generation")).and_then(|g| g.as_i64()).unwrap_or(1)
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>> {
        let mut inner = self.lock()?;
        inner.requests.push(format!("get {}", key));
        if let Some(msg) = inner.fail_get.get(&slot(key)) {
            return Err(anyhow!("{}", msg));
        }
        Ok(inner.objects.get(&slot(key)).cloned())
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Json>> {
        let (group, _) = object::split_api_version(api_version);
        let mut inner = self.lock()?;
        inner.requests.push(match namespace {
            Some(ns) => format!("list {}/{}", kind, ns),
            None => format!("list {}", kind),
        });
        Ok(inner
            .objects
            .iter()
            .filter(|((g, k, ns, _), _)| *g == group && k == kind && (namespace.is_none() || ns.as_deref() == namespace))
            .filter(|(_, obj)| selector.matches(&object::labels(obj)))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn apply(&self, obj: &Json, params: &ApplyParams) -> Result<Json> {
        let key = ObjectKey::from_object(obj)?;
        let id = slot(&key);
        let mut inner = self.lock()?;
        inner.requests.push(format!("{} {}", if params.dry_run { "dry-run" } else { "apply" }, key));
        if let Some(msg) = inner.fail_apply.get(&id) {
            return Err(anyhow!("{}: {}", key, msg));
        }

        let mut out = obj.clone();
        let existing = inner.objects.get(&id).cloned();
        match &existing {
            Some(current) => {
                if inner.immutable.contains(&id) && content(current) != content(obj) {
                    return Err(StoreError::Immutable { key: key.to_string(), message: "field is immutable".into() }.into());
                }
                let mut gen = generation(current);
                if content(current) != content(obj) {
                    gen += 1;
                }
                if let (Some(meta), Some(cur_meta)) = (object::metadata_mut(&mut out), current.get("metadata")) {
                    for field in SERVER_FIELDS {
                        if let Some(v) = cur_meta.get(*field) {
                            meta.insert((*field).to_string(), v.clone());
                        }
                    }
                    meta.insert("generation".into(), Json::from(gen));
                }
                if let (Some(map), Some(status)) = (out.as_object_mut(), current.get("status")) {
                    map.insert("status".into(), status.clone());
                }
            }
            None => {
                if let Some(meta) = object::metadata_mut(&mut out) {
                    meta.insert("uid".into(), Json::String(uuid::Uuid::new_v4().to_string()));
                    meta.insert("generation".into(), Json::from(1));
                    meta.insert("creationTimestamp".into(), Json::String(now()));
                }
            }
        }

        if params.dry_run {
            return Ok(out);
        }
        if existing.as_ref() == Some(&out) {
            return Ok(out);
        }
        let rv = inner.next_revision();
        if let Some(meta) = object::metadata_mut(&mut out) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        inner.objects.insert(id, out.clone());
        Ok(out)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        let id = slot(key);
        let mut inner = self.lock()?;
        inner.requests.push(format!("delete {}", key));
        let Some(obj) = inner.objects.get_mut(&id) else {
            return Ok(false);
        };
        if has_finalizers(obj) {
            if !is_terminating(obj) {
                if let Some(meta) = object::metadata_mut(obj) {
                    meta.insert("deletionTimestamp".into(), Json::String(now()));
                }
            }
        } else {
            inner.objects.remove(&id);
        }
        Ok(true)
    }

    async fn patch_merge(&self, key: &ObjectKey, patch: &Json) -> Result<Json> {
        let id = slot(key);
        let mut inner = self.lock()?;
        inner.requests.push(format!("patch {}", key));
        let rv = inner.next_revision();
        let obj = inner.objects.get_mut(&id).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        merge_patch(obj, patch);
        if let Some(meta) = object::metadata_mut(obj) {
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        let out = obj.clone();
        if is_terminating(&out) && !has_finalizers(&out) {
            inner.objects.remove(&id);
        }
        Ok(out)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Json) -> Result<Json> {
        let id = slot(key);
        let mut inner = self.lock()?;
        inner.requests.push(format!("patch-status {}", key));
        let obj = inner.objects.get_mut(&id).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let (Some(status_patch), Some(map)) = (patch.get("status"), obj.as_object_mut()) {
            merge_patch(map.entry("status").or_insert(Json::Null), status_patch);
        }
        Ok(obj.clone())
    }
}

/// Factory that hands out one shared `MemoryStore` for every identity and
/// remembers which identities were asked for.
pub struct StaticStoreFactory {
    store: Arc<MemoryStore>,
    impersonations: Mutex<Vec<String>>,
}

impl StaticStoreFactory {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store, impersonations: Mutex::new(Vec::new()) }
    }

    /// `namespace/serviceaccount` for every impersonating request.
    pub fn impersonations(&self) -> Vec<String> {
        self.impersonations.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl StoreFactory for StaticStoreFactory {
    fn operator(&self) -> Arc<dyn ClusterStore> {
        self.store.clone()
    }

    async fn impersonate(&self, namespace: &str, service_account: Option<&str>) -> Result<Arc<dyn ClusterStore>> {
        if let Some(sa) = service_account.filter(|s| !s.is_empty()) {
            if let Ok(mut v) = self.impersonations.lock() {
                v.push(format!("{}/{}", namespace, sa));
            }
        }
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str, value: &str) -> Json {
        json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": name, "namespace": "apps" }, "data": { "key": value } })
    }

    #[tokio::test]
    async fn apply_creates_then_bumps_generation_on_change() {
        let store = MemoryStore::new();
        let params = ApplyParams::new("test");
        let created = store.apply(&cm("a", "1"), &params).await.unwrap();
        assert_eq!(created["metadata"]["generation"], 1);
        let uid = created["metadata"]["uid"].clone();

        let same = store.apply(&cm("a", "1"), &params).await.unwrap();
        assert_eq!(same["metadata"]["generation"], 1);
        assert_eq!(same["metadata"]["uid"], uid);

        let changed = store.apply(&cm("a", "2"), &params).await.unwrap();
        assert_eq!(changed["metadata"]["generation"], 2);
        assert_eq!(changed["data"]["key"], "2");
    }

    #[tokio::test]
    async fn dry_run_does_not_persist() {
        let store = MemoryStore::new();
        store.apply(&cm("a", "1"), &ApplyParams::new("test").dry_run()).await.unwrap();
        assert!(store.objects().is_empty());
        assert_eq!(store.requests(), vec!["dry-run ConfigMap/apps/a"]);
    }

    #[tokio::test]
    async fn finalizers_hold_deletion_until_cleared() {
        let store = MemoryStore::new();
        let mut obj = cm("a", "1");
        obj["metadata"]["finalizers"] = json!(["example.com/hold"]);
        let key = store.insert(obj).unwrap();

        assert!(store.delete(&key).await.unwrap());
        let held = store.object(&key).unwrap();
        assert!(held["metadata"]["deletionTimestamp"].is_string());

        store.patch_merge(&key, &json!({ "metadata": { "finalizers": null } })).await.unwrap();
        assert!(!store.contains(&key));
        assert!(!store.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn immutable_keys_reject_content_changes() {
        let store = MemoryStore::new();
        let params = ApplyParams::new("test");
        let key = store.insert(cm("a", "1")).unwrap();
        store.immutable_for(&key);
        let err = store.apply(&cm("a", "2"), &params).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Immutable { .. })));
        store.apply(&cm("a", "1"), &params).await.unwrap();
    }

    #[tokio::test]
    async fn list_filters_by_namespace_and_selector() {
        let store = MemoryStore::new();
        let mut labelled = cm("a", "1");
        labelled["metadata"]["labels"] = json!({ "team": "x" });
        store.insert(labelled).unwrap();
        store.insert(cm("b", "1")).unwrap();

        let mut sel = LabelSelector::default();
        sel.match_labels.insert("team".into(), "x".into());
        let found = store.list("v1", "ConfigMap", Some("apps"), &sel).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(store.list("v1", "ConfigMap", Some("other"), &LabelSelector::default()).await.unwrap().is_empty());
    }

    #[test]
    fn merge_patch_removes_nulls_and_merges_maps() {
        let mut target = json!({ "a": { "b": 1, "c": 2 }, "d": [1] });
        merge_patch(&mut target, &json!({ "a": { "c": null, "e": 3 }, "d": [2] }));
        assert_eq!(target, json!({ "a": { "b": 1, "e": 3 }, "d": [2] }));
    }
}
