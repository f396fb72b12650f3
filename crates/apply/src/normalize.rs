//! Shaping of desired objects before they are applied.

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use serde_json::Map;

use rset_core::crd::CommonMetadata;
use rset_core::meta;
use rset_core::object::{self, ObjectKey};
use rset_core::Json;
use rset_kubehub::{ClusterStore, StoreError};

/// Structural defaulting: drop server-owned fields and empty metadata,
/// stringify scalar label and annotation values.
pub fn normalize(objects: &mut [Json]) -> Result<()> {
    for obj in objects.iter_mut() {
        let key = ObjectKey::from_object(obj)?;
        let map = obj.as_object_mut().ok_or_else(|| anyhow!("{} is not an object", key))?;
        map.remove("status");
        let meta = object::metadata_mut(obj).ok_or_else(|| anyhow!("{} is not an object", key))?;
        meta.retain(|k, v| match k.as_str() {
            "namespace" => v.as_str().map_or(false, |s| !s.is_empty()),
            "creationTimestamp" | "resourceVersion" | "uid" | "generation" | "managedFields" => false,
            "labels" | "annotations" => !v.is_null(),
            _ => true,
        });
        for field in ["labels", "annotations"] {
            if let Some(Json::Object(entries)) = meta.get_mut(field) {
                for v in entries.values_mut() {
                    match v {
                        Json::String(_) => {}
                        Json::Bool(b) => *v = Json::String(b.to_string()),
                        Json::Number(n) => *v = Json::String(n.to_string()),
                        Json::Null => *v = Json::String(String::new()),
                        _ => return Err(anyhow!("{}: {} values must be strings", key, field)),
                    }
                }
            }
        }
    }
    Ok(())
}

/// Stamp owner labels on every object.
pub fn set_owner_labels(objects: &mut [Json], name: &str, namespace: &str) {
    for obj in objects.iter_mut() {
        object::set_label(obj, meta::OWNER_NAME_LABEL, name);
        object::set_label(obj, meta::OWNER_NAMESPACE_LABEL, namespace);
    }
}

/// Merge common labels and annotations into every object; values from the
/// common set win over the object's own.
pub fn apply_common_metadata(objects: &mut [Json], common: &CommonMetadata) {
    for obj in objects.iter_mut() {
        for (k, v) in &common.labels {
            object::set_label(obj, k, v);
        }
        for (k, v) in &common.annotations {
            object::set_annotation(obj, k, v);
        }
    }
}

fn parse_source_ref(value: &str, kind: &str) -> Result<ObjectKey> {
    match value.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(ObjectKey::new("v1", kind, Some(ns), name))
        }
        _ => Err(anyhow!("invalid {} annotation {:?}, expected <namespace>/<name>", meta::COPY_FROM_ANNOTATION, value)),
    }
}

/// Fill ConfigMaps and Secrets annotated with `copyFrom` from their source
/// object. ConfigMap `data` is copied verbatim; Secret `data` is decoded into
/// `stringData` and `type` defaults to `Opaque` when not declared.
pub async fn resolve_copy_from(store: &dyn ClusterStore, objects: &mut [Json]) -> Result<()> {
    for obj in objects.iter_mut() {
        let key = ObjectKey::from_object(obj)?;
        let is_cm = key.is_core_kind("ConfigMap");
        let is_secret = key.is_core_kind("Secret");
        if !is_cm && !is_secret {
            continue;
        }
        let Some(source_ref) = object::annotation(obj, meta::COPY_FROM_ANNOTATION).map(str::to_string) else {
            continue;
        };
        let source_key = parse_source_ref(&source_ref, &key.kind)?;
        let source = store
            .get(&source_key)
            .await
            .with_context(|| format!("{}: fetching copyFrom source {}", key, source_key))?
            .ok_or_else(|| StoreError::NotFound(source_key.to_string()))
            .with_context(|| format!("{}: copyFrom source missing", key))?;
        let data = source.get("data").cloned().unwrap_or_else(|| Json::Object(Map::new()));
        let map = obj.as_object_mut().ok_or_else(|| anyhow!("{} is not an object", key))?;
        if is_cm {
            map.insert("data".into(), data);
            continue;
        }
        let mut string_data = Map::new();
        if let Json::Object(entries) = &data {
            for (k, v) in entries {
                let encoded = v.as_str().unwrap_or_default();
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .with_context(|| format!("{}: decoding key {} of {}", key, k, source_key))?;
                let text = String::from_utf8(raw).with_context(|| format!("{}: key {} of {} is not UTF-8", key, k, source_key))?;
                string_data.insert(k.clone(), Json::String(text));
            }
        }
        map.insert("stringData".into(), Json::Object(string_data));
        if map.get("type").and_then(|t| t.as_str()).map_or(true, str::is_empty) {
            map.insert("type".into(), Json::String("Opaque".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rset_kubehub::MemoryStore;
    use serde_json::json;

    #[test]
    fn normalize_drops_server_fields_and_stringifies_labels() {
        let mut objs = vec![json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "a", "namespace": "", "creationTimestamp": null, "labels": { "version": 2, "on": true } },
            "status": {}
        })];
        normalize(&mut objs).unwrap();
        let meta = objs[0]["metadata"].as_object().unwrap();
        assert!(!meta.contains_key("namespace"));
        assert!(!meta.contains_key("creationTimestamp"));
        assert_eq!(objs[0]["metadata"]["labels"], json!({ "version": "2", "on": "true" }));
        assert!(objs[0].get("status").is_none());
    }

    #[test]
    fn common_metadata_overrides_object_values() {
        let mut objs = vec![json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a", "labels": { "team": "old" } } })];
        let common = CommonMetadata {
            labels: [("team".to_string(), "platform".to_string())].into(),
            annotations: [("owner".to_string(), "ops".to_string())].into(),
        };
        apply_common_metadata(&mut objs, &common);
        set_owner_labels(&mut objs, "apps", "flux-system");
        assert_eq!(objs[0]["metadata"]["labels"]["team"], "platform");
        assert_eq!(objs[0]["metadata"]["labels"][meta::OWNER_NAME_LABEL], "apps");
        assert_eq!(objs[0]["metadata"]["annotations"]["owner"], "ops");
    }

    #[tokio::test]
    async fn copy_from_secret_decodes_into_string_data() {
        let store = MemoryStore::new();
        store
            .insert(json!({
                "apiVersion": "v1", "kind": "Secret",
                "metadata": { "name": "src", "namespace": "flux-system" },
                "type": "kubernetes.io/dockerconfigjson",
                "data": { "token": "czNjcjN0" }
            }))
            .unwrap();
        let mut objs = vec![
            json!({
                "apiVersion": "v1", "kind": "Secret",
                "metadata": { "name": "dst", "namespace": "apps", "annotations": { (meta::COPY_FROM_ANNOTATION): "flux-system/src" } }
            }),
            json!({
                "apiVersion": "v1", "kind": "Secret",
                "metadata": { "name": "typed", "namespace": "apps", "annotations": { (meta::COPY_FROM_ANNOTATION): "flux-system/src" } },
                "type": "kubernetes.io/tls"
            }),
        ];
        resolve_copy_from(&store, &mut objs).await.unwrap();
        assert_eq!(objs[0]["stringData"]["token"], "s3cr3t");
        assert_eq!(objs[0]["type"], "Opaque");
        assert_eq!(objs[1]["type"], "kubernetes.io/tls");
    }

    #[tokio::test]
    async fn copy_from_config_map_copies_data_verbatim() {
        let store = MemoryStore::new();
        store
            .insert(json!({
                "apiVersion": "v1", "kind": "ConfigMap",
                "metadata": { "name": "cluster-info", "namespace": "flux-system" },
                "data": { "domain": "example.com", "settings.yaml": "replicas: 2\n" }
            }))
            .unwrap();
        let mut objs = vec![
            json!({
                "apiVersion": "v1", "kind": "ConfigMap",
                "metadata": { "name": "info", "namespace": "apps", "annotations": { (meta::COPY_FROM_ANNOTATION): "flux-system/cluster-info" } },
                "data": { "stale": "value" }
            }),
            json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "plain", "namespace": "apps" }, "data": { "k": "v" } }),
        ];
        resolve_copy_from(&store, &mut objs).await.unwrap();
        assert_eq!(objs[0]["data"], json!({ "domain": "example.com", "settings.yaml": "replicas: 2\n" }));
        assert!(objs[0].get("stringData").is_none());
        assert!(objs[0].get("type").is_none());
        assert_eq!(objs[1]["data"], json!({ "k": "v" }));
    }

    #[tokio::test]
    async fn copy_from_missing_source_fails() {
        let store = MemoryStore::new();
        let mut objs = vec![json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "dst", "namespace": "apps", "annotations": { (meta::COPY_FROM_ANNOTATION): "flux-system/nope" } }
        })];
        let err = resolve_copy_from(&store, &mut objs).await.unwrap_err();
        assert!(rset_kubehub::is_not_found(&err));
    }
}
