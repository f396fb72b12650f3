//! Content digests used for change detection and history keys.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::Json;

/// Copy of `v` with every object's keys in sorted order, whatever map
/// ordering serde_json was built with.
pub fn canonical(v: &Json) -> Json {
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Json::Object(keys.into_iter().map(|k| (k.clone(), canonical(&map[k]))).collect())
        }
        Json::Array(items) => Json::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Render objects as a canonical multi-document YAML stream.
pub fn objects_to_yaml(objects: &[Json]) -> Result<String> {
    let mut out = String::new();
    for obj in objects {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&canonical(obj)).context("rendering object as YAML")?);
    }
    Ok(out)
}

pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Digest of the canonical YAML rendering of an object list.
pub fn digest_objects(objects: &[Json]) -> Result<String> {
    Ok(sha256_digest(objects_to_yaml(objects)?.as_bytes()))
}

/// Digest of any serializable value (map keys come out sorted).
pub fn digest_value<T: Serialize>(value: &T) -> Result<String> {
    let v = serde_json::to_value(value).context("serializing value for digest")?;
    Ok(sha256_digest(serde_json::to_string(&canonical(&v))?.as_bytes()))
}

/// Short stable checksum (16 hex chars) used for derived input ids.
pub fn checksum(input: &str) -> String {
    hex::encode(&Sha256::digest(input.as_bytes())[..8])
}
