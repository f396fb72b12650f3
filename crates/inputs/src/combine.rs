use rset_core::crd::InputStrategyName;
use rset_core::digest::checksum;
use rset_core::{InputValues, Json};
use tracing::debug;

use crate::{derive_id, strategy_name, InputProvider, ProviderIdentity, ResolveError};

fn provider_label(id: &ProviderIdentity) -> String {
    format!("{}/{}/{}", id.kind, id.namespace, id.name)
}

/// Template-friendly key for a provider in permuted records.
fn normalized_name(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' }).collect()
}

fn explicit_id(value: &Json) -> Option<String> {
    match value {
        Json::String(s) if !s.is_empty() => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Records of one provider with `id` and `provider` injected.
fn tagged_records(provider: &dyn InputProvider) -> Result<Vec<InputValues>, ResolveError> {
    let identity = provider.identity();
    let mut out = Vec::new();
    for (idx, mut record) in provider.get_inputs()?.into_iter().enumerate() {
        if record.keys().any(|k| k.is_empty()) {
            return Err(ResolveError::InvalidInputs { provider: provider_label(&identity), reason: format!("record {} has an empty key", idx) });
        }
        let id = match record.get("id") {
            None | Some(Json::Null) => derive_id(&identity, idx),
            Some(v) => explicit_id(v).ok_or_else(|| ResolveError::InvalidInputs {
                provider: provider_label(&identity),
                reason: format!("record {} has an id that is not a non-empty string or number", idx),
            })?,
        };
        record.insert("id".into(), Json::String(id));
        record.insert("provider".into(), identity.to_json());
        out.push(record);
    }
    Ok(out)
}

/// Combine provider records with the given strategy.
///
/// `Flatten` concatenates records in provider order. `Permute` takes the
/// cartesian product across providers: each combined record maps the
/// provider's normalized name to one of its records, and its `id` is derived
/// from the member ids.
pub fn combine(providers: &[&dyn InputProvider], strategy: InputStrategyName) -> Result<Vec<InputValues>, ResolveError> {
    let mut per_provider = Vec::with_capacity(providers.len());
    for p in providers {
        per_provider.push((p.identity(), tagged_records(*p)?));
    }

    let combined = match strategy {
        InputStrategyName::Flatten => per_provider.into_iter().flat_map(|(_, records)| records).collect(),
        InputStrategyName::Permute => permute(per_provider)?,
    };
    debug!(strategy = strategy_name(strategy), providers = providers.len(), records = combined.len(), "inputs combined");
    Ok(combined)
}

fn permute(per_provider: Vec<(ProviderIdentity, Vec<InputValues>)>) -> Result<Vec<InputValues>, ResolveError> {
    if per_provider.is_empty() {
        return Ok(Vec::new());
    }
    let mut seen = std::collections::BTreeSet::new();
    for (identity, _) in &per_provider {
        if !seen.insert(normalized_name(&identity.name)) {
            return Err(ResolveError::InvalidInputs {
                provider: provider_label(identity),
                reason: format!("normalized name {:?} clashes with another provider", normalized_name(&identity.name)),
            });
        }
    }

    let mut acc: Vec<(InputValues, Vec<String>)> = vec![(InputValues::new(), Vec::new())];
    for (identity, records) in &per_provider {
        let key = normalized_name(&identity.name);
        let mut next = Vec::with_capacity(acc.len() * records.len());
        for (partial, ids) in &acc {
            for record in records {
                let mut combined = partial.clone();
                combined.insert(key.clone(), Json::Object(record.clone().into_iter().collect()));
                let mut member_ids = ids.clone();
                member_ids.push(record.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string());
                next.push((combined, member_ids));
            }
        }
        acc = next;
    }
    Ok(acc
        .into_iter()
        .map(|(mut record, ids)| {
            record.insert("id".into(), Json::String(checksum(&ids.join("/"))));
            record
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed {
        name: &'static str,
        records: Vec<InputValues>,
    }

    impl InputProvider for Fixed {
        fn identity(&self) -> ProviderIdentity {
            ProviderIdentity {
                api_version: "fluxcd.controlplane.io/v1".into(),
                kind: "ResourceSetInputProvider".into(),
                name: self.name.into(),
                namespace: "apps".into(),
                uid: None,
            }
        }

        fn get_inputs(&self) -> Result<Vec<InputValues>, ResolveError> {
            Ok(self.records.clone())
        }
    }

    fn rec(pairs: &[(&str, Json)]) -> InputValues {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn flatten_concatenates_and_tags_records() {
        let a = Fixed { name: "tenants", records: vec![rec(&[("tenant", json!("team1"))]), rec(&[("tenant", json!("team2")), ("id", json!("t2"))])] };
        let b = Fixed { name: "envs", records: vec![rec(&[("env", json!("dev"))])] };
        let out = combine(&[&a as &dyn InputProvider, &b], InputStrategyName::Flatten).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["id"], json!(derive_id(&a.identity(), 0)));
        assert_eq!(out[1]["id"], json!("t2"));
        assert_eq!(out[2]["provider"]["name"], json!("envs"));

        let again = combine(&[&a as &dyn InputProvider, &b], InputStrategyName::Flatten).unwrap();
        assert_eq!(out, again);
    }

    #[test]
    fn permute_builds_cartesian_product() {
        let a = Fixed { name: "tenant-list", records: vec![rec(&[("tenant", json!("team1"))]), rec(&[("tenant", json!("team2"))])] };
        let b = Fixed { name: "envs", records: vec![rec(&[("env", json!("dev"))]), rec(&[("env", json!("prod"))])] };
        let out = combine(&[&a as &dyn InputProvider, &b], InputStrategyName::Permute).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[1]["tenant_list"]["tenant"], json!("team1"));
        assert_eq!(out[1]["envs"]["env"], json!("prod"));
        let ids: std::collections::BTreeSet<String> = out.iter().map(|r| r["id"].as_str().unwrap().to_string()).collect();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn permute_with_an_empty_provider_yields_nothing() {
        let a = Fixed { name: "a", records: vec![rec(&[("x", json!(1))])] };
        let b = Fixed { name: "b", records: vec![] };
        assert!(combine(&[&a as &dyn InputProvider, &b], InputStrategyName::Permute).unwrap().is_empty());
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let a = Fixed { name: "a", records: vec![rec(&[("id", json!({ "nested": true }))])] };
        let err = combine(&[&a as &dyn InputProvider], InputStrategyName::Flatten).unwrap_err();
        assert!(matches!(err, ResolveError::InvalidInputs { .. }));
        assert!(err.is_terminal());
    }
}
