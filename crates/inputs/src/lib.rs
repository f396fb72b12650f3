//! ResourceSet inputs: resolve `inputsFrom` references to providers and
//! combine their exported records with the inline inputs.

#![forbid(unsafe_code)]

use indexmap::IndexMap;
use kube::ResourceExt;
use serde::Serialize;
use tracing::debug;

use rset_core::crd::{InputProviderRef, InputStrategyName, ResourceSet, ResourceSetInputProvider};
use rset_core::digest::checksum;
use rset_core::meta;
use rset_core::object::ObjectKey;
use rset_core::selector::SelectorError;
use rset_core::{InputValues, Json};
use rset_kubehub::ClusterStore;

mod combine;

pub use combine::combine;

pub const PROVIDER_KIND: &str = "ResourceSetInputProvider";

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid selector for {kind}: {source}")]
    InvalidSelector { kind: String, source: SelectorError },
    #[error("{0} reference must set either name or selector")]
    MissingTarget(String),
    #[error("{0} reference must not set both name and selector")]
    Ambiguous(String),
    #[error("unsupported input provider kind {0}")]
    UnsupportedKind(String),
    #[error("input provider {0} not found")]
    NotFound(String),
    #[error("failed to fetch input provider {key}: {error:#}")]
    Fetch { key: String, error: anyhow::Error },
    #[error("invalid inputs from {provider}: {reason}")]
    InvalidInputs { provider: String, reason: String },
}

impl ResolveError {
    /// Configuration defects that retrying cannot fix.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResolveError::NotFound(_) | ResolveError::Fetch { .. })
    }
}

/// Where a record came from; injected into every record as `provider`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderIdentity {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(skip)]
    pub uid: Option<String>,
}

impl ProviderIdentity {
    /// Stable identity used to derive record ids.
    pub fn stable_id(&self) -> String {
        match &self.uid {
            Some(uid) if !uid.is_empty() => uid.clone(),
            _ => format!("{}/{}/{}", self.kind, self.namespace, self.name),
        }
    }

    pub fn to_json(&self) -> Json {
        serde_json::json!({
            "apiVersion": self.api_version,
            "kind": self.kind,
            "name": self.name,
            "namespace": self.namespace,
        })
    }
}

/// Anything that exports input records.
pub trait InputProvider: Send + Sync {
    fn identity(&self) -> ProviderIdentity;
    fn get_inputs(&self) -> Result<Vec<InputValues>, ResolveError>;
}

impl InputProvider for ResourceSet {
    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity {
            api_version: meta::API_VERSION.to_string(),
            kind: "ResourceSet".to_string(),
            name: self.name_any(),
            namespace: self.namespace().unwrap_or_default(),
            uid: self.uid(),
        }
    }

    fn get_inputs(&self) -> Result<Vec<InputValues>, ResolveError> {
        Ok(self.spec.inputs.clone())
    }
}

impl InputProvider for ResourceSetInputProvider {
    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity {
            api_version: meta::API_VERSION.to_string(),
            kind: PROVIDER_KIND.to_string(),
            name: self.name_any(),
            namespace: self.namespace().unwrap_or_default(),
            uid: self.uid(),
        }
    }

    fn get_inputs(&self) -> Result<Vec<InputValues>, ResolveError> {
        let inputs = self.exported_inputs();
        if self.spec.type_ == rset_core::crd::STATIC_PROVIDER_TYPE && inputs.is_empty() {
            return Err(ResolveError::InvalidInputs {
                provider: format!("{}/{}", PROVIDER_KIND, self.name_any()),
                reason: "static provider has no default values".into(),
            });
        }
        Ok(inputs)
    }
}

fn check_ref(r: &InputProviderRef) -> Result<(), ResolveError> {
    let (group, _) = rset_core::object::split_api_version(&r.api_version);
    if group != meta::GROUP || r.kind != PROVIDER_KIND {
        return Err(ResolveError::UnsupportedKind(format!("{}/{}", r.api_version, r.kind)));
    }
    match (&r.name, &r.selector) {
        (Some(_), Some(_)) => Err(ResolveError::Ambiguous(r.kind.clone())),
        (None, None) => Err(ResolveError::MissingTarget(r.kind.clone())),
        _ => Ok(()),
    }
}

fn parse_provider(key: &ObjectKey, obj: Json) -> Result<ResourceSetInputProvider, ResolveError> {
    serde_json::from_value(obj).map_err(|e| ResolveError::Fetch { key: key.to_string(), error: e.into() })
}

/// Served versions of one provider are the same provider.
fn seen(providers: &IndexMap<ObjectKey, ResourceSetInputProvider>, key: &ObjectKey) -> bool {
    providers.keys().any(|k| k.same_object(key))
}

/// Resolve `refs` in `namespace` to provider objects, keyed by identity in
/// order of first sight. A provider reached by name and by selector appears once.
pub async fn resolve_providers(
    store: &dyn ClusterStore,
    namespace: &str,
    refs: &[InputProviderRef],
) -> Result<IndexMap<ObjectKey, ResourceSetInputProvider>, ResolveError> {
    let mut providers = IndexMap::new();
    for r in refs {
        check_ref(r)?;
        if let Some(name) = &r.name {
            let key = ObjectKey::new(&r.api_version, &r.kind, Some(namespace), name);
            if seen(&providers, &key) {
                continue;
            }
            let obj = store
                .get(&key)
                .await
                .map_err(|e| ResolveError::Fetch { key: key.to_string(), error: e })?
                .ok_or_else(|| ResolveError::NotFound(key.to_string()))?;
            providers.insert(key.clone(), parse_provider(&key, obj)?);
        } else if let Some(selector) = &r.selector {
            selector.validate().map_err(|source| ResolveError::InvalidSelector { kind: r.kind.clone(), source })?;
            let found = store
                .list(&r.api_version, &r.kind, Some(namespace), selector)
                .await
                .map_err(|e| ResolveError::Fetch { key: format!("{}/{}", r.kind, namespace), error: e })?;
            for obj in found {
                let key = ObjectKey::from_object(&obj).map_err(|e| ResolveError::Fetch { key: r.kind.clone(), error: e })?;
                if seen(&providers, &key) {
                    continue;
                }
                providers.insert(key.clone(), parse_provider(&key, obj)?);
            }
        }
    }
    debug!(namespace, count = providers.len(), "input providers resolved");
    Ok(providers)
}

/// Inputs for one reconcile of `rs`. Without any input source the template
/// renders once with empty inputs; sources that export nothing yield no records.
pub async fn resolve_inputs(store: &dyn ClusterStore, rs: &ResourceSet) -> Result<Vec<InputValues>, ResolveError> {
    if !rs.has_input_sources() {
        return Ok(vec![InputValues::new()]);
    }
    let namespace = rs.namespace().unwrap_or_default();
    let resolved = resolve_providers(store, &namespace, &rs.spec.inputs_from).await?;

    let mut providers: Vec<&dyn InputProvider> = Vec::new();
    if !rs.spec.inputs.is_empty() {
        providers.push(rs);
    }
    providers.extend(resolved.values().map(|p| p as &dyn InputProvider));
    combine(&providers, rs.input_strategy())
}

/// Id for the `index`-th record of a provider lacking an explicit one.
pub fn derive_id(provider: &ProviderIdentity, index: usize) -> String {
    checksum(&format!("{}/{}", provider.stable_id(), index))
}

pub(crate) fn strategy_name(s: InputStrategyName) -> &'static str {
    match s {
        InputStrategyName::Flatten => "Flatten",
        InputStrategyName::Permute => "Permute",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_are_checked() {
        let mut r = InputProviderRef { api_version: meta::API_VERSION.into(), kind: PROVIDER_KIND.into(), name: None, selector: None };
        assert!(matches!(check_ref(&r), Err(ResolveError::MissingTarget(_))));
        r.name = Some("a".into());
        assert!(check_ref(&r).is_ok());
        r.selector = Some(Default::default());
        assert!(matches!(check_ref(&r), Err(ResolveError::Ambiguous(_))));
        r.kind = "GitRepository".into();
        let err = check_ref(&r).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn derived_ids_prefer_uid() {
        let mut id = ProviderIdentity {
            api_version: meta::API_VERSION.into(),
            kind: "ResourceSet".into(),
            name: "apps".into(),
            namespace: "flux-system".into(),
            uid: None,
        };
        let by_name = derive_id(&id, 0);
        assert_eq!(by_name, derive_id(&id, 0));
        assert_ne!(by_name, derive_id(&id, 1));
        id.uid = Some("8d8b0c5e".into());
        assert_ne!(by_name, derive_id(&id, 0));
    }

    #[test]
    fn not_found_is_transient() {
        assert!(!ResolveError::NotFound("x".into()).is_terminal());
        assert!(ResolveError::InvalidInputs { provider: "p".into(), reason: "r".into() }.is_terminal());
    }
}
