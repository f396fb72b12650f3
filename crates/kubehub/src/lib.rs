//! ResourceSet kubehub: the `ClusterStore` seam over the Kubernetes API,
//! its kube-rs and in-memory implementations, and generic readiness.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rset_core::object::ObjectKey;
use rset_core::selector::LabelSelector;
use rset_core::Json;

mod kube_store;
pub mod memory;
pub mod status;

pub use kube_store::{KubeStore, KubeStoreFactory};
pub use memory::{MemoryStore, StaticStoreFactory};
pub use status::{compute_status, ObjectStatus, StatusResult};

/// Parameters for a server-side apply call.
#[derive(Debug, Clone)]
pub struct ApplyParams {
    pub field_manager: String,
    /// Take ownership of fields held by other managers.
    pub force: bool,
    pub dry_run: bool,
}

impl ApplyParams {
    pub fn new(field_manager: &str) -> Self {
        Self { field_manager: field_manager.to_string(), force: true, dry_run: false }
    }

    pub fn dry_run(&self) -> Self {
        Self { dry_run: true, ..self.clone() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{key}: immutable field change rejected: {message}")]
    Immutable { key: String, message: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("kind not served by the API: {0}")]
    UnknownKind(String),
    #[error("namespace required for namespaced kind {0}")]
    NamespaceRequired(String),
}

/// Object store keyed by GVK + namespace + name. Objects travel as raw JSON.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>>;

    async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Json>>;

    /// Server-side apply; returns the object as the server would store it.
    async fn apply(&self, obj: &Json, params: &ApplyParams) -> Result<Json>;

    /// Background-propagation delete. `Ok(false)` when already gone.
    async fn delete(&self, key: &ObjectKey) -> Result<bool>;

    /// JSON merge patch on the object itself (metadata, finalizers).
    async fn patch_merge(&self, key: &ObjectKey, patch: &Json) -> Result<Json>;

    /// JSON merge patch on the status subresource.
    async fn patch_status(&self, key: &ObjectKey, patch: &Json) -> Result<Json>;
}

/// Hands out stores bound to an identity.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    /// Store acting as the operator itself.
    fn operator(&self) -> Arc<dyn ClusterStore>;

    /// Store acting as `system:serviceaccount:{namespace}:{service_account}`,
    /// or as the operator when no account is given.
    async fn impersonate(&self, namespace: &str, service_account: Option<&str>) -> Result<Arc<dyn ClusterStore>>;
}

/// Whether an error (anywhere in its chain) is a not-found from the store.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        if let Some(kube::Error::Api(ae)) = e.downcast_ref::<kube::Error>() {
            return ae.code == 404;
        }
        matches!(e.downcast_ref::<StoreError>(), Some(StoreError::NotFound(_)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_detected_through_context() {
        let err = anyhow::Error::new(StoreError::NotFound("ConfigMap/ns/x".into())).context("loading source");
        assert!(is_not_found(&err));
        assert!(!is_not_found(&anyhow::anyhow!("boom")));
    }
}
