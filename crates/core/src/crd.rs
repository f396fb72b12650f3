//! Custom resources: `ResourceSet` and its input provider kind.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::history::History;
use crate::inventory::ResourceInventory;
use crate::meta;
use crate::object::ObjectKey;
use crate::selector::LabelSelector;
use crate::{InputValues, Json};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "fluxcd.controlplane.io", version = "v1", kind = "ResourceSet")]
#[kube(namespaced, status = "ResourceSetStatus", shortname = "rset")]
#[kube(
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSetSpec {
    /// Objects that must exist (and optionally be ready) before applying.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs_from: Vec<InputProviderRef>,
    /// Inline inputs; they act as a provider of their own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputValues>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_strategy: Option<InputStrategy>,
    /// Multi-document YAML template rendered once per input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_template: Option<String>,
    /// Static objects, also rendered once per input.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_metadata: Option<CommonMetadata>,
    /// Wait for applied objects to become ready.
    #[serde(default)]
    pub wait: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Go-style duration bounding apply, wait and prune.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Empty for cluster-scoped kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub ready: bool,
    /// Boolean expression over the live object; only used with `ready`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_expr: Option<String>,
}

impl Dependency {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.api_version, &self.kind, self.namespace.as_deref(), &self.name)
    }
}

fn default_provider_api_version() -> String {
    meta::API_VERSION.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputProviderRef {
    #[serde(default = "default_provider_api_version")]
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum InputStrategyName {
    /// Concatenate the records of every provider.
    #[default]
    Flatten,
    /// Cartesian product of the providers' records.
    Permute,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct InputStrategy {
    pub name: InputStrategyName,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct CommonMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSetStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<ResourceInventory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
    #[serde(default, skip_serializing_if = "History::is_empty")]
    pub history: History,
}

impl ResourceSet {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(meta::API_VERSION, "ResourceSet", self.namespace().as_deref(), &self.name_any())
    }

    pub fn is_disabled(&self) -> bool {
        self.annotations().get(meta::RECONCILE_ANNOTATION).map(|v| v.eq_ignore_ascii_case(meta::DISABLED_VALUE)).unwrap_or(false)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == meta::FINALIZER)
    }

    pub fn requested_at(&self) -> Option<&str> {
        self.annotations().get(meta::REQUESTED_AT_ANNOTATION).map(String::as_str)
    }

    /// Periodic reconcile interval; zero disables periodic reconciles.
    pub fn interval(&self, default: Duration) -> Result<Duration> {
        match self.annotations().get(meta::RECONCILE_EVERY_ANNOTATION) {
            Some(v) => crate::duration::parse(v).with_context(|| format!("annotation {}", meta::RECONCILE_EVERY_ANNOTATION)),
            None => Ok(default),
        }
    }

    /// Timeout from the annotation, then `spec.timeout`, then `default`.
    pub fn timeout(&self, default: Duration) -> Result<Duration> {
        if let Some(v) = self.annotations().get(meta::RECONCILE_TIMEOUT_ANNOTATION) {
            return crate::duration::parse(v).with_context(|| format!("annotation {}", meta::RECONCILE_TIMEOUT_ANNOTATION));
        }
        match &self.spec.timeout {
            Some(v) => crate::duration::parse(v).context("spec.timeout"),
            None => Ok(default),
        }
    }

    pub fn owner_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (meta::OWNER_NAME_LABEL.to_string(), self.name_any()),
            (meta::OWNER_NAMESPACE_LABEL.to_string(), self.namespace().unwrap_or_default()),
        ])
    }

    pub fn inventory(&self) -> ResourceInventory {
        self.status.as_ref().and_then(|s| s.inventory.clone()).unwrap_or_default()
    }

    /// Whether inputs come from anywhere at all (inline or providers).
    pub fn has_input_sources(&self) -> bool {
        !self.spec.inputs.is_empty() || !self.spec.inputs_from.is_empty()
    }

    pub fn input_strategy(&self) -> InputStrategyName {
        self.spec.input_strategy.as_ref().map(|s| s.name).unwrap_or_default()
    }
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(group = "fluxcd.controlplane.io", version = "v1", kind = "ResourceSetInputProvider")]
#[kube(namespaced, status = "ResourceSetInputProviderStatus", shortname = "rsip")]
#[serde(rename_all = "camelCase")]
pub struct ResourceSetInputProviderSpec {
    /// Provider type, e.g. `Static`, `GitHubPullRequest`, `OCIArtifactTag`.
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub default_values: InputValues,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSetInputProviderStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exported_inputs: Vec<InputValues>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exported_revision: Option<String>,
}

pub const STATIC_PROVIDER_TYPE: &str = "Static";

impl ResourceSetInputProvider {
    /// Records exported by the provider. A `Static` provider with nothing
    /// exported yet exports its default values.
    pub fn exported_inputs(&self) -> Vec<InputValues> {
        let exported = self.status.as_ref().map(|s| s.exported_inputs.clone()).unwrap_or_default();
        if exported.is_empty() && self.spec.type_ == STATIC_PROVIDER_TYPE && !self.spec.default_values.is_empty() {
            return vec![self.spec.default_values.clone()];
        }
        exported
    }
}
