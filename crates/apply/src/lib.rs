//! ResourceSet apply: staged server-side apply, garbage collection and
//! readiness waits over a `ClusterStore`.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde_json::Map;
use tracing::{debug, info, warn};

use rset_core::changeset::{Action, ChangeSet};
use rset_core::meta;
use rset_core::object::{self, ObjectKey};
use rset_core::Json;
use rset_kubehub::{compute_status, ApplyParams, ClusterStore, ObjectStatus, StoreError};

mod diff;
pub mod normalize;

pub use diff::{diff_summary, strip_noisy, DiffSummary};
pub use normalize::{apply_common_metadata, normalize, resolve_copy_from, set_owner_labels};

/// Value of the `ssa` annotation on a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SsaPolicy {
    /// Apply and take over fields from other managers.
    #[default]
    Override,
    /// Apply without taking over fields held by other managers.
    Merge,
    /// Create only; never update an existing object.
    IfNotPresent,
    /// Never apply.
    Ignore,
}

impl SsaPolicy {
    pub fn of(obj: &Json) -> Self {
        match object::annotation(obj, meta::SSA_ANNOTATION) {
            Some(v) if v.eq_ignore_ascii_case("merge") => SsaPolicy::Merge,
            Some(v) if v.eq_ignore_ascii_case("ifnotpresent") => SsaPolicy::IfNotPresent,
            Some(v) if v.eq_ignore_ascii_case("ignore") => SsaPolicy::Ignore,
            _ => SsaPolicy::Override,
        }
    }
}

/// Foreign bookkeeping removed from live objects before they are applied.
#[derive(Debug, Clone)]
pub struct CleanupPolicy {
    pub annotations: Vec<String>,
    pub labels: Vec<String>,
    /// Field managers whose fields are taken over by ours.
    pub field_managers: Vec<String>,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            annotations: vec![
                "kubectl.kubernetes.io/last-applied-configuration".into(),
                "meta.helm.sh/release-name".into(),
                "meta.helm.sh/release-namespace".into(),
            ],
            labels: vec!["app.kubernetes.io/managed-by".into(), "helm.sh/chart".into()],
            field_managers: vec!["kubectl".into(), "kubectl-client-side-apply".into(), "before-first-apply".into(), "helm".into()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Recreate any object whose immutable fields changed.
    pub force: bool,
    pub cleanup: CleanupPolicy,
    /// Bound for waiting on CRDs applied in the first stage.
    pub wait_timeout: Duration,
    pub wait_interval: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self { force: false, cleanup: CleanupPolicy::default(), wait_timeout: Duration::from_secs(60), wait_interval: Duration::from_secs(2) }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Owner labels (name, namespace); live objects labelled for another owner are skipped.
    pub owner: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub interval: Duration,
    pub timeout: Duration,
    /// Stop at the first object reporting `Failed`.
    pub fail_fast: bool,
}

impl WaitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self { interval: Duration::from_secs(2), timeout, fail_fast: true }
    }
}

/// Some objects of a staged apply failed. Objects applied before the failure
/// are in `changeset`.
#[derive(Debug, thiserror::Error)]
#[error("apply failed: {}", .failures.join("; "))]
pub struct ApplyError {
    pub changeset: ChangeSet,
    pub failures: Vec<String>,
}

fn is_managed_group(group: &str) -> bool {
    group.ends_with(".toolkit.fluxcd.io") || group == meta::GROUP
}

fn stage_of(key: &ObjectKey) -> usize {
    let definition = (key.group == "apiextensions.k8s.io" && key.kind == "CustomResourceDefinition") || key.is_core_kind("Namespace");
    if definition {
        0
    } else if key.kind.ends_with("Class") {
        1
    } else {
        2
    }
}

/// Apply, delete and wait on sets of objects with one field manager.
pub struct ResourceManager {
    store: Arc<dyn ClusterStore>,
    field_manager: String,
}

impl ResourceManager {
    pub fn new(store: Arc<dyn ClusterStore>, field_manager: &str) -> Self {
        Self { store, field_manager: field_manager.to_string() }
    }

    pub fn store(&self) -> &dyn ClusterStore {
        self.store.as_ref()
    }

    /// Apply objects in three stages: cluster definitions (CRDs and
    /// Namespaces), class kinds, then the rest. A failing object does not
    /// stop its own stage, but no later stage runs.
    pub async fn apply_all_staged(&self, objects: &[Json], opts: &ApplyOptions) -> Result<ChangeSet> {
        let t0 = Instant::now();
        let mut stages: [Vec<(ObjectKey, &Json)>; 3] = Default::default();
        for obj in objects {
            let key = ObjectKey::from_object(obj)?;
            stages[stage_of(&key)].push((key, obj));
        }

        let mut changeset = ChangeSet::default();
        for (idx, stage) in stages.iter().enumerate() {
            if stage.is_empty() {
                continue;
            }
            let mut failures = Vec::new();
            let mut changed_crds = Vec::new();
            for (key, obj) in stage {
                match self.apply_one(key, obj, opts).await {
                    Ok(action) => {
                        if action.is_change() && key.kind == "CustomResourceDefinition" {
                            changed_crds.push(key.clone());
                        }
                        counter!("resourceset_apply_changes_total", 1, "action" => action.as_str());
                        changeset.add(key.clone(), action);
                    }
                    Err(e) => {
                        counter!("resourceset_apply_changes_total", 1, "action" => Action::Failed.as_str());
                        warn!(object = %key, error = %e, "apply failed");
                        failures.push(format!("{}: {:#}", key, e));
                        changeset.add(key.clone(), Action::Failed);
                    }
                }
            }
            if !failures.is_empty() {
                return Err(ApplyError { changeset, failures }.into());
            }
            if !changed_crds.is_empty() {
                let wait = WaitOptions { interval: opts.wait_interval, timeout: opts.wait_timeout, fail_fast: true };
                self.wait_for_set(&changed_crds, &wait).await.context("waiting for CRDs to be established")?;
            }
            debug!(stage = idx, objects = stage.len(), "stage applied");
        }
        histogram!("resourceset_apply_duration_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(changeset)
    }

    async fn apply_one(&self, key: &ObjectKey, obj: &Json, opts: &ApplyOptions) -> Result<Action> {
        let policy = SsaPolicy::of(obj);
        if policy == SsaPolicy::Ignore {
            return Ok(Action::Skipped);
        }
        let mut live = self.store.get(key).await?;
        if live.is_some() && policy == SsaPolicy::IfNotPresent {
            return Ok(Action::Skipped);
        }

        let mut cleaned = false;
        if let Some(current) = &live {
            if let Some(patch) = self.cleanup_patch(current, &opts.cleanup, policy != SsaPolicy::Merge) {
                live = Some(self.store.patch_merge(key, &patch).await.with_context(|| format!("cleaning up {}", key))?);
                cleaned = true;
            }
        }

        let params = ApplyParams::new(&self.field_manager);
        let force = opts.force || object::annotation(obj, meta::FORCE_ANNOTATION) == Some(meta::ENABLED_VALUE);
        let dry = match self.store.apply(obj, &params.dry_run()).await {
            Ok(dry) => dry,
            Err(e) => match e.downcast_ref::<StoreError>() {
                Some(StoreError::Immutable { .. }) if force => {
                    info!(object = %key, "immutable field changed, recreating");
                    self.store.delete(key).await?;
                    self.wait_for_termination(std::slice::from_ref(key), &WaitOptions::new(opts.wait_timeout)).await?;
                    self.store.apply(obj, &params).await?;
                    return Ok(Action::Created);
                }
                _ => return Err(e),
            },
        };

        let Some(current) = live else {
            self.store.apply(obj, &params).await?;
            return Ok(Action::Created);
        };
        let before = strip_noisy(current);
        let after = strip_noisy(dry);
        if before == after && !cleaned {
            return Ok(Action::Unchanged);
        }
        let summary = diff_summary(&after, &before);
        debug!(object = %key, adds = summary.adds, updates = summary.updates, removes = summary.removes, "drift detected");
        self.store.apply(obj, &params).await?;
        Ok(Action::Configured)
    }

    /// Merge patch removing foreign annotations and labels and, when
    /// `takeover` is set, handing foreign managed fields to our manager.
    fn cleanup_patch(&self, live: &Json, policy: &CleanupPolicy, takeover: bool) -> Option<Json> {
        let mut meta_patch = Map::new();
        for (field, keys) in [("annotations", &policy.annotations), ("labels", &policy.labels)] {
            let present = live.get("metadata").and_then(|m| m.get(field)).and_then(|m| m.as_object());
            let removed: Map<String, Json> = keys
                .iter()
                .filter(|k| present.map_or(false, |p| p.contains_key(k.as_str())))
                .map(|k| (k.clone(), Json::Null))
                .collect();
            if !removed.is_empty() {
                meta_patch.insert(field.to_string(), Json::Object(removed));
            }
        }
        if takeover {
            if let Some(entries) = live.get("metadata").and_then(|m| m.get("managedFields")).and_then(|m| m.as_array()) {
                let mut changed = false;
                let rewritten: Vec<Json> = entries
                    .iter()
                    .map(|entry| {
                        let manager = entry.get("manager").and_then(|m| m.as_str()).unwrap_or_default();
                        if policy.field_managers.iter().any(|m| m == manager) {
                            changed = true;
                            let mut e = entry.clone();
                            e["manager"] = Json::String(self.field_manager.clone());
                            e["operation"] = Json::String("Apply".into());
                            e
                        } else {
                            entry.clone()
                        }
                    })
                    .collect();
                if changed {
                    meta_patch.insert("managedFields".into(), Json::Array(rewritten));
                }
            }
        }
        if meta_patch.is_empty() {
            None
        } else {
            Some(serde_json::json!({ "metadata": meta_patch }))
        }
    }

    /// Delete the given objects. Objects already gone produce no entry;
    /// objects with pruning disabled or owned by someone else are skipped.
    /// Delete errors are reported as `Failed` entries, not as an error.
    pub async fn delete_all(&self, keys: &[ObjectKey], opts: &DeleteOptions) -> Result<ChangeSet> {
        let mut changeset = ChangeSet::default();
        for key in keys {
            let live = match self.store.get(key).await {
                Ok(Some(live)) => live,
                Ok(None) => continue,
                Err(e) => {
                    warn!(object = %key, error = %e, "prune lookup failed");
                    changeset.add(key.clone(), Action::Failed);
                    continue;
                }
            };
            if object::annotation(&live, meta::PRUNE_ANNOTATION) == Some(meta::DISABLED_VALUE) {
                changeset.add(key.clone(), Action::Skipped);
                continue;
            }
            if let Some((name, namespace)) = &opts.owner {
                let labels = object::labels(&live);
                let foreign = match (labels.get(meta::OWNER_NAME_LABEL), labels.get(meta::OWNER_NAMESPACE_LABEL)) {
                    (Some(n), Some(ns)) => n != name || ns != namespace,
                    _ => false,
                };
                if foreign {
                    debug!(object = %key, "owned by another ResourceSet, not pruning");
                    changeset.add(key.clone(), Action::Skipped);
                    continue;
                }
            }
            match self.store.delete(key).await {
                Ok(_) => {
                    counter!("resourceset_prune_total", 1);
                    changeset.add(key.clone(), Action::Deleted);
                }
                Err(e) => {
                    warn!(object = %key, error = %e, "delete failed");
                    changeset.add(key.clone(), Action::Failed);
                }
            }
        }
        Ok(changeset)
    }

    /// Delete Flux-managed objects first and wait for them to terminate, then
    /// delete everything else. Waiting errors are logged only.
    pub async fn delete_two_phase(&self, keys: &[ObjectKey], opts: &DeleteOptions, timeout: Duration) -> Result<ChangeSet> {
        let (managed, rest): (Vec<ObjectKey>, Vec<ObjectKey>) = keys.iter().cloned().partition(|k| is_managed_group(&k.group));
        let mut changeset = ChangeSet::default();
        if !managed.is_empty() {
            let first = self.delete_all(&managed, opts).await?;
            let deleted: Vec<ObjectKey> = first.entries.iter().filter(|e| e.action == Action::Deleted).map(|e| e.key.clone()).collect();
            changeset.append(first);
            if !deleted.is_empty() {
                if let Err(e) = self.wait_for_termination(&deleted, &WaitOptions::new(timeout)).await {
                    warn!(error = %e, "managed objects did not terminate in time");
                }
            }
        }
        if !rest.is_empty() {
            changeset.append(self.delete_all(&rest, opts).await?);
        }
        Ok(changeset)
    }

    /// Poll until every object is `Current`. With `fail_fast`, the first
    /// `Failed` object ends the wait.
    pub async fn wait_for_set(&self, keys: &[ObjectKey], opts: &WaitOptions) -> Result<()> {
        let deadline = Instant::now() + opts.timeout;
        loop {
            let mut pending = Vec::new();
            for key in keys {
                let res = match self.store.get(key).await? {
                    Some(live) => compute_status(&live),
                    None => rset_kubehub::StatusResult { status: ObjectStatus::NotFound, message: "Resource not found".into() },
                };
                match res.status {
                    ObjectStatus::Current => {}
                    ObjectStatus::Failed if opts.fail_fast => {
                        return Err(anyhow!("{} status: 'Failed': {}", key, res.message));
                    }
                    status => pending.push(format!("{} status: '{}'", key, status)),
                }
            }
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("timeout waiting for: [{}]", pending.join(", ")));
            }
            tokio::time::sleep(opts.interval.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    /// Poll until none of the objects exist.
    pub async fn wait_for_termination(&self, keys: &[ObjectKey], opts: &WaitOptions) -> Result<()> {
        let deadline = Instant::now() + opts.timeout;
        loop {
            let mut remaining = Vec::new();
            for key in keys {
                if self.store.get(key).await?.is_some() {
                    remaining.push(key.to_string());
                }
            }
            if remaining.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(anyhow!("timeout waiting for termination of: [{}]", remaining.join(", ")));
            }
            tokio::time::sleep(opts.interval.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }
}
