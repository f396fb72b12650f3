//! Apply the built objects of a ResourceSet, prune what it no longer
//! produces, and optionally wait for readiness.

use std::sync::Arc;
use std::time::Instant;

use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use rset_apply::{
    apply_common_metadata, normalize, resolve_copy_from, set_owner_labels, ApplyOptions, DeleteOptions, ResourceManager,
    WaitOptions,
};
use rset_core::changeset::{Action, ChangeSet};
use rset_core::conditions::{self, ConditionStatus};
use rset_core::crd::ResourceSet;
use rset_core::digest::digest_objects;
use rset_core::inventory::{ResourceInventory, ResourceRef};
use rset_core::meta;
use rset_core::object::ObjectKey;
use rset_core::Json;
use rset_kubehub::ClusterStore;

use crate::config::ReconcilerConfig;
use crate::error::ReconcileError;
use crate::events::EventSink;

pub const REASON_APPLY_SUCCEEDED: &str = "ApplySucceeded";
pub const REASON_PRUNE_FAILED: &str = "PruneFailed";

#[derive(Debug)]
pub struct ApplyReport {
    /// Digest of the applied object set.
    pub digest: String,
    pub inventory: ResourceInventory,
    /// Created, configured and deleted objects.
    pub changes: ChangeSet,
}

#[derive(Debug)]
pub struct ApplyFailure {
    /// Digest of the object set that was attempted.
    pub digest: String,
    /// Set when objects were applied before the failure (readiness wait).
    pub inventory: Option<ResourceInventory>,
    pub error: ReconcileError,
}

fn fail(digest: &str, error: ReconcileError) -> ApplyFailure {
    ApplyFailure { digest: digest.to_string(), inventory: None, error }
}

fn is_flux_group(group: &str) -> bool {
    group.ends_with(".fluxcd.io") || group == meta::GROUP
}

/// Ready messages of changed Flux objects that are not ready.
async fn not_ready_summary(store: &dyn ClusterStore, keys: &[ObjectKey]) -> String {
    let mut lines = Vec::new();
    for key in keys.iter().filter(|k| is_flux_group(&k.group)) {
        let Ok(Some(live)) = store.get(key).await else { continue };
        let conds: Vec<conditions::Condition> = live
            .pointer("/status/conditions")
            .cloned()
            .and_then(|c| serde_json::from_value(c).ok())
            .unwrap_or_default();
        match conditions::get(&conds, conditions::READY) {
            Some(c) if c.status == ConditionStatus::True => {}
            Some(c) => lines.push(format!("{} status: '{}': {}", key, c.reason, c.message)),
            None => lines.push(format!("{} status: 'Unknown'", key)),
        }
    }
    lines.join("\n")
}

/// Converge the cluster to `objects` with `store` (already bound to the
/// ResourceSet's identity). Waits end at `deadline`. Prune failures are
/// logged and do not fail the apply.
pub async fn apply_set(
    store: Arc<dyn ClusterStore>,
    rs: &ResourceSet,
    mut objects: Vec<Json>,
    config: &ReconcilerConfig,
    events: &dyn EventSink,
    deadline: Instant,
) -> Result<ApplyReport, ApplyFailure> {
    let remaining = || deadline.saturating_duration_since(Instant::now());
    let previous = rs.inventory();
    let name = rs.name_any();
    let namespace = rs.namespace().unwrap_or_default();

    set_owner_labels(&mut objects, &name, &namespace);
    if let Err(e) = normalize(&mut objects) {
        let raw = digest_objects(&objects).unwrap_or_default();
        return Err(fail(&raw, ReconcileError::Apply(format!("normalization failed: {:#}", e))));
    }
    if let Some(common) = &rs.spec.common_metadata {
        apply_common_metadata(&mut objects, common);
    }
    let attempted = digest_objects(&objects).map_err(|e| fail("", ReconcileError::Apply(format!("{:#}", e))))?;
    resolve_copy_from(store.as_ref(), &mut objects)
        .await
        .map_err(|e| fail(&attempted, ReconcileError::Apply(format!("{:#}", e))))?;

    let digest = digest_objects(&objects).map_err(|e| fail(&attempted, ReconcileError::Apply(format!("{:#}", e))))?;
    debug!(name = %name, namespace = %namespace, objects = objects.len(), digest = %digest, "applying object set");

    let manager = ResourceManager::new(store.clone(), &config.field_manager);
    let opts = ApplyOptions { wait_timeout: remaining(), wait_interval: config.wait_interval, ..ApplyOptions::default() };
    let changeset = manager
        .apply_all_staged(&objects, &opts)
        .await
        .map_err(|e| fail(&digest, ReconcileError::Apply(format!("{:#}", e))))?;

    let mut changes = changeset.changes();
    // prune results never join the readiness wait
    let applied: Vec<ObjectKey> =
        changes.entries.iter().filter(|e| e.action != Action::Failed).map(|e| e.key.clone()).collect();
    let mut inventory = changeset.to_inventory();

    let stale = previous.diff(&inventory);
    if !stale.is_empty() {
        let mut keys = Vec::with_capacity(stale.len());
        for entry in &stale {
            match entry.to_key() {
                Ok(k) => keys.push(k),
                Err(e) => warn!(name = %name, namespace = %namespace, error = %e, "skipping malformed inventory entry"),
            }
        }
        let delete = DeleteOptions { owner: Some((name.clone(), namespace.clone())) };
        match manager.delete_two_phase(&keys, &delete, remaining()).await {
            Ok(pruned) => {
                let failed: Vec<&ObjectKey> = pruned.entries.iter().filter(|e| e.action == Action::Failed).map(|e| &e.key).collect();
                if !failed.is_empty() {
                    let list = failed.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", ");
                    warn!(name = %name, namespace = %namespace, objects = %list, "garbage collection incomplete");
                    events
                        .publish(rs, EventType::Warning, REASON_PRUNE_FAILED, &format!("failed to delete stale objects: {}", list))
                        .await;
                    // kept so the next reconcile retries the delete
                    inventory.entries.extend(failed.into_iter().map(ResourceRef::from_key));
                }
                changes.entries.extend(pruned.entries.into_iter().filter(|e| e.action == Action::Deleted));
            }
            Err(e) => {
                warn!(name = %name, namespace = %namespace, error = %format!("{:#}", e), "garbage collection failed");
                inventory.entries.extend(keys.iter().map(ResourceRef::from_key));
            }
        }
    }

    if !changes.is_empty() {
        info!(name = %name, namespace = %namespace, changes = changes.len(), "{}", changes.log());
        events.publish(rs, EventType::Normal, REASON_APPLY_SUCCEEDED, &changes.log()).await;
    }

    if rs.spec.wait {
        if !applied.is_empty() {
            let wait = WaitOptions { interval: config.wait_interval, timeout: remaining(), fail_fast: true };
            if let Err(e) = manager.wait_for_set(&applied, &wait).await {
                let mut message = format!("{:#}", e);
                let summary = not_ready_summary(store.as_ref(), &applied).await;
                if !summary.is_empty() {
                    message = format!("{}\n{}", message, summary);
                }
                return Err(ApplyFailure { digest, inventory: Some(inventory), error: ReconcileError::Apply(message) });
            }
            debug!(name = %name, namespace = %namespace, objects = applied.len(), "applied objects are ready");
        }
    }

    Ok(ApplyReport { digest, inventory, changes })
}
