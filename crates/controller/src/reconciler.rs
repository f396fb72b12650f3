//! ResourceSet reconcile state machine: finalizer lifecycle, dependency
//! gate, inputs, build, apply and the status that reports on all of it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use rset_apply::{DeleteOptions, ResourceManager};
use rset_core::changeset::Action as Change;
use rset_core::conditions::reasons;
use rset_core::crd::{ResourceSet, ResourceSetStatus};
use rset_core::digest::digest_value;
use rset_core::inventory::ResourceInventory;
use rset_core::{duration, meta};
use rset_inputs::resolve_inputs;
use rset_kubehub::{is_not_found, ClusterStore, StoreFactory};
use rset_template::{Builder, ExprEngine};

use crate::apply::{apply_set, ApplyReport};
use crate::backoff::Backoff;
use crate::config::ReconcilerConfig;
use crate::error::ReconcileError;
use crate::events::EventSink;
use crate::{gate, metrics, state};

/// Longest periodic requeue; the controller's delay queue rejects longer ones.
pub const MAX_REQUEUE_INTERVAL: Duration = Duration::from_secs(365 * 24 * 3600);

/// What a reconcile attempt got to before it ended.
#[derive(Debug, Default)]
struct Progress {
    digest: Option<String>,
    inventory: Option<ResourceInventory>,
    inputs: Option<usize>,
    resources: Option<usize>,
}

impl Progress {
    fn metadata(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        if let Some(n) = self.inputs {
            m.insert("inputs".to_string(), n.to_string());
        }
        if let Some(n) = self.resources {
            m.insert("resources".to_string(), n.to_string());
        }
        m
    }
}

pub struct Reconciler {
    factory: Arc<dyn StoreFactory>,
    builder: Arc<dyn Builder>,
    engine: Arc<dyn ExprEngine>,
    events: Arc<dyn EventSink>,
    config: ReconcilerConfig,
    backoff: Backoff,
}

impl Reconciler {
    pub fn new(
        factory: Arc<dyn StoreFactory>,
        builder: Arc<dyn Builder>,
        engine: Arc<dyn ExprEngine>,
        events: Arc<dyn EventSink>,
        config: ReconcilerConfig,
    ) -> Self {
        Self { factory, builder, engine, events, config, backoff: Backoff::default() }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Retry delay after a transient failure of `rs`.
    pub fn retry_after(&self, rs: &ResourceSet) -> Duration {
        self.backoff.next(&rs.key().to_string())
    }

    fn service_account(&self, rs: &ResourceSet) -> Option<String> {
        rs.spec.service_account_name.clone().filter(|s| !s.is_empty()).or_else(|| self.config.default_service_account.clone())
    }

    #[instrument(skip_all, fields(name = %rs.name_any(), namespace = %rs.namespace().unwrap_or_default()))]
    pub async fn reconcile(&self, rs: &ResourceSet) -> Result<Action, ReconcileError> {
        let start = Instant::now();
        let namespace = rs.namespace().unwrap_or_default();
        let store = self.factory.operator();

        if rs.is_deleting() {
            return self.finalize(store.as_ref(), rs).await;
        }
        if !rs.has_finalizer() {
            self.add_finalizer(store.as_ref(), rs).await?;
            return Ok(Action::requeue(Duration::ZERO));
        }
        if rs.is_disabled() {
            info!("reconciliation is disabled");
            metrics::record_reconcile(&namespace, "disabled", start.elapsed());
            return Ok(Action::await_change());
        }

        let generation = rs.metadata.generation;
        let mut status = rs.status.clone().unwrap_or_default();
        let previous_reason = state::ready_reason(&status).map(str::to_string);
        if let Some(at) = rs.requested_at() {
            status.last_handled_reconcile_at = Some(at.to_string());
        }
        state::mark_reconciling(&mut status, generation, Utc::now());
        self.patch_status(store.as_ref(), rs, &status).await?;

        let mut progress = Progress::default();
        let result = self.reconcile_enabled(rs, &mut progress).await;
        let elapsed = start.elapsed();
        let now = Utc::now();
        if let Some(inventory) = progress.inventory.take() {
            status.inventory = Some(inventory);
        }

        let (label, outcome) = match result {
            Ok((report, interval)) => {
                let message = format!("Reconciliation finished in {}", duration::format(elapsed));
                info!(digest = %report.digest, changes = report.changes.len(), "{}", message);
                state::mark_ready(&mut status, &message, generation, now);
                status.inventory = Some(report.inventory);
                status.last_applied_revision = Some(report.digest.clone());
                progress.digest = Some(report.digest);
                self.record_history(rs, &mut status, &progress, reasons::SUCCEEDED, elapsed);
                self.backoff.reset(&rs.key().to_string());
                let action = if interval.is_zero() { Action::await_change() } else { Action::requeue(interval.min(MAX_REQUEUE_INTERVAL)) };
                ("success", Ok(action))
            }
            Err(err) if err.is_terminal() => {
                let message = err.to_string();
                error!(reason = err.reason(), error = %message, "reconciliation stalled");
                state::mark_stalled(&mut status, err.reason(), &message, generation, now);
                self.record_history(rs, &mut status, &progress, err.reason(), elapsed);
                self.events.publish(rs, EventType::Warning, err.reason(), &message).await;
                self.backoff.reset(&rs.key().to_string());
                ("stalled", Ok(Action::await_change()))
            }
            Err(ReconcileError::DependencyNotReady(message)) => {
                let reason = reasons::DEPENDENCY_NOT_READY;
                state::mark_failed(&mut status, reason, &message, generation, now);
                if previous_reason.as_deref() != Some(reason) {
                    info!(reason, "{}", message);
                    self.events.publish(rs, EventType::Normal, reason, &message).await;
                } else {
                    debug!(reason, "{}", message);
                }
                ("dependency", Ok(Action::requeue(self.config.requeue_dependency)))
            }
            Err(err) => {
                let message = err.to_string();
                error!(reason = err.reason(), error = %message, "reconciliation failed");
                state::mark_failed(&mut status, err.reason(), &message, generation, now);
                self.record_history(rs, &mut status, &progress, err.reason(), elapsed);
                if previous_reason.as_deref() != Some(err.reason()) {
                    self.events.publish(rs, EventType::Warning, err.reason(), &message).await;
                }
                ("error", Err(err))
            }
        };

        metrics::record_reconcile(&namespace, label, elapsed);
        if let Err(e) = self.patch_status(store.as_ref(), rs, &status).await {
            return Err(match outcome {
                Err(err) => ReconcileError::Store(anyhow::anyhow!("{}; {}", err, e)),
                Ok(_) => e,
            });
        }
        outcome
    }

    async fn reconcile_enabled(&self, rs: &ResourceSet, progress: &mut Progress) -> Result<(ApplyReport, Duration), ReconcileError> {
        let interval = rs
            .interval(self.config.default_interval)
            .map_err(|e| ReconcileError::InvalidConfiguration(format!("{:#}", e)))?;
        let timeout = rs
            .timeout(self.config.default_timeout)
            .map_err(|e| ReconcileError::InvalidConfiguration(format!("{:#}", e)))?;
        let deadline = Instant::now()
            .checked_add(timeout)
            .ok_or_else(|| ReconcileError::InvalidConfiguration(format!("timeout {} is out of range", duration::format(timeout))))?;
        let store = self.factory.operator();

        gate::check_dependencies(store.as_ref(), self.engine.as_ref(), &rs.spec.depends_on).await?;

        let inputs = resolve_inputs(store.as_ref(), rs).await?;
        progress.inputs = Some(inputs.len());

        let objects = self
            .builder
            .build(rs.spec.resources_template.as_deref(), &rs.spec.resources, &inputs)
            .map_err(|e| ReconcileError::BuildFailed(format!("{:#}", e)))?;
        progress.resources = Some(objects.len());

        let namespace = rs.namespace().unwrap_or_default();
        let scoped = self
            .factory
            .impersonate(&namespace, self.service_account(rs).as_deref())
            .await
            .map_err(ReconcileError::Store)?;

        match apply_set(scoped, rs, objects, &self.config, self.events.as_ref(), deadline).await {
            Ok(report) => Ok((report, interval)),
            Err(failure) => {
                progress.digest = Some(failure.digest);
                progress.inventory = failure.inventory;
                Err(failure.error)
            }
        }
    }

    /// Upsert the history entry of this attempt. Attempts that never reached
    /// an object set are keyed by the digest of the spec.
    fn record_history(&self, rs: &ResourceSet, status: &mut ResourceSetStatus, progress: &Progress, reason: &str, elapsed: Duration) {
        let digest = match &progress.digest {
            Some(d) if !d.is_empty() => d.clone(),
            _ => match digest_value(&rs.spec) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "cannot digest spec, history not recorded");
                    return;
                }
            },
        };
        status.history.upsert(&digest, Utc::now(), elapsed, reason, progress.metadata());
        status.history.truncate(self.config.history_limit);
    }

    async fn patch_status(&self, store: &dyn ClusterStore, rs: &ResourceSet, status: &ResourceSetStatus) -> Result<(), ReconcileError> {
        let body = serde_json::to_value(status).map_err(|e| ReconcileError::Store(e.into()))?;
        store.patch_status(&rs.key(), &json!({ "status": body })).await?;
        Ok(())
    }

    async fn add_finalizer(&self, store: &dyn ClusterStore, rs: &ResourceSet) -> Result<(), ReconcileError> {
        let mut finalizers = rs.finalizers().to_vec();
        finalizers.push(meta::FINALIZER.to_string());
        store.patch_merge(&rs.key(), &json!({ "metadata": { "finalizers": finalizers } })).await?;

        let mut status = rs.status.clone().unwrap_or_default();
        state::mark_reconciling(&mut status, rs.metadata.generation, Utc::now());
        self.patch_status(store, rs, &status).await?;
        debug!("finalizer added");
        Ok(())
    }

    /// Prune everything in the inventory, then drop the finalizer. Pruning is
    /// best effort: its failures are logged and the finalizer goes regardless.
    async fn finalize(&self, store: &dyn ClusterStore, rs: &ResourceSet) -> Result<Action, ReconcileError> {
        if !rs.has_finalizer() {
            return Ok(Action::await_change());
        }
        let inventory = rs.inventory();
        if rs.is_disabled() {
            info!(objects = inventory.len(), "reconciliation is disabled, leaving objects in place");
        } else if !inventory.is_empty() {
            self.uninstall(rs, &inventory).await;
        }

        let finalizers: Vec<String> = rs.finalizers().iter().filter(|f| *f != meta::FINALIZER).cloned().collect();
        match store.patch_merge(&rs.key(), &json!({ "metadata": { "finalizers": finalizers } })).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
        self.backoff.reset(&rs.key().to_string());
        info!("finalized");
        Ok(Action::await_change())
    }

    async fn uninstall(&self, rs: &ResourceSet, inventory: &ResourceInventory) {
        let namespace = rs.namespace().unwrap_or_default();
        let timeout = rs.timeout(self.config.default_timeout).unwrap_or(self.config.default_timeout);
        let store = match self.factory.impersonate(&namespace, self.service_account(rs).as_deref()).await {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %format!("{:#}", e), objects = inventory.len(), "cannot act as the service account, objects are orphaned");
                return;
            }
        };
        let mut keys = Vec::with_capacity(inventory.len());
        for entry in &inventory.entries {
            match entry.to_key() {
                Ok(k) => keys.push(k),
                Err(e) => warn!(error = %e, "skipping malformed inventory entry"),
            }
        }
        let manager = ResourceManager::new(store, &self.config.field_manager);
        let owner = DeleteOptions { owner: Some((rs.name_any(), namespace)) };
        match manager.delete_two_phase(&keys, &owner, timeout).await {
            Ok(cs) => {
                if cs.count(Change::Failed) > 0 {
                    warn!(failed = cs.count(Change::Failed), "some objects could not be deleted");
                }
                info!(deleted = cs.count(Change::Deleted), "{}", cs.changes().log());
            }
            Err(e) => warn!(error = %format!("{:#}", e), "uninstall failed"),
        }
    }
}
