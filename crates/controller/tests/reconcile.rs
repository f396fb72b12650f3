use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use serde_json::json;

use rset_controller::{
    ReconcileError, Reconciler, ReconcilerConfig, RecordingEventSink, MAX_REQUEUE_INTERVAL, REASON_APPLY_SUCCEEDED,
    REASON_PRUNE_FAILED,
};
use rset_core::conditions::{self, reasons, READY, RECONCILING, STALLED};
use rset_core::crd::{ResourceSet, ResourceSetStatus};
use rset_core::meta;
use rset_core::object::ObjectKey;
use rset_core::Json;
use rset_kubehub::{ClusterStore, MemoryStore, StaticStoreFactory};
use rset_template::{CelLite, TemplateBuilder};

const TEMPLATE: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: << inputs.tenant >>
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: tenant-config
  namespace: << inputs.tenant >>
data:
  id: << inputs.id >>
"#;

struct Harness {
    store: Arc<MemoryStore>,
    factory: Arc<StaticStoreFactory>,
    events: Arc<RecordingEventSink>,
    reconciler: Reconciler,
    key: ObjectKey,
}

impl Harness {
    fn new(spec: Json) -> Self {
        Self::with_config(spec, ReconcilerConfig::default())
    }

    fn with_config(spec: Json, config: ReconcilerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let key = store
            .insert(json!({
                "apiVersion": meta::API_VERSION,
                "kind": "ResourceSet",
                "metadata": { "name": "tenants", "namespace": "apps" },
                "spec": spec
            }))
            .unwrap();
        let factory = Arc::new(StaticStoreFactory::new(store.clone()));
        let events = Arc::new(RecordingEventSink::new());
        let reconciler = Reconciler::new(
            factory.clone(),
            Arc::new(TemplateBuilder::default()),
            Arc::new(CelLite),
            events.clone(),
            config,
        );
        Self { store, factory, events, reconciler, key }
    }

    fn current(&self) -> ResourceSet {
        serde_json::from_value(self.store.object(&self.key).expect("resourceset exists")).unwrap()
    }

    fn status(&self) -> ResourceSetStatus {
        self.current().status.unwrap_or_default()
    }

    async fn reconcile(&self) -> Result<Action, ReconcileError> {
        let rs = self.current();
        self.reconciler.reconcile(&rs).await
    }

    /// First pass adds the finalizer, second does the work.
    async fn converge(&self) -> Result<Action, ReconcileError> {
        assert_eq!(self.reconcile().await.unwrap(), Action::requeue(Duration::ZERO));
        self.reconcile().await
    }

    fn edit(&self, f: impl FnOnce(&mut Json)) {
        let mut obj = self.store.object(&self.key).unwrap();
        f(&mut obj);
        self.store.insert(obj).unwrap();
    }

    fn ready_reason(&self) -> String {
        conditions::get(&self.status().conditions, READY).map(|c| c.reason.clone()).unwrap_or_default()
    }
}

fn two_tenants() -> Json {
    json!({
        "inputs": [{ "tenant": "team1" }, { "tenant": "team2" }],
        "resourcesTemplate": TEMPLATE
    })
}

fn annotations(pairs: &[(&str, &str)]) -> Json {
    Json::Object(pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect())
}

fn namespace(name: &str) -> ObjectKey {
    ObjectKey::new("v1", "Namespace", None, name)
}

fn tenant_config(ns: &str) -> ObjectKey {
    ObjectKey::new("v1", "ConfigMap", Some(ns), "tenant-config")
}

#[tokio::test]
async fn inputs_expand_and_removed_inputs_are_pruned() {
    let h = Harness::new(two_tenants());
    assert_eq!(h.converge().await.unwrap(), Action::requeue(Duration::from_secs(3600)));

    let status = h.status();
    assert_eq!(status.inventory.as_ref().map(|i| i.len()), Some(4));
    assert!(conditions::is_true(&status.conditions, READY));
    assert!(conditions::get(&status.conditions, RECONCILING).is_none());
    for tenant in ["team1", "team2"] {
        assert!(h.store.contains(&namespace(tenant)));
        let cm = h.store.object(&tenant_config(tenant)).unwrap();
        assert_eq!(cm["metadata"]["labels"][meta::OWNER_NAME_LABEL], "tenants");
        assert_eq!(cm["metadata"]["labels"][meta::OWNER_NAMESPACE_LABEL], "apps");
    }

    h.edit(|obj| obj["spec"]["inputs"] = json!([{ "tenant": "team1" }]));
    h.reconcile().await.unwrap();

    let inventory = h.status().inventory.unwrap();
    assert_eq!(inventory.len(), 2);
    assert!(inventory.contains("_team1__Namespace"));
    assert!(inventory.contains("team1_tenant-config__ConfigMap"));
    assert!(!h.store.contains(&namespace("team2")));
    assert!(!h.store.contains(&tenant_config("team2")));
    assert!(h.store.contains(&tenant_config("team1")));
}

#[tokio::test]
async fn unchanged_spec_reconciles_to_the_same_revision() {
    let h = Harness::new(two_tenants());
    h.converge().await.unwrap();
    let first = h.status();
    assert!(h.events.reasons().contains(&REASON_APPLY_SUCCEEDED.to_string()));
    let id1 = h.store.object(&tenant_config("team1")).unwrap()["data"]["id"].clone();
    let id2 = h.store.object(&tenant_config("team2")).unwrap()["data"]["id"].clone();
    assert!(id1.as_str().map_or(false, |s| !s.is_empty()));
    assert_ne!(id1, id2);

    h.events.clear();
    h.reconcile().await.unwrap();
    let second = h.status();
    assert_eq!(first.last_applied_revision, second.last_applied_revision);
    assert!(h.events.events().is_empty());
    assert_eq!(second.history.len(), 1);
    assert_eq!(second.history.latest().unwrap().total_reconciliations, 2);
    assert_eq!(h.store.object(&tenant_config("team1")).unwrap()["data"]["id"], id1);
}

#[tokio::test]
async fn history_keeps_one_entry_per_digest_across_failure_and_fix() {
    let h = Harness::new(two_tenants());
    h.converge().await.unwrap();
    let good = h.status().history.latest().unwrap().clone();

    h.edit(|obj| obj["spec"]["inputs"] = json!([{ "tenant": "team1" }, { "tenant": "team2" }, { "tenant": "team3" }]));
    h.store.fail_apply_for(&tenant_config("team3"), "admission webhook denied the request");
    let err = h.reconcile().await.unwrap_err();
    assert!(!err.is_terminal());
    assert!(err.to_string().contains("admission webhook denied"));
    let failed = h.status();
    assert_eq!(failed.history.len(), 2);
    assert_eq!(failed.history.latest().unwrap().last_reconciled_status, reasons::FAILED);
    assert_eq!(h.ready_reason(), reasons::FAILED);
    assert!(conditions::is_true(&failed.conditions, RECONCILING));
    assert!(conditions::get(&failed.conditions, STALLED).is_none());
    assert_eq!(failed.inventory.as_ref().map(|i| i.len()), Some(4));

    h.store.clear_failures();
    h.edit(|obj| obj["spec"]["inputs"] = json!([{ "tenant": "team1" }, { "tenant": "team2" }]));
    h.reconcile().await.unwrap();
    let fixed = h.status();
    assert_eq!(fixed.history.len(), 2);
    let latest = fixed.history.latest().unwrap();
    assert_eq!(latest.digest, good.digest);
    assert_eq!(latest.first_reconciled, good.first_reconciled);
    assert_eq!(latest.total_reconciliations, 2);
    assert_eq!(latest.last_reconciled_status, reasons::SUCCEEDED);
    assert_eq!(latest.metadata.get("inputs").map(String::as_str), Some("2"));
    assert_eq!(latest.metadata.get("resources").map(String::as_str), Some("4"));
}

#[tokio::test]
async fn history_is_capped() {
    let config = ReconcilerConfig { history_limit: 2, ..ReconcilerConfig::default() };
    let h = Harness::with_config(two_tenants(), config);
    h.converge().await.unwrap();
    for tenant in ["a", "b", "c"] {
        h.edit(|obj| obj["spec"]["inputs"] = json!([{ "tenant": tenant }]));
        h.reconcile().await.unwrap();
    }
    assert_eq!(h.status().history.len(), 2);
}

/// Prune of team2 with its ConfigMap lookup failing; `next` replaces the inputs.
async fn prune_with_failing_lookup(h: &Harness, next: Json) {
    h.converge().await.unwrap();
    h.events.clear();
    h.edit(|obj| obj["spec"]["inputs"] = next);
    h.store.fail_get_for(&tenant_config("team2"), "etcd timeout");

    assert_eq!(h.reconcile().await.unwrap(), Action::requeue(Duration::from_secs(3600)));
    let status = h.status();
    assert_eq!(h.ready_reason(), reasons::SUCCEEDED);
    assert!(conditions::get(&status.conditions, RECONCILING).is_none());
    assert_eq!(status.last_applied_revision, status.history.latest().map(|e| e.digest.clone()));
    let inventory = status.inventory.unwrap();
    assert!(inventory.contains("team2_tenant-config__ConfigMap"));
    assert!(!inventory.contains("_team2__Namespace"));
    assert!(!h.store.contains(&namespace("team2")));
    assert!(h.store.contains(&tenant_config("team2")));

    let events = h.events.events();
    let prune = events.iter().find(|e| e.reason == REASON_PRUNE_FAILED).expect("prune failure event");
    assert!(matches!(prune.type_, EventType::Warning));
    assert!(prune.message.contains("ConfigMap/team2/tenant-config"));
    let applied = events.iter().find(|e| e.reason == REASON_APPLY_SUCCEEDED).expect("apply event");
    assert!(applied.message.contains("Namespace/team2 deleted"));
    assert!(!applied.message.contains("failed"));

    h.store.clear_failures();
    h.reconcile().await.unwrap();
    let inventory = h.status().inventory.unwrap();
    assert!(!inventory.contains("team2_tenant-config__ConfigMap"));
    assert!(!h.store.contains(&tenant_config("team2")));
}

#[tokio::test]
async fn failed_prune_is_retried_on_the_next_reconcile() {
    let h = Harness::new(two_tenants());
    prune_with_failing_lookup(&h, json!([{ "tenant": "team1" }])).await;
    assert_eq!(h.status().inventory.map(|i| i.len()), Some(2));
}

#[tokio::test]
async fn failed_prune_does_not_fail_the_readiness_wait() {
    let mut spec = two_tenants();
    spec["wait"] = json!(true);
    let config = ReconcilerConfig { wait_interval: Duration::from_millis(20), ..ReconcilerConfig::default() };
    let h = Harness::with_config(spec, config);
    prune_with_failing_lookup(&h, json!([{ "tenant": "team1" }, { "tenant": "team3" }])).await;
    assert_eq!(h.status().inventory.map(|i| i.len()), Some(4));
    assert!(h.store.contains(&tenant_config("team3")));
}

#[tokio::test]
async fn failed_copy_is_recorded_under_the_normalized_digest() {
    let resource = |version: Json| {
        json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {
                "name": "info", "namespace": "apps",
                "labels": { "version": version },
                "annotations": { (meta::COPY_FROM_ANNOTATION): "flux-system/missing" }
            }
        })
    };
    let h = Harness::new(json!({ "resources": [resource(json!(2))] }));
    let err = h.converge().await.unwrap_err();
    assert!(!err.is_terminal());
    assert!(h.store.objects_of_kind("ConfigMap").is_empty());

    h.edit(|obj| obj["spec"]["resources"] = json!([resource(json!("2"))]));
    h.reconcile().await.unwrap_err();
    let history = h.status().history;
    assert_eq!(history.len(), 1);
    assert_eq!(history.latest().unwrap().total_reconciliations, 2);
    assert_eq!(history.latest().unwrap().last_reconciled_status, reasons::FAILED);
}

#[tokio::test]
async fn out_of_range_durations_stall_instead_of_crashing() {
    let h = Harness::new(two_tenants());
    h.edit(|obj| obj["metadata"]["annotations"] = annotations(&[(meta::RECONCILE_EVERY_ANNOTATION, "99999999999999999999h")]));
    assert_eq!(h.converge().await.unwrap(), Action::await_change());
    assert_eq!(h.ready_reason(), reasons::INVALID_CONFIGURATION);
    assert!(conditions::is_true(&h.status().conditions, STALLED));

    h.edit(|obj| obj["metadata"]["annotations"] = annotations(&[(meta::RECONCILE_EVERY_ANNOTATION, "100000h")]));
    assert_eq!(h.reconcile().await.unwrap(), Action::requeue(MAX_REQUEUE_INTERVAL));
    assert_eq!(h.ready_reason(), reasons::SUCCEEDED);
}

#[tokio::test]
async fn dependency_gate_stops_at_first_unmet_dependency() {
    let mut spec = two_tenants();
    spec["dependsOn"] = json!([
        { "apiVersion": "v1", "kind": "ConfigMap", "name": "first", "namespace": "apps" },
        { "apiVersion": "v1", "kind": "ConfigMap", "name": "second", "namespace": "apps" }
    ]);
    let h = Harness::new(spec);
    h.store.insert(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "second", "namespace": "apps" } })).unwrap();

    h.reconcile().await.unwrap();
    h.store.clear_requests();
    assert_eq!(h.reconcile().await.unwrap(), Action::requeue(Duration::from_secs(5)));

    let requests = h.store.requests();
    assert!(requests.contains(&"get ConfigMap/apps/first".to_string()));
    assert!(!requests.contains(&"get ConfigMap/apps/second".to_string()));
    assert!(!requests.iter().any(|r| r.starts_with("apply ")));
    assert_eq!(h.ready_reason(), reasons::DEPENDENCY_NOT_READY);
    let message = conditions::get(&h.status().conditions, READY).unwrap().message.clone();
    assert!(message.contains("ConfigMap/apps/first"));
    assert_eq!(h.events.reasons(), vec![reasons::DEPENDENCY_NOT_READY.to_string()]);

    h.reconcile().await.unwrap();
    assert_eq!(h.events.events().len(), 1);

    h.store.insert(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "first", "namespace": "apps" } })).unwrap();
    h.reconcile().await.unwrap();
    assert_eq!(h.ready_reason(), reasons::SUCCEEDED);
}

#[tokio::test]
async fn ready_expression_gates_on_live_content() {
    let mut spec = two_tenants();
    spec["dependsOn"] = json!([{
        "apiVersion": "v1", "kind": "Namespace", "name": "platform",
        "ready": true, "readyExpr": "status.phase == 'Active'"
    }]);
    let h = Harness::new(spec);
    h.store.insert(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "platform" }, "status": { "phase": "Terminating" } })).unwrap();

    h.converge().await.unwrap();
    assert_eq!(h.ready_reason(), reasons::DEPENDENCY_NOT_READY);

    h.store.set_status(&namespace("platform"), json!({ "phase": "Active" })).unwrap();
    h.reconcile().await.unwrap();
    assert_eq!(h.ready_reason(), reasons::SUCCEEDED);
}

#[tokio::test]
async fn bad_expression_stalls_without_touching_dependencies() {
    let mut spec = two_tenants();
    spec["dependsOn"] = json!([
        { "apiVersion": "v1", "kind": "ConfigMap", "name": "first", "namespace": "apps" },
        { "apiVersion": "v1", "kind": "ConfigMap", "name": "second", "namespace": "apps", "ready": true, "readyExpr": "status.phase ==" }
    ]);
    let h = Harness::new(spec);
    h.reconcile().await.unwrap();
    h.store.clear_requests();

    assert_eq!(h.reconcile().await.unwrap(), Action::await_change());
    assert!(!h.store.requests().iter().any(|r| r.starts_with("get ConfigMap")));
    let status = h.status();
    assert!(conditions::is_true(&status.conditions, STALLED));
    assert_eq!(h.ready_reason(), reasons::INVALID_EXPRESSION);
    assert_eq!(status.history.len(), 1);
    assert_eq!(status.history.latest().unwrap().last_reconciled_status, reasons::INVALID_EXPRESSION);
    assert_eq!(h.events.reasons(), vec![reasons::INVALID_EXPRESSION.to_string()]);
}

#[tokio::test]
async fn broken_template_stalls() {
    let h = Harness::new(json!({
        "inputs": [{ "tenant": "team1" }],
        "resourcesTemplate": "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: << inputs.missing >>\n  namespace: apps\n"
    }));
    assert_eq!(h.converge().await.unwrap(), Action::await_change());
    assert_eq!(h.ready_reason(), reasons::BUILD_FAILED);
    assert!(conditions::is_true(&h.status().conditions, STALLED));
    assert!(h.store.objects_of_kind("ConfigMap").is_empty());

    h.edit(|obj| obj["spec"]["resourcesTemplate"] = json!(TEMPLATE));
    h.reconcile().await.unwrap();
    assert_eq!(h.ready_reason(), reasons::SUCCEEDED);
    assert!(conditions::get(&h.status().conditions, STALLED).is_none());
}

#[tokio::test]
async fn missing_provider_is_retried() {
    let mut spec = two_tenants();
    spec["inputsFrom"] = json!([{ "kind": "ResourceSetInputProvider", "name": "absent" }]);
    let h = Harness::new(spec);
    let err = h.converge().await.unwrap_err();
    assert!(matches!(err, ReconcileError::InputsFetch(_)));
    assert_eq!(h.ready_reason(), reasons::INPUTS_FETCH_FAILED);
    assert!(h.reconciler.retry_after(&h.current()) >= Duration::from_secs(5));
}

#[tokio::test]
async fn finalizer_is_added_first_and_removed_after_pruning() {
    let h = Harness::new(two_tenants());
    assert_eq!(h.reconcile().await.unwrap(), Action::requeue(Duration::ZERO));
    let rs = h.current();
    assert!(rs.has_finalizer());
    assert!(h.store.objects_of_kind("ConfigMap").is_empty());
    assert!(conditions::is_true(&h.status().conditions, RECONCILING));

    h.reconcile().await.unwrap();
    assert_eq!(h.store.objects_of_kind("ConfigMap").len(), 2);

    h.store.delete(&h.key).await.unwrap();
    assert!(h.current().is_deleting());
    assert_eq!(h.reconcile().await.unwrap(), Action::await_change());
    assert!(h.store.objects_of_kind("ConfigMap").is_empty());
    assert!(h.store.objects_of_kind("Namespace").is_empty());
    assert!(!h.store.contains(&h.key));
}

#[tokio::test]
async fn disabled_sets_are_left_alone() {
    let h = Harness::new(two_tenants());
    h.edit(|obj| obj["metadata"]["annotations"] = annotations(&[(meta::RECONCILE_ANNOTATION, meta::DISABLED_VALUE)]));
    assert_eq!(h.converge().await.unwrap(), Action::await_change());
    assert!(h.store.objects_of_kind("ConfigMap").is_empty());

    h.edit(|obj| obj["metadata"]["annotations"] = json!({}));
    h.reconcile().await.unwrap();
    assert_eq!(h.store.objects_of_kind("ConfigMap").len(), 2);

    h.edit(|obj| obj["metadata"]["annotations"] = annotations(&[(meta::RECONCILE_ANNOTATION, meta::DISABLED_VALUE)]));
    h.store.delete(&h.key).await.unwrap();
    h.reconcile().await.unwrap();
    assert!(!h.store.contains(&h.key));
    assert_eq!(h.store.objects_of_kind("ConfigMap").len(), 2);
}

#[tokio::test]
async fn applies_as_the_service_account() {
    let mut spec = two_tenants();
    spec["serviceAccountName"] = json!("deployer");
    let h = Harness::new(spec);
    h.converge().await.unwrap();
    assert_eq!(h.factory.impersonations(), vec!["apps/deployer".to_string()]);

    let config = ReconcilerConfig { default_service_account: Some("flux".into()), ..ReconcilerConfig::default() };
    let h = Harness::with_config(two_tenants(), config);
    h.converge().await.unwrap();
    assert_eq!(h.factory.impersonations(), vec!["apps/flux".to_string()]);
}

#[tokio::test]
async fn requested_at_and_interval_annotations() {
    let h = Harness::new(two_tenants());
    h.edit(|obj| {
        obj["metadata"]["annotations"] = annotations(&[
            (meta::REQUESTED_AT_ANNOTATION, "2024-05-01T10:00:00Z"),
            (meta::RECONCILE_EVERY_ANNOTATION, "0s"),
        ])
    });
    assert_eq!(h.converge().await.unwrap(), Action::await_change());
    assert_eq!(h.status().last_handled_reconcile_at.as_deref(), Some("2024-05-01T10:00:00Z"));

    h.edit(|obj| obj["metadata"]["annotations"][meta::RECONCILE_EVERY_ANNOTATION] = json!("soon"));
    assert_eq!(h.reconcile().await.unwrap(), Action::await_change());
    assert_eq!(h.ready_reason(), reasons::INVALID_CONFIGURATION);
}

#[tokio::test]
async fn wait_reports_not_ready_flux_objects() {
    let config = ReconcilerConfig { wait_interval: Duration::from_millis(20), ..ReconcilerConfig::default() };
    let h = Harness::with_config(
        json!({
            "wait": true,
            "resources": [{
                "apiVersion": "kustomize.toolkit.fluxcd.io/v1",
                "kind": "Kustomization",
                "metadata": { "name": "app", "namespace": "apps" },
                "spec": { "path": "./app", "interval": "10m" }
            }]
        }),
        config,
    );
    h.edit(|obj| obj["metadata"]["annotations"] = annotations(&[(meta::RECONCILE_TIMEOUT_ANNOTATION, "1s")]));
    h.store
        .insert(json!({
            "apiVersion": "kustomize.toolkit.fluxcd.io/v1",
            "kind": "Kustomization",
            "metadata": { "name": "app", "namespace": "apps" },
            "spec": { "path": "./old" },
            "status": { "conditions": [{
                "type": "Ready", "status": "False", "reason": "BuildFailed",
                "message": "kustomization path not found", "lastTransitionTime": "2024-05-01T10:00:00Z"
            }] }
        }))
        .unwrap();

    let err = h.converge().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("timeout waiting for"));
    assert!(message.contains("kustomization path not found"));
    let status = h.status();
    assert_eq!(status.inventory.as_ref().map(|i| i.len()), Some(1));
    assert_eq!(h.ready_reason(), reasons::FAILED);
}
