//! Generic readiness of arbitrary objects, modelled on kstatus.

use std::fmt;

use rset_core::Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStatus {
    Current,
    InProgress,
    Failed,
    Terminating,
    NotFound,
    Unknown,
}

impl fmt::Display for ObjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectStatus::Current => "Current",
            ObjectStatus::InProgress => "InProgress",
            ObjectStatus::Failed => "Failed",
            ObjectStatus::Terminating => "Terminating",
            ObjectStatus::NotFound => "NotFound",
            ObjectStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResult {
    pub status: ObjectStatus,
    pub message: String,
}

impl StatusResult {
    fn new(status: ObjectStatus, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn current() -> Self {
        Self::new(ObjectStatus::Current, "Resource is current")
    }
}

fn int(obj: &Json, path: &[&str]) -> Option<i64> {
    let mut cur = obj;
    for p in path {
        cur = cur.get(*p)?;
    }
    cur.as_i64()
}

fn str_at<'a>(obj: &'a Json, path: &[&str]) -> Option<&'a str> {
    let mut cur = obj;
    for p in path {
        cur = cur.get(*p)?;
    }
    cur.as_str()
}

fn condition<'a>(obj: &'a Json, type_: &str) -> Option<&'a Json> {
    obj.get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_))
}

fn condition_status<'a>(obj: &'a Json, type_: &str) -> Option<&'a str> {
    condition(obj, type_)?.get("status")?.as_str()
}

fn condition_message(obj: &Json, type_: &str) -> String {
    condition(obj, type_)
        .and_then(|c| c.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Compute the readiness of a live object.
pub fn compute_status(obj: &Json) -> StatusResult {
    if obj.get("metadata").and_then(|m| m.get("deletionTimestamp")).map_or(false, |v| !v.is_null()) {
        return StatusResult::new(ObjectStatus::Terminating, "Resource scheduled for deletion");
    }

    let generation = int(obj, &["metadata", "generation"]);
    let observed = int(obj, &["status", "observedGeneration"]);
    if let (Some(g), Some(o)) = (generation, observed) {
        if o < g {
            return StatusResult::new(ObjectStatus::InProgress, format!("Generation {} not yet observed (at {})", g, o));
        }
    }

    let api_version = str_at(obj, &["apiVersion"]).unwrap_or_default();
    let kind = str_at(obj, &["kind"]).unwrap_or_default();
    match (api_version, kind) {
        ("apps/v1", "Deployment") => deployment(obj),
        ("apps/v1", "StatefulSet") => statefulset(obj),
        ("apps/v1", "DaemonSet") => daemonset(obj),
        ("v1", "Pod") => pod(obj),
        ("batch/v1", "Job") => job(obj),
        ("v1", "PersistentVolumeClaim") => pvc(obj),
        ("apiextensions.k8s.io/v1", "CustomResourceDefinition") => crd(obj),
        _ => generic(obj),
    }
}

fn replicas(obj: &Json) -> i64 {
    int(obj, &["spec", "replicas"]).unwrap_or(1)
}

fn deployment(obj: &Json) -> StatusResult {
    if obj.get("status").is_none() {
        return StatusResult::new(ObjectStatus::InProgress, "Deployment has no status yet");
    }
    if condition_status(obj, "Progressing") == Some("False") {
        return StatusResult::new(ObjectStatus::Failed, condition_message(obj, "Progressing"));
    }
    let want = replicas(obj);
    let updated = int(obj, &["status", "updatedReplicas"]).unwrap_or(0);
    let available = int(obj, &["status", "availableReplicas"]).unwrap_or(0);
    let total = int(obj, &["status", "replicas"]).unwrap_or(0);
    if updated < want {
        return StatusResult::new(ObjectStatus::InProgress, format!("Updated: {}/{}", updated, want));
    }
    if total > updated {
        return StatusResult::new(ObjectStatus::InProgress, format!("Pending termination: {}", total - updated));
    }
    if available < want {
        return StatusResult::new(ObjectStatus::InProgress, format!("Available: {}/{}", available, want));
    }
    StatusResult::new(ObjectStatus::Current, format!("Deployment is available. Replicas: {}", available))
}

fn statefulset(obj: &Json) -> StatusResult {
    let want = replicas(obj);
    let ready = int(obj, &["status", "readyReplicas"]).unwrap_or(0);
    let current = int(obj, &["status", "currentReplicas"]).unwrap_or(0);
    if ready < want {
        return StatusResult::new(ObjectStatus::InProgress, format!("Ready: {}/{}", ready, want));
    }
    let current_rev = str_at(obj, &["status", "currentRevision"]);
    let update_rev = str_at(obj, &["status", "updateRevision"]);
    if current_rev != update_rev || current < want {
        return StatusResult::new(ObjectStatus::InProgress, "Rolling update in progress");
    }
    StatusResult::new(ObjectStatus::Current, format!("All replicas scheduled as expected. Replicas: {}", ready))
}

fn daemonset(obj: &Json) -> StatusResult {
    let desired = int(obj, &["status", "desiredNumberScheduled"]);
    let Some(desired) = desired else {
        return StatusResult::new(ObjectStatus::InProgress, "DaemonSet has no status yet");
    };
    let updated = int(obj, &["status", "updatedNumberScheduled"]).unwrap_or(0);
    let available = int(obj, &["status", "numberAvailable"]).unwrap_or(0);
    if updated < desired || available < desired {
        return StatusResult::new(ObjectStatus::InProgress, format!("Available: {}/{}", available, desired));
    }
    StatusResult::new(ObjectStatus::Current, format!("All replicas scheduled as expected. Replicas: {}", desired))
}

fn pod(obj: &Json) -> StatusResult {
    match str_at(obj, &["status", "phase"]) {
        Some("Succeeded") => StatusResult::new(ObjectStatus::Current, "Pod has completed successfully"),
        Some("Failed") => StatusResult::new(ObjectStatus::Failed, "Pod has failed"),
        Some("Running") if condition_status(obj, "Ready") == Some("True") => StatusResult::new(ObjectStatus::Current, "Pod is Ready"),
        Some(phase) => StatusResult::new(ObjectStatus::InProgress, format!("Pod phase is {}", phase)),
        None => StatusResult::new(ObjectStatus::InProgress, "Pod has not been scheduled"),
    }
}

fn job(obj: &Json) -> StatusResult {
    if condition_status(obj, "Failed") == Some("True") {
        return StatusResult::new(ObjectStatus::Failed, condition_message(obj, "Failed"));
    }
    if condition_status(obj, "Complete") == Some("True") {
        return StatusResult::new(ObjectStatus::Current, "Job Completed");
    }
    StatusResult::new(ObjectStatus::InProgress, "Job in progress")
}

fn pvc(obj: &Json) -> StatusResult {
    match str_at(obj, &["status", "phase"]) {
        Some("Bound") => StatusResult::new(ObjectStatus::Current, "PVC is Bound"),
        phase => StatusResult::new(ObjectStatus::InProgress, format!("PVC is not Bound. phase: {}", phase.unwrap_or("Pending"))),
    }
}

fn crd(obj: &Json) -> StatusResult {
    if condition_status(obj, "NamesAccepted") == Some("False") {
        return StatusResult::new(ObjectStatus::Failed, condition_message(obj, "NamesAccepted"));
    }
    if condition_status(obj, "Established") == Some("True") {
        return StatusResult::current();
    }
    StatusResult::new(ObjectStatus::InProgress, "CRD is not established")
}

/// Objects without a kind-specific rule: Ready/Stalled/Reconciling
/// conditions when present, otherwise current once they exist.
fn generic(obj: &Json) -> StatusResult {
    if condition_status(obj, "Stalled") == Some("True") {
        return StatusResult::new(ObjectStatus::Failed, condition_message(obj, "Stalled"));
    }
    if condition_status(obj, "Reconciling") == Some("True") {
        return StatusResult::new(ObjectStatus::InProgress, condition_message(obj, "Reconciling"));
    }
    match condition_status(obj, "Ready") {
        Some("True") | None => StatusResult::current(),
        Some("False") => StatusResult::new(ObjectStatus::InProgress, condition_message(obj, "Ready")),
        Some(_) => StatusResult::new(ObjectStatus::Unknown, condition_message(obj, "Ready")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deployment_progression() {
        let mut d = json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "web", "generation": 2 },
            "spec": { "replicas": 2 },
            "status": { "observedGeneration": 1 }
        });
        assert_eq!(compute_status(&d).status, ObjectStatus::InProgress);
        d["status"] = json!({ "observedGeneration": 2, "replicas": 2, "updatedReplicas": 2, "availableReplicas": 1 });
        assert_eq!(compute_status(&d).status, ObjectStatus::InProgress);
        d["status"]["availableReplicas"] = json!(2);
        assert_eq!(compute_status(&d).status, ObjectStatus::Current);
    }

    #[test]
    fn generic_objects_follow_conditions() {
        let cm = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a" } });
        assert_eq!(compute_status(&cm).status, ObjectStatus::Current);

        let stalled = json!({
            "apiVersion": "fluxcd.controlplane.io/v1", "kind": "ResourceSet",
            "metadata": { "name": "a" },
            "status": { "conditions": [ { "type": "Stalled", "status": "True", "message": "bad input" } ] }
        });
        let res = compute_status(&stalled);
        assert_eq!(res.status, ObjectStatus::Failed);
        assert_eq!(res.message, "bad input");
    }

    #[test]
    fn terminating_wins() {
        let obj = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a", "deletionTimestamp": "2024-01-01T00:00:00Z" } });
        assert_eq!(compute_status(&obj).status, ObjectStatus::Terminating);
    }
}
