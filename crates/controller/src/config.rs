use std::time::Duration;

/// Operator-wide reconciler settings; per-object overrides come from annotations.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Field manager for server-side apply.
    pub field_manager: String,
    /// Service account impersonated when a ResourceSet names none.
    pub default_service_account: Option<String>,
    /// Fixed requeue delay while a dependency is not ready.
    pub requeue_dependency: Duration,
    /// Distinct digests kept in `status.history`.
    pub history_limit: usize,
    pub default_interval: Duration,
    pub default_timeout: Duration,
    /// Poll interval of readiness and termination waits.
    pub wait_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            field_manager: "flux-operator".into(),
            default_service_account: None,
            requeue_dependency: Duration::from_secs(5),
            history_limit: 5,
            default_interval: Duration::from_secs(3600),
            default_timeout: Duration::from_secs(300),
            wait_interval: Duration::from_secs(2),
        }
    }
}
