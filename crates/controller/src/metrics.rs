use std::time::Duration;

use metrics::{counter, histogram};

/// Record one reconcile outcome; `result` is `success`, `stalled`,
/// `dependency`, `error` or `disabled`.
pub fn record_reconcile(namespace: &str, result: &'static str, elapsed: Duration) {
    counter!("resourceset_reconcile_total", 1, "namespace" => namespace.to_string(), "result" => result);
    histogram!("resourceset_reconcile_duration_ms", elapsed.as_secs_f64() * 1000.0);
}
