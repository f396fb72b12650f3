//! Dependency gate: every `dependsOn` entry must exist, and be ready when asked.

use tracing::debug;

use rset_core::crd::Dependency;
use rset_kubehub::{compute_status, is_not_found, ClusterStore, ObjectStatus};
use rset_template::{CompiledExpr, ExprEngine};

use crate::error::ReconcileError;

/// Compile every readiness expression up front, then check dependencies in
/// declared order and stop at the first one that is not satisfied.
///
/// A bad expression is a terminal `InvalidExpression`; an unmet dependency
/// is a transient `DependencyNotReady` naming it.
pub async fn check_dependencies(
    store: &dyn ClusterStore,
    engine: &dyn ExprEngine,
    deps: &[Dependency],
) -> Result<(), ReconcileError> {
    let mut compiled: Vec<Option<Box<dyn CompiledExpr>>> = Vec::with_capacity(deps.len());
    for dep in deps {
        let expr = match dep.ready_expr.as_deref().filter(|e| dep.ready && !e.trim().is_empty()) {
            Some(e) => Some(engine.compile(e).map_err(|err| {
                ReconcileError::InvalidExpression(format!("failed to compile readyExpr of {}: {:#}", dep.key(), err))
            })?),
            None => None,
        };
        compiled.push(expr);
    }

    for (dep, expr) in deps.iter().zip(compiled.iter()) {
        let key = dep.key();
        let live = match store.get(&key).await {
            Ok(Some(live)) => live,
            Ok(None) => return Err(ReconcileError::DependencyNotReady(format!("dependency {} not found", key))),
            Err(e) if is_not_found(&e) => {
                return Err(ReconcileError::DependencyNotReady(format!("dependency {} not found: {:#}", key, e)))
            }
            Err(e) => return Err(ReconcileError::DependencyNotReady(format!("dependency {} fetch failed: {:#}", key, e))),
        };
        if !dep.ready {
            continue;
        }
        match expr {
            Some(expr) => match expr.evaluate_bool(&live) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(ReconcileError::DependencyNotReady(format!("dependency {} not ready: expression evaluated to false", key)))
                }
                Err(e) => {
                    return Err(ReconcileError::DependencyNotReady(format!("dependency {} not ready: {:#}", key, e)))
                }
            },
            None => {
                let res = compute_status(&live);
                if res.status != ObjectStatus::Current {
                    return Err(ReconcileError::DependencyNotReady(format!(
                        "dependency {} not ready: status '{}': {}",
                        key, res.status, res.message
                    )));
                }
            }
        }
        debug!(dependency = %key, "dependency satisfied");
    }
    Ok(())
}
