//! kube-runtime wiring: watch ResourceSets and the input providers they read.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use rset_core::crd::{ResourceSet, ResourceSetInputProvider};
use rset_inputs::PROVIDER_KIND;

use crate::error::ReconcileError;
use crate::reconciler::Reconciler;

/// Server-side watch timeout; below the client read timeout.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Whether `rs` reads its inputs from `provider`, by name or by selector.
pub fn references_provider(rs: &ResourceSet, provider: &ResourceSetInputProvider) -> bool {
    if rs.namespace() != provider.namespace() {
        return false;
    }
    let name = provider.name_any();
    rs.spec.inputs_from.iter().any(|r| {
        r.kind == PROVIDER_KIND
            && match (&r.name, &r.selector) {
                (Some(n), _) => *n == name,
                (None, Some(selector)) => selector.validate().is_ok() && selector.matches(provider.labels()),
                (None, None) => false,
            }
    })
}

async fn reconcile(rs: Arc<ResourceSet>, ctx: Arc<Reconciler>) -> Result<Action, ReconcileError> {
    ctx.reconcile(&rs).await
}

fn error_policy(rs: Arc<ResourceSet>, err: &ReconcileError, ctx: Arc<Reconciler>) -> Action {
    if err.is_terminal() {
        return Action::await_change();
    }
    let delay = ctx.retry_after(&rs);
    debug!(name = %rs.name_any(), namespace = %rs.namespace().unwrap_or_default(), retry_in = ?delay, "requeue after failure");
    Action::requeue(delay)
}

/// Run the ResourceSet controller until a shutdown signal arrives.
pub async fn run(client: Client, reconciler: Arc<Reconciler>) -> Result<()> {
    let sets: Api<ResourceSet> = Api::all(client.clone());
    let providers: Api<ResourceSetInputProvider> = Api::all(client);
    sets.list(&ListParams::default().limit(1)).await.context("ResourceSet CRD is not installed")?;

    let wc = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    let controller = Controller::new(sets, wc.clone());
    let cache = controller.store();
    info!(field_manager = %reconciler.config().field_manager, "starting ResourceSet controller");

    controller
        .watches(providers, wc, move |provider: ResourceSetInputProvider| {
            cache
                .state()
                .into_iter()
                .filter(|rs| references_provider(rs, &provider))
                .map(|rs| ObjectRef::from_obj(rs.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(object = %obj, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile loop error"),
            }
        })
        .await;
    info!("ResourceSet controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rset_core::crd::{InputProviderRef, ResourceSetInputProviderSpec, ResourceSetSpec};
    use rset_core::meta;
    use rset_core::selector::LabelSelector;

    fn provider(name: &str, team: &str) -> ResourceSetInputProvider {
        let mut p = ResourceSetInputProvider::new(name, ResourceSetInputProviderSpec { type_: "Static".into(), ..Default::default() });
        p.metadata.namespace = Some("apps".into());
        p.metadata.labels = Some([("team".to_string(), team.to_string())].into());
        p
    }

    fn rs_with(refs: Vec<InputProviderRef>) -> ResourceSet {
        let mut rs = ResourceSet::new("apps", ResourceSetSpec { inputs_from: refs, ..Default::default() });
        rs.metadata.namespace = Some("apps".into());
        rs
    }

    #[test]
    fn providers_map_to_referencing_sets() {
        let by_name = InputProviderRef { api_version: meta::API_VERSION.into(), kind: PROVIDER_KIND.into(), name: Some("tenants".into()), selector: None };
        let mut selector = LabelSelector::default();
        selector.match_labels.insert("team".into(), "blue".into());
        let by_label = InputProviderRef { api_version: meta::API_VERSION.into(), kind: PROVIDER_KIND.into(), name: None, selector: Some(selector) };

        assert!(references_provider(&rs_with(vec![by_name.clone()]), &provider("tenants", "red")));
        assert!(!references_provider(&rs_with(vec![by_name]), &provider("envs", "red")));
        assert!(references_provider(&rs_with(vec![by_label.clone()]), &provider("envs", "blue")));
        assert!(!references_provider(&rs_with(vec![by_label.clone()]), &provider("envs", "red")));

        let mut elsewhere = provider("envs", "blue");
        elsewhere.metadata.namespace = Some("other".into());
        assert!(!references_provider(&rs_with(vec![by_label]), &elsewhere));
    }
}
