use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client, Config,
};
use rustc_hash::FxHashMap;
use tracing::debug;

use rset_core::object::ObjectKey;
use rset_core::selector::LabelSelector;
use rset_core::Json;

use crate::{ApplyParams, ClusterStore, StoreError, StoreFactory};

type ResourceCache = Arc<Mutex<FxHashMap<String, (ApiResource, bool)>>>;

/// `ClusterStore` backed by a kube-rs client. API resources are resolved
/// once per GVK and cached for the lifetime of the store.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    resources: ResourceCache,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, resources: Arc::new(Mutex::new(FxHashMap::default())) }
    }

    fn with_cache(client: Client, resources: ResourceCache) -> Self {
        Self { client, resources }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn find_api_resource(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool)> {
        let (group, version) = rset_core::object::split_api_version(api_version);
        let gvk = GroupVersionKind { group, version, kind: kind.to_string() };
        let cache_key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(hit) = self.resources.lock().ok().and_then(|m| m.get(&cache_key).cloned()) {
            return Ok(hit);
        }
        let (ar, caps) = match discovery::pinned_kind(&self.client, &gvk).await {
            Ok(found) => found,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(StoreError::UnknownKind(format!("{}/{}", api_version, kind)).into())
            }
            Err(e) => return Err(e).with_context(|| format!("discovering {}/{}", api_version, kind)),
        };
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(gvk = %cache_key, namespaced, "api resource resolved");
        if let Ok(mut m) = self.resources.lock() {
            m.insert(cache_key, (ar.clone(), namespaced));
        }
        Ok((ar, namespaced))
    }

    async fn api_for(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(api_version, kind).await?;
        let api = if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }

    async fn api_for_key(&self, key: &ObjectKey) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(&key.api_version(), &key.kind).await?;
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        let ns = key.namespace.as_deref().ok_or_else(|| StoreError::NamespaceRequired(key.gvk_key()))?;
        Ok(Api::namespaced_with(self.client.clone(), ns, &ar))
    }
}

fn to_json(obj: DynamicObject) -> Result<Json> {
    serde_json::to_value(obj).context("serializing DynamicObject")
}

fn map_apply_error(key: &ObjectKey, err: kube::Error) -> anyhow::Error {
    match err {
        kube::Error::Api(ae) if ae.code == 422 && ae.message.contains("immutable") => {
            StoreError::Immutable { key: key.to_string(), message: ae.message }.into()
        }
        other => anyhow::Error::new(other).context(format!("applying {}", key)),
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>> {
        let api = self.api_for_key(key).await?;
        match api.get_opt(&key.name).await.with_context(|| format!("getting {}", key))? {
            Some(obj) => Ok(Some(to_json(obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, api_version: &str, kind: &str, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Json>> {
        let api = self.api_for(api_version, kind, namespace).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() {
            lp = lp.labels(&selector.to_query()?);
        }
        let list = api.list(&lp).await.with_context(|| format!("listing {}/{}", api_version, kind))?;
        list.items.into_iter().map(to_json).collect()
    }

    async fn apply(&self, obj: &Json, params: &ApplyParams) -> Result<Json> {
        let key = ObjectKey::from_object(obj)?;
        let api = self.api_for_key(&key).await?;
        let mut pp = PatchParams::apply(&params.field_manager);
        if params.force {
            pp = pp.force();
        }
        if params.dry_run {
            pp = pp.dry_run();
        }
        let out = api.patch(&key.name, &pp, &Patch::Apply(obj)).await.map_err(|e| map_apply_error(&key, e))?;
        to_json(out)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        let api = self.api_for_key(key).await?;
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e).with_context(|| format!("deleting {}", key)),
        }
    }

    async fn patch_merge(&self, key: &ObjectKey, patch: &Json) -> Result<Json> {
        let api = self.api_for_key(key).await?;
        let out = api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .with_context(|| format!("patching {}", key))?;
        to_json(out)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Json) -> Result<Json> {
        let api = self.api_for_key(key).await?;
        let out = api
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .with_context(|| format!("patching status of {}", key))?;
        to_json(out)
    }
}

/// Builds impersonating clients from the operator's own kubeconfig.
pub struct KubeStoreFactory {
    config: Config,
    operator: Arc<KubeStore>,
    cache: ResourceCache,
}

impl KubeStoreFactory {
    pub async fn infer() -> Result<Self> {
        let config = Config::infer().await.context("loading kube config")?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let client = Client::try_from(config.clone()).context("building kube client")?;
        let cache: ResourceCache = Arc::new(Mutex::new(FxHashMap::default()));
        let operator = Arc::new(KubeStore::with_cache(client, cache.clone()));
        Ok(Self { config, operator, cache })
    }

    pub fn client(&self) -> Client {
        self.operator.client().clone()
    }
}

#[async_trait]
impl StoreFactory for KubeStoreFactory {
    fn operator(&self) -> Arc<dyn ClusterStore> {
        self.operator.clone()
    }

    async fn impersonate(&self, namespace: &str, service_account: Option<&str>) -> Result<Arc<dyn ClusterStore>> {
        let Some(sa) = service_account.filter(|s| !s.is_empty()) else {
            return Ok(self.operator.clone());
        };
        let mut config = self.config.clone();
        config.auth_info.impersonate = Some(format!("system:serviceaccount:{}:{}", namespace, sa));
        let client = Client::try_from(config).with_context(|| format!("building client for {}/{}", namespace, sa))?;
        Ok(Arc::new(KubeStore::with_cache(client, self.cache.clone())))
    }
}
