//! Kinst kubehub: cluster clients behind the [`ResourceClient`] seam.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use kinst_core::{ClientError, Resource, ResourceClient, ResourceKey};

mod memory;

pub use memory::MemoryClient;

type GvkTriple = (String, String, String);

/// [`ResourceClient`] backed by the kube-rs dynamic API.
///
/// API resources are resolved through discovery and cached per GVK; a miss
/// re-runs discovery so kinds registered mid-pass (fresh CRDs) are picked up.
pub struct KubeClient {
    client: Client,
    field_manager: String,
    resources: Mutex<HashMap<GvkTriple, (ApiResource, bool)>>,
}

impl KubeClient {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into(), resources: Mutex::new(HashMap::new()) }
    }

    /// Connect using the ambient kubeconfig or in-cluster config.
    pub async fn try_default(field_manager: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, field_manager))
    }

    async fn find_api_resource(&self, key: &ResourceKey) -> Result<Option<(ApiResource, bool)>, ClientError> {
        let gvk: GvkTriple = (key.group.clone(), key.version.clone(), key.kind.clone());
        let mut cache = self.resources.lock().await;
        if let Some(found) = cache.get(&gvk) {
            return Ok(Some(found.clone()));
        }
        let started = std::time::Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await
            .map_err(|e| ClientError::Other(anyhow!("discovery failed: {}", e)))?;
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    cache.insert((ar.group.clone(), ar.version.clone(), ar.kind.clone()), (ar, namespaced));
                }
            }
        }
        histogram!("kinst_discovery_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(kinds = cache.len(), "discovery refreshed");
        Ok(cache.get(&gvk).cloned())
    }

    async fn api_for(&self, key: &ResourceKey) -> Result<Option<Api<DynamicObject>>, ClientError> {
        let Some((ar, namespaced)) = self.find_api_resource(key).await? else {
            return Ok(None);
        };
        let api = if namespaced {
            match key.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::default_namespaced_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(Some(api))
    }
}

#[async_trait]
impl ResourceClient for KubeClient {
    async fn get(&self, resource: &Resource) -> Result<Resource, ClientError> {
        let key = resource.key();
        // An unserved kind cannot have live objects.
        let Some(api) = self.api_for(key).await? else {
            return Err(ClientError::NotFound(key.clone()));
        };
        let obj = api.get(&key.name).await.map_err(|e| map_kube_error(key, e))?;
        to_resource(obj, key)
    }

    async fn apply(&self, resource: &Resource) -> Result<Resource, ClientError> {
        let key = resource.key();
        let Some(api) = self.api_for(key).await? else {
            return Err(ClientError::Unsupported(key.gvk_key()));
        };
        let started = std::time::Instant::now();
        let pp = PatchParams::apply(&self.field_manager).force();
        let obj = match api.patch(&key.name, &pp, &Patch::Apply(resource.object())).await {
            Ok(o) => o,
            Err(e) => {
                counter!("kinst_kube_apply_err_total", 1u64);
                return Err(map_kube_error(key, e));
            }
        };
        histogram!("kinst_kube_apply_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(resource = %key, rv = ?obj.metadata.resource_version, "server-side apply ok");
        to_resource(obj, key)
    }

    async fn delete(&self, resource: &Resource) -> Result<(), ClientError> {
        let key = resource.key();
        let Some(api) = self.api_for(key).await? else {
            warn!(resource = %key, "kind no longer served; treating as deleted");
            return Err(ClientError::NotFound(key.clone()));
        };
        api.delete(&key.name, &DeleteParams::background()).await.map_err(|e| map_kube_error(key, e))?;
        info!(resource = %key, "deleted");
        Ok(())
    }
}

fn map_kube_error(key: &ResourceKey, e: kube::Error) -> ClientError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ClientError::NotFound(key.clone()),
        kube::Error::Api(ae) => ClientError::Api { key: key.clone(), code: ae.code, message: ae.message },
        other => ClientError::Other(anyhow::Error::new(other).context(key.to_string())),
    }
}

/// Convert a live object back into a resource, filling type meta from the
/// request key when the server omits it.
fn to_resource(obj: DynamicObject, key: &ResourceKey) -> Result<Resource, ClientError> {
    let mut raw = serde_json::to_value(&obj).map_err(|e| ClientError::Other(e.into()))?;
    if let Some(map) = raw.as_object_mut() {
        map.entry("apiVersion").or_insert_with(|| serde_json::Value::String(key.api_version()));
        map.entry("kind").or_insert_with(|| serde_json::Value::String(key.kind.clone()));
    }
    Resource::from_json(raw).map_err(|e| ClientError::Other(anyhow!("decoding live {}: {}", key, e)))
}
