//! In-memory cluster for exercising passes without an API server.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use kinst_core::{ClientError, Resource, ResourceClient, ResourceKey};

/// A [`ResourceClient`] holding objects in a map keyed by identity.
///
/// Delete failures can be injected per key to exercise error paths.
#[derive(Default)]
pub struct MemoryClient {
    objects: Mutex<BTreeMap<ResourceKey, Resource>>,
    delete_failures: Mutex<HashMap<ResourceKey, (u16, String)>>,
    deletes: AtomicUsize,
}

impl MemoryClient {
    pub fn new() -> Self { Self::default() }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        lock(&self.objects).contains_key(key)
    }

    pub fn len(&self) -> usize { lock(&self.objects).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn objects(&self) -> Vec<Resource> {
        lock(&self.objects).values().cloned().collect()
    }

    /// Number of delete calls received, successful or not.
    pub fn delete_calls(&self) -> usize { self.deletes.load(Ordering::Relaxed) }

    /// Make every delete of `key` fail with an API error.
    pub fn fail_deletes(&self, key: ResourceKey, code: u16, message: impl Into<String>) {
        lock(&self.delete_failures).insert(key, (code, message.into()));
    }

    pub fn clear_failures(&self) {
        lock(&self.delete_failures).clear();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ResourceClient for MemoryClient {
    async fn get(&self, resource: &Resource) -> Result<Resource, ClientError> {
        lock(&self.objects)
            .get(resource.key())
            .cloned()
            .ok_or_else(|| ClientError::NotFound(resource.key().clone()))
    }

    async fn apply(&self, resource: &Resource) -> Result<Resource, ClientError> {
        lock(&self.objects).insert(resource.key().clone(), resource.clone());
        Ok(resource.clone())
    }

    async fn delete(&self, resource: &Resource) -> Result<(), ClientError> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let key = resource.key();
        if let Some((code, message)) = lock(&self.delete_failures).get(key).cloned() {
            return Err(ClientError::Api { key: key.clone(), code, message });
        }
        match lock(&self.objects).remove(key) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(key.clone())),
        }
    }
}
