//! Manifest: an ordered, identity-deduplicated set of resources.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, info};

use crate::{yaml, ManifestError, Resource, ResourceClient, ResourceKey};

/// An ordered set of resources with an optional client handle.
///
/// Read operations (`filter`, `transform`, `append`) return new manifests and
/// carry the receiver's client along. No two resources share a key.
#[derive(Clone, Default)]
pub struct Manifest {
    resources: Vec<Resource>,
    client: Option<Arc<dyn ResourceClient>>,
}

impl fmt::Debug for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifest")
            .field("resources", &self.resources.iter().map(|r| r.key().to_string()).collect::<Vec<_>>())
            .field("client", &self.client.is_some())
            .finish()
    }
}

impl Manifest {
    pub fn new() -> Self { Self::default() }

    /// Build from resources; a later resource with an already-seen key
    /// replaces the earlier one in place.
    pub fn from_resources<I: IntoIterator<Item = Resource>>(resources: I) -> Self {
        let mut m = Self::new();
        m.merge(resources);
        m
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ManifestError> {
        Ok(Self::from_resources(yaml::parse_resources(yaml)?))
    }

    /// Load a file or a directory of manifest files.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        Ok(Self::from_resources(yaml::load_path(path.as_ref())?))
    }

    pub fn with_client(mut self, client: Arc<dyn ResourceClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn client(&self) -> Option<&Arc<dyn ResourceClient>> { self.client.as_ref() }

    pub fn resources(&self) -> &[Resource] { &self.resources }
    pub fn len(&self) -> usize { self.resources.len() }
    pub fn is_empty(&self) -> bool { self.resources.is_empty() }

    pub fn keys(&self) -> HashSet<ResourceKey> {
        self.resources.iter().map(|r| r.key().clone()).collect()
    }

    /// Identity-key union: resources of `other` replace same-keyed entries of
    /// `self` in place, the rest are appended in order.
    pub fn append(&self, other: &Manifest) -> Manifest {
        let mut out = self.clone();
        out.merge(other.resources.iter().cloned());
        out
    }

    pub fn filter<P>(&self, pred: P) -> Manifest
    where
        P: Fn(&Resource) -> bool,
    {
        Manifest {
            resources: self.resources.iter().filter(|r| pred(r)).cloned().collect(),
            client: self.client.clone(),
        }
    }

    /// Rewrite every resource through `f`. Keys changed by the rewrite are
    /// deduplicated again, later entries winning.
    pub fn transform<F>(&self, f: F) -> Result<Manifest, ManifestError>
    where
        F: Fn(&mut Resource) -> Result<(), ManifestError>,
    {
        let mut rewritten = Vec::with_capacity(self.resources.len());
        for r in &self.resources {
            let mut r = r.clone();
            f(&mut r)?;
            rewritten.push(r);
        }
        let mut out = Manifest { resources: Vec::new(), client: self.client.clone() };
        out.merge(rewritten);
        Ok(out)
    }

    /// Create or update every resource through the associated client, in
    /// manifest order. Stops at the first failure.
    pub async fn apply(&self) -> Result<(), ManifestError> {
        let client = self.client.as_ref().ok_or(ManifestError::NoClient)?;
        for r in &self.resources {
            debug!(resource = %r.key(), "applying");
            if let Err(e) = client.apply(r).await {
                counter!("kinst_apply_err_total", 1u64);
                return Err(e.into());
            }
            counter!("kinst_apply_total", 1u64);
        }
        info!(count = self.resources.len(), "manifest applied");
        Ok(())
    }

    fn merge<I: IntoIterator<Item = Resource>>(&mut self, resources: I) {
        let mut index: HashMap<ResourceKey, usize> = self.resources.iter().enumerate()
            .map(|(i, r)| (r.key().clone(), i))
            .collect();
        for r in resources {
            match index.get(r.key()) {
                Some(&i) => self.resources[i] = r,
                None => {
                    index.insert(r.key().clone(), self.resources.len());
                    self.resources.push(r);
                }
            }
        }
    }
}

/// Filter predicates, composable with [`not`] and chained `filter` calls.
pub mod predicates {
    use std::collections::HashSet;

    use crate::{Manifest, Resource, ResourceKey};

    pub const CRD_KIND: &str = "CustomResourceDefinition";

    pub fn by_kind(kind: &str) -> impl Fn(&Resource) -> bool + '_ {
        move |r| r.kind() == kind
    }

    pub fn by_name(name: &str) -> impl Fn(&Resource) -> bool + '_ {
        move |r| r.name() == name
    }

    pub fn by_group(group: &str) -> impl Fn(&Resource) -> bool + '_ {
        move |r| r.group() == group
    }

    pub fn crds(r: &Resource) -> bool { r.kind() == CRD_KIND }

    pub fn no_crds(r: &Resource) -> bool { !crds(r) }

    /// Matches resources whose key is present in `manifest` (contents ignored).
    pub fn in_manifest(manifest: &Manifest) -> impl Fn(&Resource) -> bool {
        let keys: HashSet<ResourceKey> = manifest.keys();
        move |r| keys.contains(r.key())
    }

    pub fn not<P: Fn(&Resource) -> bool>(pred: P) -> impl Fn(&Resource) -> bool {
        move |r| !pred(r)
    }
}
