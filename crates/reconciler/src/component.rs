//! Installable components: the desired-state objects driving a pass.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kinst_core::{Manifest, Resource};

/// User-supplied overrides for an install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Pinned manifest version; the newest available one when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Explicit manifest sources, replacing the versioned data directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<PathBuf>,
    /// Extra sources appended after the target manifest.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_manifests: Vec<PathBuf>,
}

/// What the last successful pass installed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
    /// The resources as they were applied. Sources may change on disk
    /// after the fact, so this is what pruning compares against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<Vec<Resource>>,
}

impl ComponentStatus {
    pub fn mark_installed(&mut self, version: Option<String>, manifests: Vec<PathBuf>, applied: &Manifest, at: DateTime<Utc>) {
        self.version = version;
        self.manifests = manifests;
        self.applied = Some(applied.resources().to_vec());
        self.installed_at = Some(at);
    }

    pub fn is_installed(&self) -> bool { self.installed_at.is_some() }
}

/// Capability set shared by every installable variant.
pub trait Component: Send + Sync + fmt::Debug {
    /// Variant name, e.g. `Serving`.
    fn kind(&self) -> &'static str;
    /// Sub-directory of the data root holding this variant's versions.
    fn manifest_dir(&self) -> &'static str;
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn spec(&self) -> &ComponentSpec;
    fn status(&self) -> &ComponentStatus;
    fn status_mut(&mut self) -> &mut ComponentStatus;

    /// Stable identity used for installed history, `Kind/namespace/name`.
    fn key(&self) -> String {
        format!("{}/{}/{}", self.kind(), self.namespace(), self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Serving {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub spec: ComponentSpec,
    #[serde(default)]
    pub status: ComponentStatus,
}

impl Serving {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into(), ..Default::default() }
    }
}

impl Component for Serving {
    fn kind(&self) -> &'static str { "Serving" }
    fn manifest_dir(&self) -> &'static str { "serving" }
    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> &str { &self.namespace }
    fn spec(&self) -> &ComponentSpec { &self.spec }
    fn status(&self) -> &ComponentStatus { &self.status }
    fn status_mut(&mut self) -> &mut ComponentStatus { &mut self.status }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eventing {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub spec: ComponentSpec,
    #[serde(default)]
    pub status: ComponentStatus,
}

impl Eventing {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into(), ..Default::default() }
    }
}

impl Component for Eventing {
    fn kind(&self) -> &'static str { "Eventing" }
    fn manifest_dir(&self) -> &'static str { "eventing" }
    fn name(&self) -> &str { &self.name }
    fn namespace(&self) -> &str { &self.namespace }
    fn spec(&self) -> &ComponentSpec { &self.spec }
    fn status(&self) -> &ComponentStatus { &self.status }
    fn status_mut(&mut self) -> &mut ComponentStatus { &mut self.status }
}
