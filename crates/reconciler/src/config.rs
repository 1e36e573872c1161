//! Reconcile configuration, read from the environment.

use std::collections::BTreeSet;
use std::path::PathBuf;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::Resource as _;

pub const DATA_PATH_ENV: &str = "KINST_DATA_PATH";
pub const FIELD_MANAGER_ENV: &str = "KINST_FIELD_MANAGER";
pub const PROTECTED_KINDS_ENV: &str = "KINST_PROTECTED_KINDS";

pub const DEFAULT_DATA_PATH: &str = "/var/run/kinst";
pub const DEFAULT_FIELD_MANAGER: &str = "kinst";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Root of the manifest data tree: `<root>/<component dir>/<version>/`.
    pub data_path: PathBuf,
    /// Field manager for server-side apply.
    pub field_manager: String,
    /// Kinds never deleted by pruning or uninstall.
    pub protected: ProtectedKinds,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            protected: ProtectedKinds::default(),
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(p) = std::env::var(DATA_PATH_ENV) {
            if !p.is_empty() { cfg.data_path = PathBuf::from(p); }
        }
        if let Ok(fm) = std::env::var(FIELD_MANAGER_ENV) {
            if !fm.is_empty() { cfg.field_manager = fm; }
        }
        if let Ok(kinds) = std::env::var(PROTECTED_KINDS_ENV) {
            cfg.protected.extend_csv(&kinds);
        }
        cfg
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }
}

/// Resource kinds exempt from automatic deletion.
///
/// Always contains `CustomResourceDefinition`: deleting a CRD deletes every
/// custom resource of that type cluster-wide. Extra kinds can only be added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedKinds(BTreeSet<String>);

impl Default for ProtectedKinds {
    fn default() -> Self {
        Self(BTreeSet::from([CustomResourceDefinition::KIND.to_string()]))
    }
}

impl ProtectedKinds {
    pub fn contains(&self, kind: &str) -> bool { self.0.contains(kind) }

    /// Add comma-separated kinds, ignoring blanks.
    pub fn extend_csv(&mut self, csv: &str) {
        for kind in csv.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            self.0.insert(kind.to_string());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> { self.0.iter().map(String::as_str) }
}
