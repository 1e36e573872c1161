//! Resolve where a component's target and installed manifests live on disk.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use tracing::debug;

use kinst_core::Manifest;

use crate::{Component, ReconcileConfig, ReconcileError};

/// A resolved set of manifest sources and the version they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSource {
    pub version: Option<String>,
    pub paths: Vec<PathBuf>,
}

impl ManifestSource {
    /// Load and union every path, in order.
    pub fn load(&self) -> Result<Manifest, ReconcileError> {
        let mut out = Manifest::new();
        for path in &self.paths {
            let m = Manifest::from_path(path)?;
            debug!(path = %path.display(), resources = m.len(), "manifest source loaded");
            out = out.append(&m);
        }
        Ok(out)
    }
}

/// Sources for what the component should look like now.
///
/// Explicit `spec.manifests` win; otherwise `<data>/<dir>/<version>` with the
/// pinned version or the newest one available. Additional manifests follow.
pub fn target_source(config: &ReconcileConfig, component: &dyn Component) -> Result<ManifestSource, ReconcileError> {
    let spec = component.spec();
    let mut source = if !spec.manifests.is_empty() {
        ManifestSource { version: spec.version.clone(), paths: spec.manifests.clone() }
    } else {
        let dir = config.data_path.join(component.manifest_dir());
        let version = match &spec.version {
            Some(v) => v.clone(),
            None => latest_version(&dir)?,
        };
        ManifestSource { paths: vec![version_dir(&dir, &version)?], version: Some(version) }
    };
    source.paths.extend(spec.additional_manifests.iter().cloned());
    Ok(source)
}

/// Sources recorded by the last successful install, if any.
pub fn installed_source(config: &ReconcileConfig, component: &dyn Component) -> Result<Option<ManifestSource>, ReconcileError> {
    let status = component.status();
    if !status.manifests.is_empty() {
        return Ok(Some(ManifestSource { version: status.version.clone(), paths: status.manifests.clone() }));
    }
    match &status.version {
        Some(version) => {
            let dir = config.data_path.join(component.manifest_dir());
            let path = version_dir(&dir, version)?;
            Ok(Some(ManifestSource { version: Some(version.clone()), paths: vec![path] }))
        }
        None => Ok(None),
    }
}

/// The manifest last installed: the applied snapshot when the status has
/// one, otherwise whatever its recorded sources contain now.
pub fn installed_manifest(config: &ReconcileConfig, component: &dyn Component) -> Result<Option<Manifest>, ReconcileError> {
    if let Some(applied) = &component.status().applied {
        return Ok(Some(Manifest::from_resources(applied.clone())));
    }
    installed_source(config, component)?.map(|s| s.load()).transpose()
}

fn version_dir(dir: &Path, version: &str) -> Result<PathBuf, ReconcileError> {
    let path = dir.join(version);
    if path.is_dir() {
        Ok(path)
    } else {
        Err(ReconcileError::UnknownVersion { version: version.to_string(), dir: dir.to_path_buf() })
    }
}

/// Newest version directory under `dir`; names that do not parse as a
/// version are ignored.
pub fn latest_version(dir: &Path) -> Result<String, ReconcileError> {
    let entries = std::fs::read_dir(dir).map_err(|_| ReconcileError::NoVersions { dir: dir.to_path_buf() })?;
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| parse_version(name).is_some())
        .max_by(|a, b| compare_versions(a, b))
        .ok_or_else(|| ReconcileError::NoVersions { dir: dir.to_path_buf() })
}

struct Version<'a> {
    numbers: Vec<u64>,
    pre: Option<&'a str>,
}

fn parse_version(s: &str) -> Option<Version<'_>> {
    let s = s.strip_prefix('v').unwrap_or(s);
    let (core, pre) = match s.split_once('-') {
        Some((c, p)) => (c, Some(p)),
        None => (s, None),
    };
    let numbers = core.split('.').map(|n| n.parse::<u64>().ok()).collect::<Option<Vec<_>>>()?;
    if numbers.is_empty() { return None; }
    Some(Version { numbers, pre })
}

/// Numeric, component-wise; a release sorts after its pre-releases.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(va), Some(vb)) => {
            let len = va.numbers.len().max(vb.numbers.len());
            for i in 0..len {
                let x = va.numbers.get(i).copied().unwrap_or(0);
                let y = vb.numbers.get(i).copied().unwrap_or(0);
                match x.cmp(&y) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            match (va.pre, vb.pre) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => x.cmp(y),
            }
        }
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}
