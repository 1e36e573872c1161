//! Resource descriptors and their identity keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ManifestError;

/// Identity of a cluster object: group, version, kind, namespace and name.
///
/// Two resources are the same object iff their keys are equal; the object body
/// is not part of the identity. An empty namespace is normalized to `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self {
            group,
            version,
            kind: kind.to_string(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
            name: name.to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// `v1/ConfigMap` or `apps/v1/Deployment`.
    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk_key(), ns, self.name),
            None => write!(f, "{} {}", self.gvk_key(), self.name),
        }
    }
}

fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// A single cluster object descriptor: its identity key plus the raw object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "Json")]
pub struct Resource {
    key: ResourceKey,
    object: Json,
}

impl Resource {
    /// Build a resource from a JSON object, validating the identity fields.
    pub fn from_json(object: Json) -> Result<Self, ManifestError> {
        let key = key_of(&object)?;
        Ok(Self { key, object })
    }

    pub fn key(&self) -> &ResourceKey { &self.key }
    pub fn object(&self) -> &Json { &self.object }

    pub fn kind(&self) -> &str { &self.key.kind }
    pub fn group(&self) -> &str { &self.key.group }
    pub fn name(&self) -> &str { &self.key.name }
    pub fn namespace(&self) -> Option<&str> { self.key.namespace.as_deref() }
    pub fn api_version(&self) -> String { self.key.api_version() }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.object.get("metadata")?.get("labels")?.get(key)?.as_str()
    }

    pub fn set_api_version(&mut self, api_version: &str) {
        if let Some(obj) = self.object.as_object_mut() {
            obj.insert("apiVersion".into(), Json::String(api_version.to_string()));
        }
        let (group, version) = split_api_version(api_version);
        self.key.group = group;
        self.key.version = version;
    }

    pub fn set_namespace(&mut self, namespace: Option<&str>) {
        let namespace = namespace.filter(|ns| !ns.is_empty());
        if let Some(meta) = metadata_mut(&mut self.object) {
            match namespace {
                Some(ns) => { meta.insert("namespace".into(), Json::String(ns.to_string())); }
                None => { meta.remove("namespace"); }
            }
        }
        self.key.namespace = namespace.map(|ns| ns.to_string());
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        insert_into(&mut self.object, "labels", key, value);
    }

    /// Edit the raw object in place. The identity key is re-derived afterwards,
    /// so the edit may not drop `apiVersion`, `kind` or `metadata.name`.
    pub fn edit_object<F>(&mut self, f: F) -> Result<(), ManifestError>
    where
        F: FnOnce(&mut Json) -> Result<(), ManifestError>,
    {
        let mut object = self.object.clone();
        f(&mut object)?;
        self.key = key_of(&object)?;
        self.object = object;
        Ok(())
    }
}

impl From<Resource> for Json {
    fn from(r: Resource) -> Self { r.object }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = Json::deserialize(deserializer)?;
        Resource::from_json(object).map_err(serde::de::Error::custom)
    }
}

fn key_of(object: &Json) -> Result<ResourceKey, ManifestError> {
    if !object.is_object() {
        return Err(ManifestError::Invalid("resource is not an object".into()));
    }
    let api_version = object.get("apiVersion").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
        .ok_or_else(|| ManifestError::Invalid("missing apiVersion".into()))?;
    let kind = object.get("kind").and_then(|v| v.as_str()).filter(|s| !s.is_empty())
        .ok_or_else(|| ManifestError::Invalid("missing kind".into()))?;
    let meta = object.get("metadata");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
        .ok_or_else(|| ManifestError::Invalid(format!("{} missing metadata.name", kind)))?;
    let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str());
    Ok(ResourceKey::new(api_version, kind, namespace, name))
}

fn metadata_mut(object: &mut Json) -> Option<&mut serde_json::Map<String, Json>> {
    let root = object.as_object_mut()?;
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
    if !meta.is_object() { *meta = Json::Object(serde_json::Map::new()); }
    meta.as_object_mut()
}

fn insert_into(object: &mut Json, field: &str, key: &str, value: &str) {
    let Some(meta) = metadata_mut(object) else { return };
    let map = meta.entry(field).or_insert_with(|| Json::Object(serde_json::Map::new()));
    if !map.is_object() { *map = Json::Object(serde_json::Map::new()); }
    if let Some(m) = map.as_object_mut() {
        m.insert(key.to_string(), Json::String(value.to_string()));
    }
}
