//! YAML loading and rendering for manifests.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use crate::{Manifest, ManifestError, Resource};

fn max_yaml_bytes() -> usize {
    std::env::var("KINST_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("KINST_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse a (possibly multi-document) YAML string into resources.
///
/// Empty documents are skipped and `kind: List` documents are flattened into
/// their `items`.
pub fn parse_resources(yaml: &str) -> Result<Vec<Resource>, ManifestError> {
    let limit = max_yaml_bytes();
    if yaml.len() > limit {
        return Err(ManifestError::TooLarge { limit });
    }
    let max_nodes = max_yaml_nodes();
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        let val = serde_yaml::Value::deserialize(doc)?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val)?;
        if json_node_budget_exceeded(&json, max_nodes) {
            return Err(ManifestError::TooComplex { limit: max_nodes });
        }
        push_document(json, &mut out)?;
    }
    Ok(out)
}

fn push_document(json: Json, out: &mut Vec<Resource>) -> Result<(), ManifestError> {
    let is_list = json.get("kind").and_then(|k| k.as_str()).is_some_and(|k| k.ends_with("List"))
        && json.get("items").is_some_and(|i| i.is_array());
    if !is_list {
        out.push(Resource::from_json(json)?);
        return Ok(());
    }
    if let Json::Object(mut map) = json {
        if let Some(Json::Array(items)) = map.remove("items") {
            for item in items {
                out.push(Resource::from_json(item)?);
            }
        }
    }
    Ok(())
}

/// Load resources from a file, or from every `.yaml`/`.yml`/`.json` file of a
/// directory in lexical order (not recursive).
pub fn load_path(path: &Path) -> Result<Vec<Resource>, ManifestError> {
    let io = |source| ManifestError::Io { path: path.to_path_buf(), source };
    let meta = std::fs::metadata(path).map_err(io)?;
    let files: Vec<PathBuf> = if meta.is_dir() {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(path).map_err(io)? {
            let p = entry.map_err(io)?.path();
            let is_manifest = p.extension().and_then(|e| e.to_str()).is_some_and(|e| matches!(e, "yaml" | "yml" | "json"));
            if p.is_file() && is_manifest { files.push(p); }
        }
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };
    let mut out = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file)
            .map_err(|source| ManifestError::Io { path: file.clone(), source })?;
        let resources = parse_resources(&text)
            .map_err(|e| ManifestError::Source { path: file.clone(), source: Box::new(e) })?;
        debug!(file = %file.display(), count = resources.len(), "loaded manifest file");
        out.extend(resources);
    }
    Ok(out)
}

/// Render resources as a multi-document YAML stream.
pub fn render(manifest: &Manifest) -> Result<String, ManifestError> {
    let mut out = String::new();
    for r in manifest.resources() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(r.object())?);
    }
    Ok(out)
}
