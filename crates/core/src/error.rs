use std::path::PathBuf;

use thiserror::Error;

use crate::ResourceKey;

/// Errors raised while building, transforming or applying a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid resource: {0}")]
    Invalid(String),
    #[error("parsing YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("converting YAML to JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML document too large (>{limit} bytes)")]
    TooLarge { limit: usize },
    #[error("YAML document too complex (>{limit} nodes)")]
    TooComplex { limit: usize },
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("{path}: {source}")]
    Source { path: PathBuf, #[source] source: Box<ManifestError> },
    #[error("manifest has no client")]
    NoClient,
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Errors surfaced by a [`crate::ResourceClient`].
///
/// `NotFound` must be reported whenever the object is absent so callers can
/// treat deletes of already-removed objects as success.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(ResourceKey),
    #[error("api error {code} for {key}: {message}")]
    Api { key: ResourceKey, code: u16, message: String },
    #[error("kind not served by the cluster: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}
