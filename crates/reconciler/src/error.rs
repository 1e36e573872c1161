use std::path::PathBuf;

use thiserror::Error;

use kinst_core::{ClientError, ManifestError, ResourceKey};

/// Errors surfaced by stages, the pruner and reconcile passes.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no manifest versions found under {dir}")]
    NoVersions { dir: PathBuf },
    #[error("manifest version {version} not found under {dir}")]
    UnknownVersion { version: String, dir: PathBuf },
    #[error("no client available to delete obsolete resources")]
    NoClient,
    #[error("reconcile cancelled")]
    Cancelled,
    #[error("failed to delete {} obsolete resource(s): {}", .0.len(), summarize(.0))]
    Prune(Vec<PruneFailure>),
    #[error("installed store: {0:#}")]
    Store(anyhow::Error),
    #[error("stage {stage} failed: {message}")]
    Stage { stage: String, message: String },
}

impl ReconcileError {
    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        ReconcileError::Stage { stage: stage.into(), message: message.into() }
    }
}

/// A delete that failed for a reason other than not-found.
#[derive(Debug)]
pub struct PruneFailure {
    pub key: ResourceKey,
    pub error: ClientError,
}

fn summarize(failures: &[PruneFailure]) -> String {
    failures.iter().map(|f| format!("{}: {}", f.key, f.error)).collect::<Vec<_>>().join("; ")
}
