//! Delete resources that were installed before but are no longer desired.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, warn};

use kinst_core::predicates::{in_manifest, not};
use kinst_core::{Manifest, ResourceKey};
use kinst_persist::ManifestStore;

use crate::stages::{Stage, StageContext};
use crate::{source, Component, PruneFailure, ProtectedKinds, ReconcileError};

/// Supplies the manifest last installed for a component, the pruning baseline.
#[async_trait]
pub trait InstalledAccessor: Send + Sync {
    async fn installed(&self, ctx: &StageContext, component: &dyn Component) -> Result<Option<Manifest>, ReconcileError>;
}

/// A fixed snapshot is its own baseline.
#[async_trait]
impl InstalledAccessor for Manifest {
    async fn installed(&self, _ctx: &StageContext, _component: &dyn Component) -> Result<Option<Manifest>, ReconcileError> {
        Ok(Some(self.clone()))
    }
}

/// Baseline from the component status: its applied snapshot, or the
/// manifest data tree for statuses recorded without one.
pub struct StatusInstalled;

#[async_trait]
impl InstalledAccessor for StatusInstalled {
    async fn installed(&self, ctx: &StageContext, component: &dyn Component) -> Result<Option<Manifest>, ReconcileError> {
        source::installed_manifest(ctx.config(), component)
    }
}

/// Baseline from the newest record of an installed-manifest store.
pub struct StoreInstalled {
    store: Arc<dyn ManifestStore>,
}

impl StoreInstalled {
    pub fn new(store: Arc<dyn ManifestStore>) -> Self { Self { store } }
}

#[async_trait]
impl InstalledAccessor for StoreInstalled {
    async fn installed(&self, _ctx: &StageContext, component: &dyn Component) -> Result<Option<Manifest>, ReconcileError> {
        let Some(rec) = self.store.latest_installed(&component.key()).map_err(ReconcileError::Store)? else {
            return Ok(None);
        };
        Ok(Some(Manifest::from_yaml_str(&rec.yaml())?))
    }
}

/// Outcome of a pruning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub deleted: Vec<ResourceKey>,
    /// Already gone when we tried to delete them.
    pub absent: Vec<ResourceKey>,
    /// Obsolete but kept because their kind is protected.
    pub retained: Vec<ResourceKey>,
}

/// Installed resources whose key is missing from `desired`, minus protected kinds.
pub fn obsolete(installed: &Manifest, desired: &Manifest, protected: &ProtectedKinds) -> Manifest {
    installed
        .filter(not(in_manifest(desired)))
        .filter(|r| !protected.contains(r.kind()))
}

/// Delete every obsolete resource of `installed` with respect to `desired`.
///
/// Deletes run in reverse manifest order through the baseline's client, or
/// the desired manifest's when the baseline has none. Not-found counts as
/// done; other failures are collected and reported together once every
/// delete has been attempted. Cancellation stops immediately.
pub async fn prune(ctx: &StageContext, installed: &Manifest, desired: &Manifest) -> Result<PruneReport, ReconcileError> {
    let protected = &ctx.config().protected;
    let gone = installed.filter(not(in_manifest(desired)));
    let mut report = PruneReport {
        retained: gone.filter(|r| protected.contains(r.kind())).resources().iter().map(|r| r.key().clone()).collect(),
        ..Default::default()
    };
    for key in &report.retained {
        debug!(resource = %key, "protected kind; not pruning");
    }
    let doomed = obsolete(installed, desired, protected);
    if doomed.is_empty() {
        return Ok(report);
    }
    let client = doomed.client().or(desired.client()).cloned().ok_or(ReconcileError::NoClient)?;

    let mut failures = Vec::new();
    for r in doomed.resources().iter().rev() {
        match ctx.run(client.delete(r)).await? {
            Ok(()) => {
                counter!("kinst_prune_deleted_total", 1u64);
                info!(resource = %r.key(), "deleted obsolete resource");
                report.deleted.push(r.key().clone());
            }
            Err(e) if e.is_not_found() => {
                debug!(resource = %r.key(), "obsolete resource already absent");
                report.absent.push(r.key().clone());
            }
            Err(e) => {
                counter!("kinst_prune_failed_total", 1u64);
                warn!(resource = %r.key(), error = %e, "failed to delete obsolete resource");
                failures.push(PruneFailure { key: r.key().clone(), error: e });
            }
        }
    }
    if failures.is_empty() {
        Ok(report)
    } else {
        Err(ReconcileError::Prune(failures))
    }
}

/// Pipeline step deleting what the accessor reports as installed but the
/// working manifest no longer contains. It never applies anything.
pub struct DeleteObsoleteResources {
    installed: Arc<dyn InstalledAccessor>,
}

impl DeleteObsoleteResources {
    pub fn new(installed: impl InstalledAccessor + 'static) -> Self {
        Self { installed: Arc::new(installed) }
    }

    /// Fetch the baseline and prune it against `desired`. A missing or
    /// unreadable baseline means there is nothing to prune.
    pub async fn prune_against(&self, ctx: &StageContext, desired: &Manifest, component: &dyn Component) -> Result<PruneReport, ReconcileError> {
        let baseline = match self.installed.installed(ctx, component).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                debug!(component = %component.key(), "no installed manifest recorded; nothing to prune");
                return Ok(PruneReport::default());
            }
            Err(ReconcileError::Cancelled) => return Err(ReconcileError::Cancelled),
            Err(e) => {
                warn!(component = %component.key(), error = %e, "installed manifest unavailable; nothing to prune");
                return Ok(PruneReport::default());
            }
        };
        prune(ctx, &baseline, desired).await
    }
}

#[async_trait]
impl Stage for DeleteObsoleteResources {
    fn name(&self) -> &str { "DeleteObsoleteResources" }

    async fn run(&self, ctx: &StageContext, manifest: &mut Manifest, component: &dyn Component) -> Result<(), ReconcileError> {
        self.prune_against(ctx, manifest, component).await.map(|_| ())
    }
}

/// Build the obsolete-resource step for an installed-manifest accessor.
pub fn delete_obsolete_resources(installed: impl InstalledAccessor + 'static) -> DeleteObsoleteResources {
    DeleteObsoleteResources::new(installed)
}
