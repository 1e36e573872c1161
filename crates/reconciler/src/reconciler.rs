//! Install and uninstall passes driving the pipeline against a cluster.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::histogram;
use serde::Serialize;
use tracing::{info, warn};

use kinst_core::{yaml, Manifest, ResourceClient};
use kinst_persist::{maybe_compress, now_ts, InstalledRecord, ManifestStore};

use crate::obsolete::{prune, InstalledAccessor, PruneReport, StatusInstalled};
use crate::stages::{AppendInstalled, AppendTarget, OwnerLabels, StageContext, Stages};
use crate::{source, Component, ComponentStatus, ReconcileConfig, ReconcileError};

/// What a successful install pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub version: Option<String>,
    pub applied: usize,
    pub prune: PruneReport,
}

pub struct Reconciler {
    config: Arc<ReconcileConfig>,
    client: Arc<dyn ResourceClient>,
    stages: Stages,
    uninstall_stages: Stages,
    installed: Arc<dyn InstalledAccessor>,
    store: Option<Arc<dyn ManifestStore>>,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig, client: Arc<dyn ResourceClient>) -> Self {
        Self {
            config: Arc::new(config),
            client,
            stages: install_stages(),
            uninstall_stages: uninstall_stages(),
            installed: Arc::new(StatusInstalled),
            store: None,
        }
    }

    /// Replace the install pipeline.
    pub fn with_stages(mut self, stages: Stages) -> Self {
        self.stages = stages;
        self
    }

    /// Replace where the pruning baseline comes from.
    pub fn with_installed(mut self, installed: Arc<dyn InstalledAccessor>) -> Self {
        self.installed = installed;
        self
    }

    /// Record every successful install in `store`.
    pub fn with_store(mut self, store: Arc<dyn ManifestStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ReconcileConfig { &self.config }

    /// A fresh context sharing this reconciler's configuration.
    pub fn context(&self) -> StageContext { StageContext::new(self.config.clone()) }

    /// Bring the cluster to the component's target manifest and prune what
    /// the previous install left behind.
    ///
    /// The status is written only once apply and prune both succeeded; a
    /// failed pass leaves it as it was so the next pass prunes the same
    /// baseline again.
    pub async fn reconcile(&self, ctx: &StageContext, component: &mut dyn Component) -> Result<ReconcileOutcome, ReconcileError> {
        let started = Instant::now();
        let res = self.reconcile_inner(ctx, component).await;
        histogram!("kinst_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(out) => info!(component = %component.key(), version = ?out.version, applied = out.applied, deleted = out.prune.deleted.len(), "reconciled"),
            Err(e) => warn!(component = %component.key(), error = %e, "reconcile failed"),
        }
        res
    }

    async fn reconcile_inner(&self, ctx: &StageContext, component: &mut dyn Component) -> Result<ReconcileOutcome, ReconcileError> {
        let baseline = match self.installed.installed(ctx, &*component).await {
            Ok(b) => b,
            Err(ReconcileError::Cancelled) => return Err(ReconcileError::Cancelled),
            Err(e) => {
                warn!(component = %component.key(), error = %e, "installed manifest unavailable; skipping prune");
                None
            }
        };
        let target = source::target_source(ctx.config(), &*component)?;

        let mut manifest = Manifest::new().with_client(self.client.clone());
        self.stages.execute(ctx, &mut manifest, &*component).await?;
        ctx.run(manifest.apply()).await??;

        let report = match &baseline {
            Some(b) => prune(ctx, b, &manifest).await?,
            None => PruneReport::default(),
        };

        if let Some(store) = &self.store {
            let rec = InstalledRecord {
                component: component.key(),
                version: target.version.clone().unwrap_or_default(),
                manifests: target.paths.iter().map(|p| p.display().to_string()).collect(),
                ts: now_ts(),
                yaml_zstd: maybe_compress(&yaml::render(&manifest)?),
            };
            store.put_installed(rec).map_err(ReconcileError::Store)?;
        }
        component.status_mut().mark_installed(target.version.clone(), target.paths, &manifest, Utc::now());

        Ok(ReconcileOutcome { version: target.version, applied: manifest.len(), prune: report })
    }

    /// Delete everything the component installed, target and previous
    /// install alike, except protected kinds. Clears the status and the
    /// component's install history on success.
    pub async fn uninstall(&self, ctx: &StageContext, component: &mut dyn Component) -> Result<PruneReport, ReconcileError> {
        let mut manifest = Manifest::new().with_client(self.client.clone());
        self.uninstall_stages.execute(ctx, &mut manifest, &*component).await?;
        let report = prune(ctx, &manifest, &Manifest::new()).await?;
        if let Some(store) = &self.store {
            store.forget(&component.key()).map_err(ReconcileError::Store)?;
        }
        *component.status_mut() = ComponentStatus::default();
        info!(component = %component.key(), deleted = report.deleted.len(), retained = report.retained.len(), "uninstalled");
        Ok(report)
    }
}

/// Default install pipeline.
pub fn install_stages() -> Stages {
    Stages::new().then(AppendTarget).then(OwnerLabels)
}

/// Pipeline collecting everything an uninstall must remove.
pub fn uninstall_stages() -> Stages {
    Stages::new().then(AppendTarget).then(AppendInstalled)
}
