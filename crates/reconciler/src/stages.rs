//! Ordered stage pipeline building a working manifest.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kinst_core::Manifest;

use crate::{source, Component, ReconcileConfig, ReconcileError};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_LABEL: &str = "operator.kinst.dev/component";

/// Per-pass execution context: configuration plus cancellation.
#[derive(Debug, Clone)]
pub struct StageContext {
    config: Arc<ReconcileConfig>,
    cancel: CancellationToken,
}

impl StageContext {
    pub fn new(config: Arc<ReconcileConfig>) -> Self {
        Self { config, cancel: CancellationToken::new() }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ReconcileConfig { &self.config }
    pub fn cancel_token(&self) -> &CancellationToken { &self.cancel }
    pub fn is_cancelled(&self) -> bool { self.cancel.is_cancelled() }

    /// Race `fut` against cancellation. A cancelled context never polls `fut`.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ReconcileError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ReconcileError::Cancelled),
            out = fut => Ok(out),
        }
    }
}

/// One step of the pipeline. A stage may read or rewrite the working manifest
/// but must not apply anything to the cluster.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str { std::any::type_name::<Self>() }

    async fn run(&self, ctx: &StageContext, manifest: &mut Manifest, component: &dyn Component) -> Result<(), ReconcileError>;
}

/// Ordered, sequentially executed stages.
#[derive(Clone, Default)]
pub struct Stages(Vec<Arc<dyn Stage>>);

impl Stages {
    pub fn new() -> Self { Self::default() }

    pub fn then(mut self, stage: impl Stage + 'static) -> Self {
        self.0.push(Arc::new(stage));
        self
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn names(&self) -> Vec<&str> { self.0.iter().map(|s| s.name()).collect() }

    /// Run every stage in order against the same manifest and component.
    ///
    /// The first failure is returned unchanged and no later stage runs; the
    /// manifest keeps whatever earlier stages did to it.
    pub async fn execute(&self, ctx: &StageContext, manifest: &mut Manifest, component: &dyn Component) -> Result<(), ReconcileError> {
        for stage in &self.0 {
            if ctx.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }
            if let Err(e) = stage.run(ctx, manifest, component).await {
                warn!(stage = stage.name(), component = %component.key(), error = %e, "stage failed");
                return Err(e);
            }
            debug!(stage = stage.name(), resources = manifest.len(), "stage done");
        }
        Ok(())
    }
}

/// Does nothing.
pub struct NoOp;

#[async_trait]
impl Stage for NoOp {
    fn name(&self) -> &str { "NoOp" }

    async fn run(&self, _ctx: &StageContext, _manifest: &mut Manifest, _component: &dyn Component) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// Union the component's target manifest into the working manifest.
pub struct AppendTarget;

#[async_trait]
impl Stage for AppendTarget {
    fn name(&self) -> &str { "AppendTarget" }

    async fn run(&self, ctx: &StageContext, manifest: &mut Manifest, component: &dyn Component) -> Result<(), ReconcileError> {
        let target = source::target_source(ctx.config(), component)?.load()?;
        *manifest = manifest.append(&target);
        Ok(())
    }
}

/// Union the previously installed manifest into the working manifest.
///
/// Falls back to the target manifest when nothing usable is recorded.
pub struct AppendInstalled;

#[async_trait]
impl Stage for AppendInstalled {
    fn name(&self) -> &str { "AppendInstalled" }

    async fn run(&self, ctx: &StageContext, manifest: &mut Manifest, component: &dyn Component) -> Result<(), ReconcileError> {
        let installed = match source::installed_manifest(ctx.config(), component) {
            Ok(Some(m)) => m,
            Ok(None) => {
                debug!(component = %component.key(), "nothing installed yet; using target manifest");
                source::target_source(ctx.config(), component)?.load()?
            }
            Err(e) => {
                warn!(component = %component.key(), error = %e, "installed manifest unavailable; using target manifest");
                source::target_source(ctx.config(), component)?.load()?
            }
        };
        *manifest = manifest.append(&installed);
        Ok(())
    }
}

/// Label every resource with the managing operator and owning component.
pub struct OwnerLabels;

#[async_trait]
impl Stage for OwnerLabels {
    fn name(&self) -> &str { "OwnerLabels" }

    async fn run(&self, _ctx: &StageContext, manifest: &mut Manifest, component: &dyn Component) -> Result<(), ReconcileError> {
        let owner = format!("{}.{}", component.kind(), component.name());
        *manifest = manifest.transform(|r| {
            r.set_label(MANAGED_BY_LABEL, "kinst");
            r.set_label(COMPONENT_LABEL, &owner);
            Ok(())
        })?;
        Ok(())
    }
}

pub type StageFuture<'a> = BoxFuture<'a, Result<(), ReconcileError>>;

/// A stage backed by a plain function value.
pub struct FnStage<F> {
    name: &'static str,
    f: F,
}

/// Wrap an async function as a stage.
pub fn from_fn<F>(name: &'static str, f: F) -> FnStage<F>
where
    F: for<'a> Fn(&'a StageContext, &'a mut Manifest, &'a dyn Component) -> StageFuture<'a> + Send + Sync,
{
    FnStage { name, f }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: for<'a> Fn(&'a StageContext, &'a mut Manifest, &'a dyn Component) -> StageFuture<'a> + Send + Sync,
{
    fn name(&self) -> &str { self.name }

    async fn run(&self, ctx: &StageContext, manifest: &mut Manifest, component: &dyn Component) -> Result<(), ReconcileError> {
        (self.f)(ctx, manifest, component).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Serving;

    #[tokio::test]
    async fn run_short_circuits_when_cancelled() {
        let ctx = StageContext::new(Arc::new(ReconcileConfig::default()));
        assert_eq!(ctx.run(async { 7 }).await.unwrap(), 7);
        ctx.cancel_token().cancel();
        assert!(matches!(ctx.run(async { 7 }).await, Err(ReconcileError::Cancelled)));
    }

    #[tokio::test]
    async fn owner_labels_mark_every_resource() {
        let ctx = StageContext::new(Arc::new(ReconcileConfig::default()));
        let mut m = Manifest::from_yaml_str(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: b\n",
        ).unwrap();
        OwnerLabels.run(&ctx, &mut m, &Serving::new("main", "kinst")).await.unwrap();
        for r in m.resources() {
            assert_eq!(r.label(MANAGED_BY_LABEL), Some("kinst"));
            assert_eq!(r.label(COMPONENT_LABEL), Some("Serving.main"));
        }
    }

    #[test]
    fn builder_keeps_order() {
        let stages = Stages::new().then(AppendTarget).then(NoOp).then(AppendInstalled);
        assert_eq!(stages.names(), vec!["AppendTarget", "NoOp", "AppendInstalled"]);
    }
}
