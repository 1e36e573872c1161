use std::path::{Path, PathBuf};
use std::sync::Arc;

use kinst_core::{Resource, ResourceKey};
use kinst_kubehub::MemoryClient;
use kinst_persist::{ManifestStore, SqliteStore};
use kinst_reconciler::stages::{COMPONENT_LABEL, MANAGED_BY_LABEL};
use kinst_reconciler::{Component, ReconcileConfig, ReconcileError, Reconciler, Serving, StoreInstalled};

fn kodata() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/kodata")
}

fn reconciler(client: &Arc<MemoryClient>) -> Reconciler {
    Reconciler::new(ReconcileConfig::default().with_data_path(kodata()), client.clone())
}

fn serving_cm(name: &str) -> ResourceKey {
    ResourceKey::new("v1", "ConfigMap", Some("kinst-serving"), name)
}

fn serving_crd() -> ResourceKey {
    ResourceKey::new("apiextensions.k8s.io/v1", "CustomResourceDefinition", None, "services.serving.example.dev")
}

fn pinned(version: &str) -> Serving {
    let mut s = Serving::new("serving", "kinst-serving");
    s.spec.version = Some(version.into());
    s
}

#[tokio::test]
async fn first_install_applies_latest_and_records_status() {
    let client = Arc::new(MemoryClient::new());
    let r = reconciler(&client);
    let mut serving = Serving::new("serving", "kinst-serving");

    let out = r.reconcile(&r.context(), &mut serving).await.unwrap();

    assert_eq!(out.version.as_deref(), Some("0.14.0"));
    assert_eq!(out.applied, 2);
    assert!(out.prune.deleted.is_empty());
    assert_eq!(serving.status.version.as_deref(), Some("0.14.0"));
    assert!(serving.status.is_installed());
    assert!(serving.status.manifests[0].ends_with("serving/0.14.0"));
    for obj in client.objects() {
        assert_eq!(obj.label(MANAGED_BY_LABEL), Some("kinst"));
        assert_eq!(obj.label(COMPONENT_LABEL), Some("Serving.serving"));
    }
}

#[tokio::test]
async fn upgrade_deletes_resources_dropped_by_the_new_version() {
    let client = Arc::new(MemoryClient::new());
    let r = reconciler(&client);
    let mut serving = pinned("0.13.0");
    r.reconcile(&r.context(), &mut serving).await.unwrap();
    assert!(client.contains(&serving_cm("config-legacy")));

    serving.spec.version = None;
    let out = r.reconcile(&r.context(), &mut serving).await.unwrap();

    assert_eq!(out.prune.deleted, vec![serving_cm("config-legacy")]);
    assert!(!client.contains(&serving_cm("config-legacy")));
    assert!(client.contains(&serving_cm("config-network")));
    assert!(client.contains(&serving_crd()));
    assert_eq!(serving.status.version.as_deref(), Some("0.14.0"));
}

#[tokio::test]
async fn failed_prune_keeps_the_previous_status() {
    let client = Arc::new(MemoryClient::new());
    let r = reconciler(&client);
    let mut serving = pinned("0.13.0");
    r.reconcile(&r.context(), &mut serving).await.unwrap();
    let before = serving.status.clone();

    client.fail_deletes(serving_cm("config-legacy"), 500, "etcd unavailable");
    serving.spec.version = Some("0.14.0".into());
    let err = r.reconcile(&r.context(), &mut serving).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Prune(_)));
    assert_eq!(serving.status, before);

    client.clear_failures();
    let out = r.reconcile(&r.context(), &mut serving).await.unwrap();
    assert_eq!(out.prune.deleted, vec![serving_cm("config-legacy")]);
    assert_eq!(serving.status.version.as_deref(), Some("0.14.0"));
}

#[tokio::test]
async fn cancelled_pass_changes_nothing() {
    let client = Arc::new(MemoryClient::new());
    let r = reconciler(&client);
    let mut serving = Serving::new("serving", "kinst-serving");
    let ctx = r.context();
    ctx.cancel_token().cancel();

    let err = r.reconcile(&ctx, &mut serving).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Cancelled));
    assert!(client.is_empty());
    assert!(!serving.status.is_installed());
}

#[tokio::test]
async fn history_store_supplies_the_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("kinst.db");
    let store: Arc<dyn ManifestStore> = Arc::new(SqliteStore::open(db.to_str().unwrap()).unwrap());
    let client = Arc::new(MemoryClient::new());
    let r = reconciler(&client)
        .with_store(store.clone())
        .with_installed(Arc::new(StoreInstalled::new(store.clone())));

    let mut old = pinned("0.13.0");
    r.reconcile(&r.context(), &mut old).await.unwrap();

    // a fresh object with no status: only the store knows what was installed
    let mut fresh = Serving::new("serving", "kinst-serving");
    let out = r.reconcile(&r.context(), &mut fresh).await.unwrap();

    assert_eq!(out.prune.deleted, vec![serving_cm("config-legacy")]);
    let latest = store.latest_installed(&fresh.key()).unwrap().unwrap();
    assert_eq!(latest.version, "0.14.0");
    assert_eq!(store.get_installed(&fresh.key(), None).unwrap().len(), 2);
    let recorded = kinst_core::yaml::parse_resources(&latest.yaml()).unwrap();
    let names: Vec<_> = recorded.iter().map(Resource::name).collect();
    assert_eq!(names, vec!["services.serving.example.dev", "config-network"]);
}

#[tokio::test]
async fn uninstall_removes_all_but_crds() {
    let client = Arc::new(MemoryClient::new());
    let r = reconciler(&client);
    let mut serving = pinned("0.13.0");
    r.reconcile(&r.context(), &mut serving).await.unwrap();
    serving.spec.version = None;
    // a stray object from an interrupted pass: status still says 0.13.0
    client.fail_deletes(serving_cm("config-legacy"), 500, "etcd unavailable");
    assert!(r.reconcile(&r.context(), &mut serving).await.is_err());
    client.clear_failures();

    let report = r.uninstall(&r.context(), &mut serving).await.unwrap();

    let mut deleted = report.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec![serving_cm("config-legacy"), serving_cm("config-network")]);
    assert_eq!(report.retained, vec![serving_crd()]);
    assert_eq!(client.len(), 1);
    assert!(client.contains(&serving_crd()));
    assert!(!serving.status.is_installed());
}

#[tokio::test]
async fn manifest_edited_in_place_is_pruned_from_the_applied_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let app = dir.path().join("app.yaml");
    let cm = |name: &str| format!("---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: demo\n");
    std::fs::write(&app, cm("a") + &cm("b")).unwrap();
    let client = Arc::new(MemoryClient::new());
    let r = reconciler(&client);
    let mut serving = Serving::new("serving", "kinst-serving");
    serving.spec.manifests = vec![app.clone()];
    r.reconcile(&r.context(), &mut serving).await.unwrap();
    assert_eq!(client.len(), 2);

    // same path, new content: the recorded sources now describe only `a`
    std::fs::write(&app, cm("a")).unwrap();
    let out = r.reconcile(&r.context(), &mut serving).await.unwrap();

    let b = ResourceKey::new("v1", "ConfigMap", Some("demo"), "b");
    assert_eq!(out.prune.deleted, vec![b.clone()]);
    assert!(!client.contains(&b));
    assert_eq!(client.len(), 1);
    let applied = serving.status.applied.as_ref().unwrap();
    assert_eq!(applied.iter().map(Resource::name).collect::<Vec<_>>(), vec!["a"]);
}

#[tokio::test]
async fn uninstall_forgets_the_recorded_history() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("kinst.db");
    let store: Arc<dyn ManifestStore> = Arc::new(SqliteStore::open(db.to_str().unwrap()).unwrap());
    let client = Arc::new(MemoryClient::new());
    let r = reconciler(&client)
        .with_store(store.clone())
        .with_installed(Arc::new(StoreInstalled::new(store.clone())));
    let mut serving = pinned("0.13.0");
    r.reconcile(&r.context(), &mut serving).await.unwrap();
    assert!(store.latest_installed(&serving.key()).unwrap().is_some());

    r.uninstall(&r.context(), &mut serving).await.unwrap();

    assert!(store.get_installed(&serving.key(), None).unwrap().is_empty());
    assert_eq!(client.len(), 0);
    assert!(!serving.status.is_installed());
}
