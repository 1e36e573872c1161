use std::path::Path;
use std::sync::Arc;

use kinst_core::predicates::{by_kind, CRD_KIND};
use kinst_core::{Manifest, Resource, ResourceClient, ResourceKey};
use kinst_kubehub::MemoryClient;
use kinst_reconciler::{
    delete_obsolete_resources, prune, ReconcileConfig, ReconcileError, Serving, StageContext, Stages, StatusInstalled,
};

fn ctx() -> StageContext {
    StageContext::new(Arc::new(ReconcileConfig::default()))
}

fn res(api_version: &str, kind: &str, name: &str) -> Resource {
    Resource::from_json(serde_json::json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": { "name": name, "namespace": "ns" },
    }))
    .unwrap()
}

fn cm(name: &str) -> Resource {
    res("v1", "ConfigMap", name)
}

fn crd(name: &str) -> Resource {
    res("apiextensions.k8s.io/v1", "CustomResourceDefinition", name)
}

async fn installed(client: &Arc<MemoryClient>, resources: Vec<Resource>) -> Manifest {
    let m = Manifest::from_resources(resources).with_client(client.clone());
    m.apply().await.unwrap();
    m
}

fn key_names(keys: &[ResourceKey]) -> Vec<&str> {
    keys.iter().map(|k| k.name.as_str()).collect()
}

#[tokio::test]
async fn deletes_everything_but_the_crd() {
    let client = Arc::new(MemoryClient::new());
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/manifest.yaml");
    let full = Manifest::from_path(path).unwrap().with_client(client.clone());
    full.apply().await.unwrap();
    assert_eq!(client.len(), 6);

    let desired = full.filter(by_kind("Namespace"));
    let report = prune(&ctx(), &full, &desired).await.unwrap();

    assert_eq!(key_names(&report.deleted), vec!["controller", "config-observability", "config-logging", "controller"]);
    assert_eq!(key_names(&report.retained), vec!["foos.example.dev"]);
    assert!(report.absent.is_empty());
    let left: Vec<_> = client.objects().iter().map(|r| r.kind().to_string()).collect();
    assert_eq!(left.len(), 2);
    assert!(left.contains(&"Namespace".to_string()));
    assert!(left.contains(&"CustomResourceDefinition".to_string()));
}

#[tokio::test]
async fn crds_moved_to_a_new_api_version_keep_the_old_ones() {
    let client = Arc::new(MemoryClient::new());
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/manifest.yaml");
    let full = Manifest::from_path(path).unwrap().with_client(client.clone());
    full.apply().await.unwrap();
    let old_crd = full.filter(by_kind(CRD_KIND)).resources()[0].key().clone();
    assert_eq!(old_crd.version, "v1beta1");

    let desired = full
        .transform(|r| {
            if r.kind() == CRD_KIND {
                r.set_api_version("apiextensions.k8s.io/v1");
            }
            Ok(())
        })
        .unwrap();
    desired.apply().await.unwrap();
    let report = prune(&ctx(), &full, &desired).await.unwrap();

    assert!(report.deleted.is_empty());
    assert_eq!(report.retained, vec![old_crd.clone()]);
    assert!(client.contains(&old_crd));
    let new_crd = ResourceKey { version: "v1".into(), ..old_crd };
    assert!(client.contains(&new_crd));
    assert_eq!(client.len(), 7);
}

#[tokio::test]
async fn obsolete_set_is_the_key_difference() {
    let client = Arc::new(MemoryClient::new());
    let before = installed(&client, vec![cm("a"), cm("b"), crd("c")]).await;
    let desired = Manifest::from_resources(vec![cm("a")]);

    let report = prune(&ctx(), &before, &desired).await.unwrap();

    assert_eq!(key_names(&report.deleted), vec!["b"]);
    assert_eq!(key_names(&report.retained), vec!["c"]);
    assert!(client.contains(cm("a").key()));
    assert!(client.contains(crd("c").key()));
    assert_eq!(client.delete_calls(), 1);
}

#[tokio::test]
async fn changed_content_is_not_obsolete() {
    let client = Arc::new(MemoryClient::new());
    let before = installed(&client, vec![cm("a")]).await;
    let mut changed = cm("a");
    changed.set_label("tier", "new");
    let desired = Manifest::from_resources(vec![changed]);

    let report = prune(&ctx(), &before, &desired).await.unwrap();

    assert!(report.deleted.is_empty());
    assert_eq!(client.delete_calls(), 0);
}

#[tokio::test]
async fn second_prune_finds_nothing_left() {
    let client = Arc::new(MemoryClient::new());
    let before = installed(&client, vec![cm("a"), cm("b")]).await;
    let desired = Manifest::from_resources(vec![cm("a")]);

    let first = prune(&ctx(), &before, &desired).await.unwrap();
    let second = prune(&ctx(), &before, &desired).await.unwrap();

    assert_eq!(key_names(&first.deleted), vec!["b"]);
    assert!(second.deleted.is_empty());
    assert_eq!(key_names(&second.absent), vec!["b"]);
    assert_eq!(client.len(), 1);
}

#[tokio::test]
async fn failures_are_collected_after_every_delete() {
    let client = Arc::new(MemoryClient::new());
    let before = installed(&client, vec![cm("a"), cm("b"), cm("c")]).await;
    client.fail_deletes(cm("b").key().clone(), 500, "etcd unavailable");

    let err = prune(&ctx(), &before, &Manifest::new()).await.unwrap_err();

    match err {
        ReconcileError::Prune(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].key.name, "b");
            assert!(!failures[0].error.is_not_found());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(client.delete_calls(), 3);
    assert_eq!(client.len(), 1);
    assert!(client.contains(cm("b").key()));
}

#[tokio::test]
async fn baseline_without_client_uses_the_desired_one() {
    let client = Arc::new(MemoryClient::new());
    installed(&client, vec![cm("a"), cm("b")]).await;
    let before = Manifest::from_resources(vec![cm("a"), cm("b")]);
    let desired = Manifest::from_resources(vec![cm("a")]).with_client(client.clone());

    prune(&ctx(), &before, &desired).await.unwrap();
    assert_eq!(client.len(), 1);

    let orphaned = prune(&ctx(), &before, &Manifest::from_resources(vec![cm("a")])).await;
    assert!(matches!(orphaned, Err(ReconcileError::NoClient)));
}

#[tokio::test]
async fn extra_protected_kinds_are_retained() {
    let client = Arc::new(MemoryClient::new());
    let before = installed(&client, vec![res("v1", "Namespace", "ns"), cm("a")]).await;
    let mut config = ReconcileConfig::default();
    config.protected.extend_csv("Namespace");
    let ctx = StageContext::new(Arc::new(config));

    let report = prune(&ctx, &before, &Manifest::new()).await.unwrap();

    assert_eq!(key_names(&report.deleted), vec!["a"]);
    assert_eq!(key_names(&report.retained), vec!["ns"]);
}

#[tokio::test]
async fn cancelled_prune_deletes_nothing() {
    let client = Arc::new(MemoryClient::new());
    let before = installed(&client, vec![cm("a"), cm("b")]).await;
    let ctx = ctx();
    ctx.cancel_token().cancel();

    let err = prune(&ctx, &before, &Manifest::new()).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Cancelled));
    assert_eq!(client.delete_calls(), 0);
    assert_eq!(client.len(), 2);
}

#[tokio::test]
async fn stage_prunes_against_a_snapshot() {
    let client = Arc::new(MemoryClient::new());
    let before = installed(&client, vec![cm("a"), cm("b")]).await;
    let mut desired = Manifest::from_resources(vec![cm("a")]).with_client(client.clone());

    Stages::new()
        .then(delete_obsolete_resources(before))
        .execute(&ctx(), &mut desired, &Serving::new("serving", "ns"))
        .await
        .unwrap();

    assert_eq!(client.len(), 1);
    assert_eq!(desired.len(), 1);
    let a = client.get(&cm("a")).await.unwrap();
    assert_eq!(a.name(), "a");
}

#[tokio::test]
async fn unavailable_baseline_prunes_nothing() {
    let client = Arc::new(MemoryClient::new());
    installed(&client, vec![cm("a")]).await;
    let step = delete_obsolete_resources(StatusInstalled);
    let desired = Manifest::new().with_client(client.clone());

    let mut serving = Serving::new("serving", "ns");
    let nothing_recorded = step.prune_against(&ctx(), &desired, &serving).await.unwrap();
    assert!(nothing_recorded.deleted.is_empty());

    serving.status.version = Some("0.0.1".into());
    let unreadable = step.prune_against(&ctx(), &desired, &serving).await.unwrap();
    assert!(unreadable.deleted.is_empty());
    assert_eq!(client.delete_calls(), 0);
}
