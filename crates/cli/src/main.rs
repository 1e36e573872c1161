use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kinst_core::{yaml, Manifest, ResourceKey};
use kinst_kubehub::KubeClient;
use kinst_persist::{InstalledRecord, ManifestStore, SqliteStore};
use kinst_reconciler::{
    install_stages, obsolete, uninstall_stages, Component, ComponentSpec, ComponentStatus, Eventing, ReconcileConfig,
    Reconciler, Serving, StageContext, StoreInstalled,
};

#[derive(Parser, Debug)]
#[command(name = "kinstctl", version, about = "Install component manifests and prune what upgrades leave behind")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Root of the manifest data tree (<root>/<component>/<version>/)
    #[arg(long = "data-path", env = "KINST_DATA_PATH", global = true)]
    data_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind { Serving, Eventing }

#[derive(Args, Debug, Clone)]
struct ComponentArgs {
    /// Component variant
    #[arg(value_enum)]
    kind: Kind,
    /// Object name (default: the variant name)
    #[arg(long = "name")]
    name: Option<String>,
    /// Object namespace (default: kinst-<variant>)
    #[arg(long = "ns")]
    namespace: Option<String>,
    /// Pin a manifest version instead of the newest available
    #[arg(long = "target-version")]
    version: Option<String>,
    /// Explicit manifest file or directory; repeatable, replaces the data tree
    #[arg(short = 'f', long = "manifest")]
    manifests: Vec<PathBuf>,
    /// Extra manifest appended after the target; repeatable
    #[arg(long = "additional")]
    additional: Vec<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline offline and print the resulting manifest
    Render {
        #[command(flatten)]
        component: ComponentArgs,
        /// Render what an uninstall would remove instead
        #[arg(long = "uninstall", action = ArgAction::SetTrue)]
        uninstall: bool,
        /// Pretend this version is installed
        #[arg(long = "installed-version")]
        installed_version: Option<String>,
    },
    /// Print resources of INSTALLED that DESIRED no longer contains
    Obsolete {
        /// Previously installed manifest file or directory
        installed: PathBuf,
        /// Desired manifest file or directory
        desired: PathBuf,
    },
    /// Apply the component's manifest to the cluster and prune leftovers
    Install {
        #[command(flatten)]
        component: ComponentArgs,
        /// Field manager for server-side apply
        #[arg(long = "field-manager", env = "KINST_FIELD_MANAGER")]
        field_manager: Option<String>,
    },
    /// Delete everything the component installed except protected kinds
    Uninstall {
        #[command(flatten)]
        component: ComponentArgs,
        #[arg(long = "field-manager", env = "KINST_FIELD_MANAGER")]
        field_manager: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KINST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KINST_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KINST_METRICS_ADDR; expected host:port");
        }
    }
}

fn build_component(args: &ComponentArgs) -> Box<dyn Component> {
    let spec = ComponentSpec {
        version: args.version.clone(),
        manifests: args.manifests.clone(),
        additional_manifests: args.additional.clone(),
    };
    let (default_name, default_ns) = match args.kind {
        Kind::Serving => ("serving", "kinst-serving"),
        Kind::Eventing => ("eventing", "kinst-eventing"),
    };
    let name = args.name.clone().unwrap_or_else(|| default_name.to_string());
    let ns = args.namespace.clone().unwrap_or_else(|| default_ns.to_string());
    match args.kind {
        Kind::Serving => {
            let mut c = Serving::new(name, ns);
            c.spec = spec;
            Box::new(c)
        }
        Kind::Eventing => {
            let mut c = Eventing::new(name, ns);
            c.spec = spec;
            Box::new(c)
        }
    }
}

/// Rebuild a component status from the newest history record. A record
/// whose YAML does not parse leaves the snapshot unset.
fn status_from_record(rec: &InstalledRecord) -> ComponentStatus {
    let applied = match yaml::parse_resources(&rec.yaml()) {
        Ok(resources) => Some(resources),
        Err(e) => {
            warn!(component = %rec.component, error = %e, "recorded manifest unreadable");
            None
        }
    };
    ComponentStatus {
        version: Some(rec.version.clone()).filter(|v| !v.is_empty()),
        manifests: rec.manifests.iter().map(PathBuf::from).collect(),
        installed_at: DateTime::<Utc>::from_timestamp(rec.ts, 0),
        applied,
    }
}

fn config(data_path: Option<PathBuf>, field_manager: Option<String>) -> ReconcileConfig {
    let mut cfg = ReconcileConfig::from_env();
    if let Some(p) = data_path { cfg.data_path = p; }
    if let Some(fm) = field_manager { cfg.field_manager = fm; }
    cfg
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling");
            token.cancel();
        }
    });
}

fn print_keys(output: Output, title: &str, keys: &[ResourceKey]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{} ({})", title, keys.len());
            for k in keys {
                println!("  {}", k);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(keys)?),
    }
    Ok(())
}

/// Cluster-backed reconciler recording installs in the SQLite history, with
/// the component status restored from its newest record.
async fn live_reconciler(cfg: ReconcileConfig, component: &mut dyn Component) -> Result<Reconciler> {
    let client = KubeClient::try_default(cfg.field_manager.clone()).await.context("connecting to cluster")?;
    let store: Arc<dyn ManifestStore> = Arc::new(SqliteStore::open_default()?);
    if let Some(rec) = store.latest_installed(&component.key())? {
        info!(component = %component.key(), version = %rec.version, "restored installed status");
        *component.status_mut() = status_from_record(&rec);
    }
    Ok(Reconciler::new(cfg, Arc::new(client))
        .with_store(store.clone())
        .with_installed(Arc::new(StoreInstalled::new(store))))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Render { component, uninstall, installed_version } => {
            let cfg = config(cli.data_path, None);
            let mut comp = build_component(&component);
            comp.status_mut().version = installed_version;
            info!(component = %comp.key(), uninstall, "render invoked");
            let stages = if uninstall { uninstall_stages() } else { install_stages() };
            let ctx = StageContext::new(Arc::new(cfg));
            let mut manifest = Manifest::new();
            stages.execute(&ctx, &mut manifest, comp.as_ref()).await?;
            match cli.output {
                Output::Human => print!("{}", yaml::render(&manifest)?),
                Output::Json => {
                    let keys: Vec<_> = manifest.resources().iter().map(|r| r.key().clone()).collect();
                    println!("{}", serde_json::to_string_pretty(&keys)?);
                }
            }
        }
        Commands::Obsolete { installed, desired } => {
            let cfg = config(cli.data_path, None);
            info!(installed = %installed.display(), desired = %desired.display(), "obsolete invoked");
            let before = Manifest::from_path(&installed)?;
            let after = Manifest::from_path(&desired)?;
            let gone = obsolete(&before, &after, &cfg.protected);
            let keys: Vec<_> = gone.resources().iter().map(|r| r.key().clone()).collect();
            print_keys(cli.output, "obsolete", &keys)?;
        }
        Commands::Install { component, field_manager } => {
            let cfg = config(cli.data_path, field_manager);
            let mut comp = build_component(&component);
            let reconciler = live_reconciler(cfg, comp.as_mut()).await?;
            let ctx = reconciler.context();
            cancel_on_ctrl_c(ctx.cancel_token().clone());
            let out = reconciler.reconcile(&ctx, comp.as_mut()).await?;
            match cli.output {
                Output::Human => {
                    println!(
                        "{} installed version {}: {} applied, {} deleted, {} retained",
                        comp.key(),
                        out.version.as_deref().unwrap_or("-"),
                        out.applied,
                        out.prune.deleted.len(),
                        out.prune.retained.len(),
                    );
                    for k in &out.prune.deleted {
                        println!("  - {}", k);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
        Commands::Uninstall { component, field_manager } => {
            let cfg = config(cli.data_path, field_manager);
            let mut comp = build_component(&component);
            let reconciler = live_reconciler(cfg, comp.as_mut()).await?;
            let ctx = reconciler.context();
            cancel_on_ctrl_c(ctx.cancel_token().clone());
            let report = reconciler.uninstall(&ctx, comp.as_mut()).await?;
            match cli.output {
                Output::Human => {
                    print_keys(cli.output, "deleted", &report.deleted)?;
                    print_keys(cli.output, "retained", &report.retained)?;
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn component_defaults_follow_the_variant() {
        let cli = Cli::parse_from(["kinstctl", "render", "eventing", "--target-version", "0.14.0"]);
        let Commands::Render { component, .. } = cli.command else { panic!("expected render") };
        let comp = build_component(&component);
        assert_eq!(comp.key(), "Eventing/kinst-eventing/eventing");
        assert_eq!(comp.spec().version.as_deref(), Some("0.14.0"));
    }

    #[test]
    fn status_round_trips_through_a_record() {
        let yaml = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: config-network\n  namespace: kinst-serving\n";
        let rec = InstalledRecord {
            component: "Serving/kinst-serving/serving".into(),
            version: "0.14.0".into(),
            manifests: vec!["/var/run/kinst/serving/0.14.0".into()],
            ts: 1_700_000_000,
            yaml_zstd: kinst_persist::maybe_compress(yaml),
        };
        let status = status_from_record(&rec);
        assert_eq!(status.version.as_deref(), Some("0.14.0"));
        assert_eq!(status.manifests, vec![PathBuf::from("/var/run/kinst/serving/0.14.0")]);
        assert_eq!(status.installed_at.map(|t| t.timestamp()), Some(1_700_000_000));
        let applied = status.applied.expect("snapshot restored");
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].name(), "config-network");

        let unversioned = status_from_record(&InstalledRecord { version: String::new(), ..rec });
        assert_eq!(unversioned.version, None);
    }
}
