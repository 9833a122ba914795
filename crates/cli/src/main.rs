use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use fleethub_core::{ClusterSet, Member, ObjectKey, WatchEvent};
use fleethub_hub::{ClusterSetController, HubConfig, LogRecorder, MembershipCache, Runner, SyncContext, SyncOutcome};
use fleethub_kubehub::cleanup::{self, ClusterManifestDir};
use fleethub_kubehub::KubeStore;
use fleethub_store::WorkQueue;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hubctl", version, about = "fleethub hub controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch clusters and cluster sets and keep set status current
    Run {
        /// Worker count (overrides HUB_WORKERS)
        #[arg(long = "workers")]
        workers: Option<usize>,
        /// Work queue capacity (overrides HUB_QUEUE_CAP)
        #[arg(long = "queue-cap")]
        queue_cap: Option<usize>,
        /// Per-sync deadline in seconds, 0 disables (overrides HUB_SYNC_TIMEOUT_SECS)
        #[arg(long = "sync-timeout-secs")]
        sync_timeout_secs: Option<u64>,
        /// Drop cache entries of members that left a set
        #[arg(long = "prune-membership", action = ArgAction::SetTrue)]
        prune_membership: bool,
    },
    /// Reconcile one cluster set once and print the outcome
    Sync {
        /// ManagedClusterSet name
        set: String,
    },
    /// Check that a URL is a well-formed https endpoint
    CheckUrl {
        url: String,
    },
    /// Remove an RBAC group from every (Cluster)RoleBinding
    CleanupGroup {
        group: String,
    },
    /// Delete the objects named by manifest files
    CleanupManifests {
        /// Manifest file names, relative to --dir
        files: Vec<String>,
        /// Directory holding the manifest templates
        #[arg(long = "dir", default_value = ".")]
        dir: PathBuf,
        /// Substituted for {{ .ManagedClusterName }}
        #[arg(long = "cluster-name", env = "HUB_CLUSTER_NAME")]
        cluster_name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("HUB_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HUB_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid HUB_METRICS_ADDR; expected host:port");
        }
    }
}

fn controller(store: KubeStore, cfg: &HubConfig) -> ClusterSetController<KubeStore, LogRecorder> {
    ClusterSetController::new(Arc::new(store), Arc::new(LogRecorder::new("clusterset-controller")), Arc::new(MembershipCache::new()))
        .with_retry(cfg.retry.clone())
        .with_membership_pruning(cfg.prune_membership)
}

async fn run(cfg: HubConfig) -> Result<()> {
    let store = KubeStore::try_default().await?;
    let client = store.client();
    let ctrl = Arc::new(controller(store, &cfg));
    let queue = Arc::new(WorkQueue::with_capacity(cfg.queue_cap));
    let runner = Arc::new(Runner::new(ctrl, Arc::clone(&queue), cfg));

    let (member_tx, mut member_rx) = mpsc::channel::<WatchEvent<Member>>(256);
    let (set_tx, mut set_rx) = mpsc::channel::<WatchEvent<ClusterSet>>(256);
    let mut member_watch = tokio::spawn({
        let client = client.clone();
        async move {
            if let Err(e) = fleethub_kubehub::watch_objects::<Member>(client, member_tx).await {
                error!(error = ?e, "ManagedCluster watcher failed");
            }
        }
    });
    let mut set_watch = tokio::spawn(async move {
        if let Err(e) = fleethub_kubehub::watch_objects::<ClusterSet>(client, set_tx).await {
            error!(error = ?e, "ManagedClusterSet watcher failed");
        }
    });
    let forward = tokio::spawn({
        let runner = Arc::clone(&runner);
        async move {
            loop {
                tokio::select! {
                    Some(ev) = member_rx.recv() => runner.on_member_event(&ev),
                    Some(ev) = set_rx.recv() => runner.on_set_event(&ev),
                    else => break,
                }
            }
        }
    });

    let workers = tokio::spawn(Arc::clone(&runner).run());
    tokio::select! {
        _ = signal::ctrl_c() => info!("interrupt received; shutting down"),
        _ = &mut member_watch => error!("ManagedCluster watcher exited; shutting down"),
        _ = &mut set_watch => error!("ManagedClusterSet watcher exited; shutting down"),
        _ = forward => warn!("watch streams closed; shutting down"),
    }
    queue.shutdown();
    member_watch.abort();
    set_watch.abort();
    if let Err(e) = workers.await {
        error!(error = %e, "worker pool failed");
    }
    Ok(())
}

async fn sync_once(cfg: HubConfig, set: &str, output: Output) -> Result<()> {
    let ctrl = controller(KubeStore::try_default().await?, &cfg);
    let ctx = match cfg.sync_timeout {
        Some(t) => SyncContext::with_timeout(t),
        None => SyncContext::new(),
    };
    let outcome = ctrl.reconcile(&ctx, &ObjectKey::cluster(set)).await?;
    match output {
        Output::Human => match outcome {
            SyncOutcome::Missing => println!("{}: not found", set),
            SyncOutcome::Deleting => println!("{}: deleting, skipped", set),
            SyncOutcome::Reconciled { selected, churn, updated } => {
                println!("{}: {} ManagedClusters selected{}", set, selected, if updated { " (status updated)" } else { "" });
                for m in &churn.joined {
                    println!("  + {}", m);
                }
                for m in &churn.left {
                    println!("  - {}", m);
                }
            }
        },
        Output::Json => {
            let v = match outcome {
                SyncOutcome::Missing => serde_json::json!({ "set": set, "outcome": "missing" }),
                SyncOutcome::Deleting => serde_json::json!({ "set": set, "outcome": "deleting" }),
                SyncOutcome::Reconciled { selected, churn, updated } => serde_json::json!({
                    "set": set,
                    "outcome": "reconciled",
                    "selected": selected,
                    "updated": updated,
                    "joined": churn.joined,
                    "left": churn.left,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = HubConfig::from_env();

    match cli.command {
        Commands::Run { workers, queue_cap, sync_timeout_secs, prune_membership } => {
            let mut cfg = cfg;
            if let Some(n) = workers {
                cfg.workers = n.max(1);
            }
            if let Some(n) = queue_cap {
                cfg.queue_cap = n;
            }
            if let Some(secs) = sync_timeout_secs {
                cfg.sync_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            cfg.prune_membership |= prune_membership;
            run(cfg).await?
        }
        Commands::Sync { set } => sync_once(cfg, &set, cli.output).await?,
        Commands::CheckUrl { url } => {
            let ok = fleethub_hub::is_valid_https_url(&url);
            match cli.output {
                Output::Human => println!("{}: {}", url, if ok { "valid" } else { "invalid" }),
                Output::Json => println!("{}", serde_json::json!({ "url": url, "valid": ok })),
            }
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::CleanupGroup { group } => {
            let client = fleethub_kubehub::get_kube_client().await?;
            let recorder = LogRecorder::new("rbac-cleanup");
            cleanup::cleanup_group_from_cluster_role_bindings(&client, &recorder, &group).await?;
            cleanup::cleanup_group_from_role_bindings(&client, &recorder, &group).await?;
            info!(group = %group, "group removed from bindings");
        }
        Commands::CleanupManifests { files, dir, cluster_name } => {
            let client = fleethub_kubehub::get_kube_client().await?;
            let recorder = LogRecorder::new("manifest-cleanup");
            let source = ClusterManifestDir::new(dir, cluster_name);
            cleanup::cleanup_cluster_manifests(&client, &recorder, &source, &files).await?;
        }
    }
    Ok(())
}
