use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};

use ursa_controller::{Classifier, Controller, UserReconciler, VersionGate};
use ursa_core::{Entry, EventHandler};
use ursa_kubehub::{KubeEventSink, KubeStatusWriter};
use ursa_queue::WorkQueue;
use ursa_store::spawn_ingest;

const CONTROLLER_NAME: &str = "user-controller";
const DEFAULT_GVK: &str = "stable.example.com/v1/User";

/// Status field whose transitions drive re-enqueueing for `User` objects.
const LOGIN_POINTER: &str = "/status/isLogin";

#[derive(Parser, Debug)]
#[command(name = "ursactl", version, about = "Ursa reconciliation controller")]
struct Cli {
    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// GVK key, e.g. "stable.example.com/v1/User"
    #[arg(long = "gvk", global = true, default_value = DEFAULT_GVK)]
    gvk: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted
    Run {
        /// Worker loops pulling from the queue
        #[arg(long = "workers", default_value_t = 2)]
        workers: usize,
    },
    /// Watch objects for the GVK and print +/~/- events
    Watch,
}

fn init_tracing() {
    let env = std::env::var("URSA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("URSA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid URSA_METRICS_ADDR; expected host:port");
        }
    }
}

fn queue_cap() -> usize {
    std::env::var("URSA_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(2048)
}

fn resync_interval() -> Option<Duration> {
    let secs = std::env::var("URSA_RESYNC_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(300);
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { workers } => run(cli.gvk, cli.namespace, workers).await,
        Commands::Watch => watch_objects(cli.gvk, cli.namespace).await,
    }
}

async fn run(gvk: String, namespace: Option<String>, workers: usize) -> Result<()> {
    info!(gvk = %gvk, ns = ?namespace, workers, "starting controller");

    let queue = WorkQueue::new();
    let policy = Arc::new(VersionGate::new(Some(LOGIN_POINTER)));
    let classifier = Arc::new(Classifier::new(Arc::clone(&queue), policy));
    let (feed_tx, store) = spawn_ingest(queue_cap(), classifier);

    let watcher = tokio::spawn({
        let gvk = gvk.clone();
        let ns = namespace.clone();
        async move {
            if let Err(e) = ursa_kubehub::start_watcher(&gvk, ns.as_deref(), resync_interval(), feed_tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });

    let client = ursa_kubehub::get_kube_client().await?;
    let writer = Arc::new(KubeStatusWriter::for_gvk(&gvk).await?);
    let sink = Arc::new(KubeEventSink::new(client, CONTROLLER_NAME));
    let reconciler = Arc::new(UserReconciler::new(store.clone(), writer, sink));
    let controller = Controller::new(store, queue, reconciler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let res = controller.run(workers, shutdown_rx).await;
    watcher.abort();
    res
}

struct PrintEvents;

impl EventHandler for PrintEvents {
    fn on_add(&self, new: &Arc<Entry>) {
        println!("+ {} @{}", new.key, new.resource_version);
    }

    fn on_update(&self, old: &Arc<Entry>, new: &Arc<Entry>) {
        println!("~ {} @{} -> @{}", new.key, old.resource_version, new.resource_version);
    }

    fn on_delete(&self, old: &Arc<Entry>) {
        println!("- {}", old.key);
    }
}

async fn watch_objects(gvk: String, namespace: Option<String>) -> Result<()> {
    let (feed_tx, _store) = spawn_ingest(queue_cap(), Arc::new(PrintEvents));
    let watcher = tokio::spawn({
        let gvk = gvk.clone();
        async move {
            if let Err(e) = ursa_kubehub::start_watcher(&gvk, namespace.as_deref(), None, feed_tx).await {
                error!(error = ?e, "watcher failed");
            }
        }
    });
    tokio::signal::ctrl_c().await?;
    watcher.abort();
    Ok(())
}
