use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kurator_controller::{Controller, Reconciler};
use kurator_core::{ControllerConfig, Key};
use kurator_kubehub::KubeWatchSource;
use kurator_store::CacheReader;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kuratorctl", version, about = "Kurator reconciliation controller")]
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
    /// Watch a GVK and reconcile every change until Ctrl-C
    Run {
        /// GVK key, e.g. "v1/Node" or "apps/v1/Deployment"
        gvk: String,
        /// Limit to one namespace (namespaced kinds only)
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Concurrent workers (overrides KURATOR_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Failed attempts before a key is dropped (overrides KURATOR_MAX_RETRIES)
        #[arg(long = "max-retries")]
        max_retries: Option<u32>,
        /// Initial listing deadline in seconds (overrides KURATOR_SYNC_TIMEOUT_SECS)
        #[arg(long = "sync-timeout-secs")]
        sync_timeout_secs: Option<u64>,
        /// Periodic resync in seconds, 0 = off (overrides KURATOR_RESYNC_SECS)
        #[arg(long = "resync-secs")]
        resync_secs: Option<u64>,
    },
    /// Print recognised environment variables and the effective config
    Env,
}

fn init_tracing() {
    let env = std::env::var("KURATOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KURATOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KURATOR_METRICS_ADDR; expected host:port");
        }
    }
}

/// Logs what the cache holds for each key; absent objects were deleted.
struct LogReconciler;

#[async_trait::async_trait]
impl Reconciler for LogReconciler {
    async fn reconcile(&self, key: &Key, cache: &CacheReader) -> Result<()> {
        let (ns, name) = key.split()?;
        match cache.get(key) {
            None => info!(ns = ns.unwrap_or(""), name, "object does not exist anymore"),
            Some(obj) => {
                let rv = obj.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|v| v.as_str()).unwrap_or("");
                let labels = obj.get("metadata").and_then(|m| m.get("labels")).and_then(|v| v.as_object()).map(|m| m.len()).unwrap_or(0);
                info!(ns = ns.unwrap_or(""), name, rv, labels, "observed");
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Env => {
            let cfg = ControllerConfig::from_env();
            match cli.output {
                Output::Human => {
                    print!("{}", ControllerConfig::usage());
                    println!();
                    println!("{:#?}", cfg);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&cfg)?),
            }
        }
        Commands::Run { gvk, namespace, workers, max_retries, sync_timeout_secs, resync_secs } => {
            let mut cfg = ControllerConfig::from_env();
            if let Some(w) = workers { cfg.workers = w; }
            if let Some(r) = max_retries { cfg.max_retries = r; }
            if let Some(s) = sync_timeout_secs { cfg.sync_timeout = Duration::from_secs(s); }
            if let Some(s) = resync_secs { cfg.resync_period = if s == 0 { None } else { Some(Duration::from_secs(s)) }; }
            cfg.queue_name = gvk.clone();
            info!(gvk = %gvk, ns = ?namespace, workers = cfg.workers, max_retries = cfg.max_retries, "run invoked");

            let workers = cfg.workers;
            let source = KubeWatchSource::new(gvk, namespace);
            let controller = Controller::new(cfg, Box::new(source), Arc::new(LogReconciler))?;

            let stop = CancellationToken::new();
            tokio::spawn({
                let stop = stop.clone();
                async move {
                    if signal::ctrl_c().await.is_ok() {
                        info!("Ctrl-C received; shutting down controller");
                    }
                    stop.cancel();
                }
            });

            if let Err(e) = controller.run(workers, stop).await {
                error!(error = %e, "controller failed");
                return Err(anyhow!(e));
            }
        }
    }

    Ok(())
}
