use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kgw_client::GatewayConfig;
use kgw_controller::{ControllerConfig, CullerConfig, StoreConfig};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kgw-controller", version, about = "Kernel session controller")]
struct Cli {
    /// Address the HTTP API listens on
    #[arg(long, env = "KGW_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Base URL of the kernel gateway
    #[arg(long, env = "KGW_GATEWAY_URL", default_value = "http://localhost:8888")]
    gateway_url: String,

    /// Token sent to the gateway on every request
    #[arg(long, env = "KGW_GATEWAY_TOKEN", hide_env_values = true)]
    gateway_token: String,

    /// Deadline for a single gateway call, in seconds
    #[arg(long, env = "KGW_GATEWAY_TIMEOUT_SECS", default_value_t = 10)]
    gateway_timeout_secs: u64,

    /// Runtimes kernels may be started with
    #[arg(
        long,
        env = "KGW_KNOWN_RUNTIMES",
        value_delimiter = ',',
        default_value = "python3,tfenv"
    )]
    known_runtimes: Vec<String>,

    /// Minutes between idle sweeps
    #[arg(long, env = "KGW_CULL_INTERVAL_MINUTES", default_value_t = 10)]
    cull_interval_minutes: u64,

    /// Kernels idle longer than this many minutes are deleted
    #[arg(long, env = "KGW_IDLE_THRESHOLD_MINUTES", default_value_t = 30)]
    idle_threshold_minutes: u64,

    /// SQLite database path, or `:memory:` for a non-persistent store
    #[arg(long, env = "KGW_DATABASE", default_value = "kgw.db")]
    database: String,

    /// Log filter, e.g. `info` or `kgw_controller=debug`
    #[arg(long, env = "KGW_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Result<ControllerConfig> {
        if self.cull_interval_minutes == 0 {
            anyhow::bail!("cull interval must be at least one minute");
        }
        let gateway = GatewayConfig::new(&self.gateway_url, self.gateway_token)
            .context("invalid gateway configuration")?
            .with_timeout(Duration::from_secs(self.gateway_timeout_secs))
            .with_known_runtimes(
                self.known_runtimes
                    .into_iter()
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty()),
            );
        Ok(ControllerConfig {
            bind: self.bind,
            gateway,
            store: StoreConfig::from_arg(&self.database),
            culler: CullerConfig {
                interval: Duration::from_secs(self.cull_interval_minutes * 60),
                idle_threshold: Duration::from_secs(self.idle_threshold_minutes * 60),
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);
    let config = cli.into_config()?;

    let (shutdown_tx, _) = broadcast::channel(1);

    // Handle Ctrl-C and SIGTERM for graceful shutdown
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                if let Some(ref mut t) = term { t.recv().await; }
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = signal_tx.send(());
    });

    kgw_controller::run(config, shutdown_tx).await
}

fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
