use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use kgw_client::GatewayError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::CullerConfig;
use crate::gateway::SharedGateway;
use crate::relay::RelayRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Swept {
        examined: usize,
        deleted: Vec<String>,
        failed: Vec<String>,
    },
    /// Listing failed and a fresh gateway client was swapped in.
    Reconnected,
    /// Listing failed and so did reconnecting; retried on the next tick.
    ReconnectFailed,
}

/// Periodically deletes kernels that have been idle past a threshold.
pub struct IdleCuller {
    gateway: Arc<SharedGateway>,
    relays: Arc<RelayRegistry>,
    config: CullerConfig,
}

impl IdleCuller {
    pub fn new(
        gateway: Arc<SharedGateway>,
        relays: Arc<RelayRegistry>,
        config: CullerConfig,
    ) -> Self {
        Self {
            gateway,
            relays,
            config,
        }
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Ticks until shutdown. A sweep in progress always runs to completion.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = period.as_secs(),
            idle_threshold_secs = self.config.idle_threshold.as_secs(),
            "idle culler started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.recv() => {
                    tracing::info!("idle culler stopped");
                    return;
                }
            }
            match self.sweep(Utc::now()).await {
                SweepOutcome::Swept {
                    examined,
                    deleted,
                    failed,
                } => tracing::debug!(
                    examined,
                    deleted = deleted.len(),
                    failed = failed.len(),
                    "cull sweep finished"
                ),
                SweepOutcome::Reconnected | SweepOutcome::ReconnectFailed => {}
            }
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepOutcome {
        let client = self.gateway.client();
        let kernels = match client.list_kernels().await {
            Ok(kernels) => kernels,
            Err(err) => {
                tracing::warn!(error = %err, "listing kernels failed; reconnecting to gateway");
                return match self.gateway.reconnect().await {
                    Ok(_) => SweepOutcome::Reconnected,
                    Err(err) => {
                        tracing::error!(error = %err, "gateway reconnect failed");
                        SweepOutcome::ReconnectFailed
                    }
                };
            }
        };

        let threshold = TimeDelta::from_std(self.config.idle_threshold).unwrap_or(TimeDelta::MAX);
        let examined = kernels.len();
        let mut deleted = Vec::new();
        let mut failed = Vec::new();
        for kernel in kernels {
            let idle = kernel.idle_for(now);
            if idle <= threshold {
                continue;
            }
            let idle_minutes = idle.num_minutes();
            match client.delete_kernel(&kernel.id).await {
                Ok(()) | Err(GatewayError::NotFound(_)) => {
                    tracing::info!(kernel_id = %kernel.id, idle_minutes, "culled idle kernel");
                    self.relays.teardown(&kernel.id);
                    deleted.push(kernel.id);
                }
                Err(err) => {
                    tracing::warn!(
                        kernel_id = %kernel.id,
                        idle_minutes,
                        error = %err,
                        "failed to cull kernel"
                    );
                    failed.push(kernel.id);
                }
            }
        }
        SweepOutcome::Swept {
            examined,
            deleted,
            failed,
        }
    }
}
