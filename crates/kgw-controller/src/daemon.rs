use std::sync::Arc;

use anyhow::{Context, Result};
use kgw_client::GatewayClient;
use tokio::sync::broadcast;

use crate::config::ControllerConfig;
use crate::correlation::CorrelationTable;
use crate::culler::IdleCuller;
use crate::gateway::SharedGateway;
use crate::http::{self, AppState};
use crate::relay::RelayRegistry;
use crate::store;

/// Runs the controller until `shutdown_tx` fires.
///
/// An unreachable gateway at startup is not fatal: the client is built
/// without probing and the culler reconnects on its first failed sweep.
pub async fn run(config: ControllerConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let client = match GatewayClient::connect(config.gateway.clone()).await {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(
                gateway = %config.gateway.base_url(),
                error = %err,
                "gateway not reachable at startup; continuing"
            );
            GatewayClient::new(config.gateway.clone()).context("build gateway client")?
        }
    };
    let gateway = Arc::new(SharedGateway::new(client));
    let store = store::open(&config.store).context("open store")?;
    let correlations = Arc::new(CorrelationTable::new());
    let relays = Arc::new(RelayRegistry::new());

    let culler = IdleCuller::new(gateway.clone(), relays.clone(), config.culler)
        .spawn(shutdown_tx.subscribe());

    let state = AppState::new(gateway, store, correlations, relays.clone());
    let http_handle = http::spawn_http_server(config.bind, state, shutdown_tx.clone());
    tracing::info!(
        "HTTP docs available at http://{}/api/docs/ (OpenAPI: /api/openapi.json)",
        config.bind
    );

    let _ = shutdown_rx.recv().await;
    let closed = relays.teardown_all();
    tracing::info!(relays = closed, "shutting down");

    let _ = culler.await;
    let _ = http_handle.await;
    Ok(())
}
