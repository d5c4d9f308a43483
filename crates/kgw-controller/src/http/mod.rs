pub mod api;
mod caller;
mod channels;

pub use caller::{CALLER_HEADER, Caller};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use utoipa_swagger_ui::SwaggerUi;

use crate::correlation::CorrelationTable;
use crate::gateway::SharedGateway;
use crate::relay::RelayRegistry;
use crate::sessions::SessionManager;
use crate::store::DynStore;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<SharedGateway>,
    pub store: DynStore,
    pub sessions: SessionManager,
    pub correlations: Arc<CorrelationTable>,
    pub relays: Arc<RelayRegistry>,
}

impl AppState {
    pub fn new(
        gateway: Arc<SharedGateway>,
        store: DynStore,
        correlations: Arc<CorrelationTable>,
        relays: Arc<RelayRegistry>,
    ) -> Self {
        let sessions = SessionManager::new(gateway.clone(), store.clone(), relays.clone());
        Self {
            gateway,
            store,
            sessions,
            correlations,
            relays,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/api/docs").url("/api/openapi.json", api::openapi()))
        .route("/health", get(api::health))
        .nest("/api/v1", api::router())
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

pub fn spawn_http_server(
    bind: SocketAddr,
    state: AppState,
    shutdown_tx: broadcast::Sender<()>,
) -> JoinHandle<()> {
    let app = router(state);
    tokio::spawn(async move {
        if let Err(err) = serve(bind, app, shutdown_tx).await {
            tracing::error!("http server error: {err}");
        }
    })
}

pub async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), String> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind {addr}: {e}"))?;
    serve_listener(listener, app, shutdown_tx).await
}

/// Serves on an already bound listener until shutdown is signalled.
pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), String> {
    let addr = listener
        .local_addr()
        .map_err(|e| format!("local address: {e}"))?;
    tracing::info!("HTTP server listening on http://{}", addr);
    let mut shutdown_rx = shutdown_tx.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .map_err(|e| format!("serve {addr}: {e}"))
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;
    if response.status().is_server_error() {
        tracing::error!(%method, %path, status, latency_ms, "request failed");
    } else if response.status().is_client_error() {
        tracing::warn!(%method, %path, status, latency_ms, "request rejected");
    } else {
        tracing::info!(%method, %path, status, latency_ms, "request handled");
    }
    response
}
