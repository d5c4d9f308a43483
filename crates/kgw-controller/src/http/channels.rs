use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures_util::SinkExt;

use super::AppState;
use crate::persister::OutputPersister;
use crate::relay::{CLOSE_INTERNAL_ERROR, CloseReason, Frame, Relay, ws};

pub(crate) async fn kernel_channels(
    State(state): State<AppState>,
    Path(kernel_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| relay_session(state, kernel_id, socket))
}

async fn relay_session(state: AppState, kernel_id: String, socket: WebSocket) {
    let mut client = ws::client_connection(socket);
    let persister = OutputPersister::new(state.correlations.clone(), state.store.clone());
    let (queue, worker) = persister.spawn_worker();
    let relay = Relay::new(kernel_id.clone(), queue, state.relays.subscribe(&kernel_id));

    let gateway = state.gateway.client();
    match ws::dial_kernel(&gateway, &kernel_id).await {
        Ok(kernel) => {
            let report = relay.run(client, kernel).await;
            tracing::debug!(%kernel_id, ?report, "relay report");
        }
        Err(err) => {
            tracing::warn!(%kernel_id, error = %err, "could not reach kernel channels");
            drop(relay);
            let close = CloseReason::new(CLOSE_INTERNAL_ERROR, "could not connect to kernel");
            let _ = client.sink.send(Frame::Close(Some(close))).await;
            let _ = client.sink.close().await;
        }
    }
    state.relays.release(&kernel_id);

    match worker.await {
        Ok(stats) => tracing::debug!(%kernel_id, ?stats, "output persistence drained"),
        Err(err) => tracing::error!(%kernel_id, error = %err, "output persistence worker failed"),
    }
}
