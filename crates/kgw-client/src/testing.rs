//! In-process kernel gateway for tests.
//!
//! `MockGateway` serves the REST control plane and the channels WebSocket on
//! a loopback port. Every request is recorded as `"METHOD /path"` so tests can
//! count control-plane calls. On the channels socket each `execute_request`
//! is answered with `status(busy)`, two `stream` frames, an `execute_reply`
//! and `status(idle)`, all parented to the request.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::Json;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use kgw_protocol::{
    ApiInfo, Envelope, ExecutionState, Kernel, MessageKind, StartKernelRequest,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::{GatewayClient, GatewayConfig, GatewayError};

pub const MOCK_TOKEN: &str = "mock-token";

struct MockState {
    token: String,
    kernels: Mutex<BTreeMap<String, Kernel>>,
    calls: Mutex<Vec<String>>,
    fail_list: AtomicBool,
    next_msg: AtomicU64,
}

pub struct MockGateway {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockGateway {
    pub async fn start() -> std::io::Result<Self> {
        let state = Arc::new(MockState {
            token: MOCK_TOKEN.to_string(),
            kernels: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            fail_list: AtomicBool::new(false),
            next_msg: AtomicU64::new(1),
        });
        let app = Router::new()
            .route("/api", get(api_info))
            .route("/api/kernels", get(list_kernels).post(start_kernel))
            .route("/api/kernels/{id}", get(get_kernel).delete(delete_kernel))
            .route("/api/kernels/{id}/interrupt", post(interrupt_kernel))
            .route("/api/kernels/{id}/restart", post(restart_kernel))
            .route("/api/kernels/{id}/channels", get(channels))
            .layer(middleware::from_fn_with_state(state.clone(), record_and_authorize))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self { addr, state, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn config(&self) -> GatewayConfig {
        GatewayConfig::new(&self.url(), MOCK_TOKEN).expect("mock gateway url is valid")
    }

    pub fn client(&self) -> Result<GatewayClient, GatewayError> {
        GatewayClient::new(self.config())
    }

    /// Recorded calls, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.lock().unwrap().len()
    }

    /// Number of recorded calls matching `"METHOD /path"` exactly.
    pub fn calls_to(&self, call: &str) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }

    pub fn kernel_ids(&self) -> Vec<String> {
        self.state.kernels.lock().unwrap().keys().cloned().collect()
    }

    /// Registers a kernel directly, bypassing the recorded API.
    pub fn insert_kernel(&self, id: &str, last_activity: DateTime<Utc>) -> Kernel {
        let kernel = Kernel {
            id: id.to_string(),
            name: "python3".into(),
            last_activity,
            connections: 0,
            execution_state: ExecutionState::Idle,
        };
        self.state
            .kernels
            .lock()
            .unwrap()
            .insert(kernel.id.clone(), kernel.clone());
        kernel
    }

    /// Makes `GET /api/kernels` answer 500 until cleared.
    pub fn set_list_failure(&self, fail: bool) {
        self.state.fail_list.store(fail, Ordering::SeqCst);
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn record_and_authorize(
    State(state): State<Arc<MockState>>,
    req: Request,
    next: Next,
) -> Response {
    state
        .calls
        .lock()
        .unwrap()
        .push(format!("{} {}", req.method(), req.uri().path()));
    let expected = format!("token {}", state.token);
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !authorized {
        return error(StatusCode::FORBIDDEN, "Forbidden", "missing or invalid token");
    }
    next.run(req).await
}

fn error(status: StatusCode, reason: &str, message: &str) -> Response {
    (status, Json(json!({ "reason": reason, "message": message }))).into_response()
}

fn not_found(id: &str) -> Response {
    error(
        StatusCode::NOT_FOUND,
        "Not Found",
        &format!("Kernel does not exist: {id}"),
    )
}

async fn api_info() -> Json<ApiInfo> {
    Json(ApiInfo {
        version: "2.14.0".into(),
    })
}

async fn list_kernels(State(state): State<Arc<MockState>>) -> Response {
    if state.fail_list.load(Ordering::SeqCst) {
        return error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error",
            "listing is unavailable",
        );
    }
    let kernels: Vec<Kernel> = state.kernels.lock().unwrap().values().cloned().collect();
    Json(kernels).into_response()
}

async fn start_kernel(
    State(state): State<Arc<MockState>>,
    Json(body): Json<StartKernelRequest>,
) -> Response {
    let kernel = Kernel {
        id: uuid::Uuid::new_v4().to_string(),
        name: body.name,
        last_activity: Utc::now(),
        connections: 0,
        execution_state: ExecutionState::Starting,
    };
    state
        .kernels
        .lock()
        .unwrap()
        .insert(kernel.id.clone(), kernel.clone());
    (StatusCode::CREATED, Json(kernel)).into_response()
}

async fn get_kernel(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    match state.kernels.lock().unwrap().get(&id) {
        Some(kernel) => Json(kernel.clone()).into_response(),
        None => not_found(&id),
    }
}

async fn delete_kernel(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    match state.kernels.lock().unwrap().remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => not_found(&id),
    }
}

async fn interrupt_kernel(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
) -> Response {
    if state.kernels.lock().unwrap().contains_key(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(&id)
    }
}

async fn restart_kernel(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    let mut kernels = state.kernels.lock().unwrap();
    match kernels.get_mut(&id) {
        Some(kernel) => {
            kernel.execution_state = ExecutionState::Restarting;
            kernel.last_activity = Utc::now();
            Json(kernel.clone()).into_response()
        }
        None => not_found(&id),
    }
}

async fn channels(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.kernels.lock().unwrap().contains_key(&id) {
        return not_found(&id);
    }
    ws.on_upgrade(move |socket| kernel_session(state, id, socket))
}

async fn kernel_session(state: Arc<MockState>, kernel_id: String, mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(request) = Envelope::parse(text.as_str().as_bytes()) else {
            continue;
        };
        if request.kind() != MessageKind::ExecuteRequest {
            continue;
        }
        touch(&state, &kernel_id);
        let code = request
            .content
            .get("code")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string();
        let parent = &request.header;
        let replies = [
            ("status", json!({ "execution_state": "busy" })),
            ("stream", json!({ "name": "stdout", "text": code })),
            ("stream", json!({ "name": "stdout", "text": "\n" })),
            ("execute_reply", json!({ "status": "ok", "execution_count": 1 })),
            ("status", json!({ "execution_state": "idle" })),
        ];
        for (msg_type, content) in replies {
            let msg_id = format!("mock-{}", state.next_msg.fetch_add(1, Ordering::Relaxed));
            let mut reply = Envelope::reply_to(parent, msg_id, msg_type, content);
            let channel = if msg_type == "execute_reply" { "shell" } else { "iopub" };
            reply.channel = Some(channel.to_string());
            let Ok(bytes) = reply.to_vec() else {
                continue;
            };
            let Ok(text) = String::from_utf8(bytes) else {
                continue;
            };
            if socket.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    }
}

fn touch(state: &MockState, kernel_id: &str) {
    if let Some(kernel) = state.kernels.lock().unwrap().get_mut(kernel_id) {
        kernel.last_activity = Utc::now();
    }
}
