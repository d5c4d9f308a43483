//! Bidirectional proxy between a browser socket and a kernel's channels
//! socket.
//!
//! A relay runs two pumps, one per direction. Each pump reads a frame,
//! inspects it and forwards it unmodified. Client-to-kernel inspection records
//! `execute_request` correlations; kernel-to-client inspection hands a copy of
//! the frame to the session's persistence queue. Ping and pong frames are
//! answered by each socket itself and never cross. When either pump stops, it
//! closes the connection it writes to and tells the other pump to stop too, so
//! a relay never ends half-open.

mod registry;
pub mod ws;

pub use registry::RelayRegistry;

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use kgw_protocol::Envelope;
use tokio::sync::{broadcast, oneshot, watch};

use crate::persister::PersistQueue;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self.code, CLOSE_NORMAL | CLOSE_GOING_AWAY)
    }
}

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

impl Frame {
    /// Message bytes of data frames.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Frame::Text(text) => Some(text.as_bytes()),
            Frame::Binary(bytes) => Some(&bytes[..]),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("client socket: {0}")]
    Client(String),
    #[error("kernel socket: {0}")]
    Kernel(String),
    #[error("could not connect to kernel {kernel_id}: {message}")]
    Connect { kernel_id: String, message: String },
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = RelayError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, RelayError>> + Send>>;

/// One side of a relay: where frames are written and where they are read.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new<S, T>(sink: S, stream: T) -> Self
    where
        S: Sink<Frame, Error = RelayError> + Send + 'static,
        T: Stream<Item = Result<Frame, RelayError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Connecting,
    Proxying,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToKernel,
    KernelToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToKernel => "client->kernel",
            Direction::KernelToClient => "kernel->client",
        }
    }
}

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpEnd {
    /// The source sent a close frame, which was forwarded.
    SourceClosed(Option<CloseReason>),
    SourceEnded,
    ReadError(String),
    WriteError(String),
    /// The opposite pump stopped first.
    PeerStopped,
    TornDown,
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpSummary {
    pub direction: Direction,
    pub frames: u64,
    pub end: PumpEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub client_to_kernel: PumpSummary,
    pub kernel_to_client: PumpSummary,
}

pub struct Relay {
    kernel_id: String,
    persist: PersistQueue,
    state: watch::Sender<RelayState>,
    teardown: [broadcast::Receiver<()>; 2],
}

impl Relay {
    pub fn new(
        kernel_id: impl Into<String>,
        persist: PersistQueue,
        teardown: broadcast::Receiver<()>,
    ) -> Self {
        let (state, _) = watch::channel(RelayState::Connecting);
        let second = teardown.resubscribe();
        Self {
            kernel_id: kernel_id.into(),
            persist,
            state,
            teardown: [teardown, second],
        }
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    /// Proxies until both directions have stopped.
    pub async fn run(self, client: Connection, kernel: Connection) -> RelayReport {
        let Relay {
            kernel_id,
            persist,
            state,
            teardown: [teardown_up, teardown_down],
        } = self;

        state.send_replace(RelayState::Proxying);
        tracing::info!(%kernel_id, "relay established");

        let (stop_up_tx, stop_up_rx) = oneshot::channel();
        let (stop_down_tx, stop_down_rx) = oneshot::channel();

        let request_kernel = kernel_id.clone();
        let requests = persist.clone();
        let mut upstream = tokio::spawn(pump(
            Direction::ClientToKernel,
            kernel_id.clone(),
            client.stream,
            kernel.sink,
            stop_up_rx,
            stop_down_tx,
            teardown_up,
            move |frame: &Frame| record_request(&requests, &request_kernel, frame),
        ));
        let mut downstream = tokio::spawn(pump(
            Direction::KernelToClient,
            kernel_id.clone(),
            kernel.stream,
            client.sink,
            stop_down_rx,
            stop_up_tx,
            teardown_down,
            move |frame: &Frame| {
                if let Some(payload) = frame.payload() {
                    persist.enqueue(Bytes::copy_from_slice(payload));
                }
            },
        ));

        let (up, down) = tokio::select! {
            up = &mut upstream => {
                state.send_replace(RelayState::Closing);
                (up, downstream.await)
            }
            down = &mut downstream => {
                state.send_replace(RelayState::Closing);
                (upstream.await, down)
            }
        };

        let report = RelayReport {
            client_to_kernel: joined(Direction::ClientToKernel, up),
            kernel_to_client: joined(Direction::KernelToClient, down),
        };
        state.send_replace(RelayState::Closed);
        tracing::info!(
            %kernel_id,
            sent = report.client_to_kernel.frames,
            received = report.kernel_to_client.frames,
            "relay closed"
        );
        report
    }
}

fn joined(
    direction: Direction,
    result: Result<PumpSummary, tokio::task::JoinError>,
) -> PumpSummary {
    result.unwrap_or_else(|err| PumpSummary {
        direction,
        frames: 0,
        end: PumpEnd::Aborted(err.to_string()),
    })
}

fn record_request(requests: &PersistQueue, kernel_id: &str, frame: &Frame) {
    let Some(payload) = frame.payload() else {
        return;
    };
    let Ok(envelope) = Envelope::parse(payload) else {
        return;
    };
    let Some(cell_id) = envelope.cell_reference() else {
        return;
    };
    if envelope.msg_id().is_empty() {
        return;
    }
    if requests.record_request(envelope.msg_id(), cell_id) {
        tracing::debug!(kernel_id, %cell_id, msg_id = envelope.msg_id(), "execute request recorded");
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump<F>(
    direction: Direction,
    kernel_id: String,
    mut source: FrameStream,
    mut dest: FrameSink,
    mut stop: oneshot::Receiver<()>,
    peer_stop: oneshot::Sender<()>,
    mut teardown: broadcast::Receiver<()>,
    inspect: F,
) -> PumpSummary
where
    F: Fn(&Frame) + Send,
{
    let mut frames = 0u64;
    let end = loop {
        let next = tokio::select! {
            next = source.next() => next,
            _ = &mut stop => break PumpEnd::PeerStopped,
            _ = teardown.recv() => break PumpEnd::TornDown,
        };
        let frame = match next {
            None => break PumpEnd::SourceEnded,
            Some(Err(err)) => break PumpEnd::ReadError(err.to_string()),
            Some(Ok(frame)) => frame,
        };
        if let Frame::Close(reason) = frame {
            let _ = dest.send(Frame::Close(reason.clone())).await;
            break PumpEnd::SourceClosed(reason);
        }
        if matches!(frame, Frame::Ping(_) | Frame::Pong(_)) {
            continue;
        }
        inspect(&frame);
        if let Err(err) = dest.send(frame).await {
            break PumpEnd::WriteError(err.to_string());
        }
        frames += 1;
    };

    // A teardown reaches both pumps; whichever stops second still says goodbye.
    let end = match end {
        PumpEnd::PeerStopped if teardown.try_recv().is_ok() => PumpEnd::TornDown,
        other => other,
    };
    let _ = peer_stop.send(());
    if end == PumpEnd::TornDown {
        let going_away = CloseReason::new(CLOSE_GOING_AWAY, "kernel shut down");
        let farewell = dest.send(Frame::Close(Some(going_away)));
        let _ = tokio::time::timeout(CLOSE_GRACE, farewell).await;
    }
    let _ = tokio::time::timeout(CLOSE_GRACE, dest.close()).await;

    let direction_name = direction.as_str();
    match &end {
        PumpEnd::SourceClosed(Some(reason)) if !reason.is_normal() => {
            tracing::warn!(
                %kernel_id,
                direction = direction_name,
                code = reason.code,
                reason = %reason.reason,
                "socket closed abnormally"
            );
        }
        PumpEnd::ReadError(err) | PumpEnd::WriteError(err) => {
            tracing::warn!(
                %kernel_id,
                direction = direction_name,
                error = %err,
                "relay pump failed"
            );
        }
        other => {
            tracing::debug!(
                %kernel_id,
                direction = direction_name,
                end = ?other,
                frames,
                "relay pump stopped"
            );
        }
    }

    PumpSummary {
        direction,
        frames,
        end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationTable;
    use crate::persister::{OutputPersister, PersistStats};
    use std::sync::Arc;
    use crate::store::{MemStore, Store};
    use futures::channel::mpsc;
    use serde_json::json;
    use uuid::Uuid;

    /// Test-side handle on one relay connection.
    struct Peer {
        inbound: mpsc::UnboundedSender<Result<Frame, RelayError>>,
        outbound: mpsc::UnboundedReceiver<Frame>,
    }

    fn pipe() -> (Connection, Peer) {
        let (out_tx, out_rx) = mpsc::unbounded::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded::<Result<Frame, RelayError>>();
        let sink = out_tx.sink_map_err(|e| RelayError::Client(e.to_string()));
        (
            Connection::new(sink, in_rx),
            Peer {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }

    fn text(value: serde_json::Value) -> Frame {
        Frame::Text(value.to_string())
    }

    struct Harness {
        correlations: Arc<CorrelationTable>,
        store: Arc<MemStore>,
        registry: RelayRegistry,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                correlations: Arc::new(CorrelationTable::new()),
                store: Arc::new(MemStore::new()),
                registry: RelayRegistry::new(),
            }
        }

        fn relay(&self) -> (Relay, tokio::task::JoinHandle<PersistStats>) {
            let persister = OutputPersister::new(self.correlations.clone(), self.store.clone());
            let (queue, worker) = persister.spawn_worker();
            let relay = Relay::new("k1", queue, self.registry.subscribe("k1"));
            (relay, worker)
        }
    }

    #[tokio::test]
    async fn proxies_and_persists_a_full_execution() {
        let harness = Harness::new();
        let (relay, worker) = harness.relay();
        let (client, mut browser) = pipe();
        let (kernel, mut gateway) = pipe();
        let run = tokio::spawn(relay.run(client, kernel));

        let cell = Uuid::new_v4();
        let request = text(json!({
            "header": {"msg_id": "req-1", "msg_type": "execute_request"},
            "parent_header": {},
            "metadata": {"cell_id": cell.to_string()},
            "content": {"code": "print('hi')"}
        }));
        browser.inbound.unbounded_send(Ok(request.clone())).unwrap();
        assert_eq!(gateway.outbound.next().await, Some(request));
        assert_eq!(
            harness.correlations.lookup("req-1").map(|e| e.cell_id),
            Some(cell)
        );

        let replies = [
            json!({"header": {"msg_id": "a", "msg_type": "stream"}, "parent_header": {"msg_id": "req-1"},
                   "content": {"name": "stdout", "text": "hi"}}),
            json!({"header": {"msg_id": "b", "msg_type": "stream"}, "parent_header": {"msg_id": "req-1"},
                   "content": {"name": "stdout", "text": "\n"}}),
            json!({"header": {"msg_id": "c", "msg_type": "execute_reply"}, "parent_header": {"msg_id": "req-1"},
                   "content": {"status": "ok"}}),
        ];
        for reply in replies {
            let frame = text(reply);
            gateway.inbound.unbounded_send(Ok(frame.clone())).unwrap();
            assert_eq!(browser.outbound.next().await, Some(frame));
        }

        let close = Frame::Close(Some(CloseReason::new(CLOSE_NORMAL, "bye")));
        browser.inbound.unbounded_send(Ok(close.clone())).unwrap();
        let report = run.await.unwrap();
        assert_eq!(
            report.client_to_kernel.end,
            PumpEnd::SourceClosed(Some(CloseReason::new(CLOSE_NORMAL, "bye")))
        );
        assert_eq!(report.kernel_to_client.end, PumpEnd::PeerStopped);
        assert_eq!(report.kernel_to_client.frames, 3);
        assert_eq!(gateway.outbound.next().await, Some(close));
        assert_eq!(gateway.outbound.next().await, None);

        let stats = worker.await.unwrap();
        assert_eq!(stats.stored, 2);
        assert_eq!(stats.replies, 1);
        let indices: Vec<u32> = harness
            .store
            .list_outputs(cell)
            .unwrap()
            .iter()
            .map(|o| o.output_index)
            .collect();
        assert_eq!(indices, vec![0, 1]);
        assert!(harness.correlations.is_empty());
    }

    #[tokio::test]
    async fn read_failure_closes_both_sides() {
        let harness = Harness::new();
        let (relay, _worker) = harness.relay();
        let mut state = relay.state();
        let (client, mut browser) = pipe();
        let (kernel, mut gateway) = pipe();
        let run = tokio::spawn(relay.run(client, kernel));

        state.wait_for(|s| *s == RelayState::Proxying).await.unwrap();
        gateway
            .inbound
            .unbounded_send(Err(RelayError::Kernel("connection reset".into())))
            .unwrap();

        let report = run.await.unwrap();
        assert!(matches!(report.kernel_to_client.end, PumpEnd::ReadError(_)));
        assert_eq!(report.client_to_kernel.end, PumpEnd::PeerStopped);
        assert_eq!(*state.borrow(), RelayState::Closed);
        // Both write halves were closed.
        assert_eq!(browser.outbound.next().await, None);
        assert_eq!(gateway.outbound.next().await, None);
    }

    #[tokio::test]
    async fn client_disconnect_closes_kernel_side() {
        let harness = Harness::new();
        let (relay, _worker) = harness.relay();
        let (client, browser) = pipe();
        let (kernel, mut gateway) = pipe();
        let run = tokio::spawn(relay.run(client, kernel));

        drop(browser.inbound);
        let report = run.await.unwrap();
        assert_eq!(report.client_to_kernel.end, PumpEnd::SourceEnded);
        assert_eq!(gateway.outbound.next().await, None);
    }

    #[tokio::test]
    async fn teardown_sends_going_away_to_both_sides() {
        let harness = Harness::new();
        let (relay, _worker) = harness.relay();
        let mut state = relay.state();
        let (client, mut browser) = pipe();
        let (kernel, mut gateway) = pipe();
        let run = tokio::spawn(relay.run(client, kernel));
        state.wait_for(|s| *s == RelayState::Proxying).await.unwrap();

        assert!(harness.registry.teardown("k1") > 0);
        let report = run.await.unwrap();
        assert_eq!(report.client_to_kernel.end, PumpEnd::TornDown);
        assert_eq!(report.kernel_to_client.end, PumpEnd::TornDown);

        let going_away = Frame::Close(Some(CloseReason::new(CLOSE_GOING_AWAY, "kernel shut down")));
        let browser_frames: Vec<Frame> = browser.outbound.collect().await;
        let gateway_frames: Vec<Frame> = gateway.outbound.collect().await;
        assert_eq!(browser_frames, vec![going_away.clone()]);
        assert_eq!(gateway_frames, vec![going_away]);
    }

    #[tokio::test]
    async fn malformed_client_frames_are_forwarded_untouched() {
        let harness = Harness::new();
        let (relay, _worker) = harness.relay();
        let (client, mut browser) = pipe();
        let (kernel, mut gateway) = pipe();
        let run = tokio::spawn(relay.run(client, kernel));

        let junk = Frame::Text("{not json".into());
        browser.inbound.unbounded_send(Ok(junk.clone())).unwrap();
        assert_eq!(gateway.outbound.next().await, Some(junk));
        let binary = Frame::Binary(Bytes::from_static(b"\x01\x02"));
        browser.inbound.unbounded_send(Ok(binary.clone())).unwrap();
        assert_eq!(gateway.outbound.next().await, Some(binary));
        assert!(harness.correlations.is_empty());

        drop(browser.inbound);
        let report = run.await.unwrap();
        assert_eq!(report.client_to_kernel.frames, 2);
        let _ = browser.outbound.next().await;
    }

    fn execute_request(msg_id: &str, cell: Uuid) -> Frame {
        text(json!({
            "header": {"msg_id": msg_id, "msg_type": "execute_request"},
            "parent_header": {},
            "metadata": {"cell_id": cell.to_string()},
            "content": {"code": "print('hi')"}
        }))
    }

    #[tokio::test]
    async fn broadcast_output_is_stored_once_across_relays() {
        let harness = Harness::new();
        let (first, first_worker) = harness.relay();
        let (second, second_worker) = harness.relay();
        let (client_a, mut browser_a) = pipe();
        let (kernel_a, mut gateway_a) = pipe();
        let (client_b, mut browser_b) = pipe();
        let (kernel_b, gateway_b) = pipe();
        let run_a = tokio::spawn(first.run(client_a, kernel_a));
        let run_b = tokio::spawn(second.run(client_b, kernel_b));

        let cell = Uuid::new_v4();
        let request = execute_request("req", cell);
        browser_a.inbound.unbounded_send(Ok(request.clone())).unwrap();
        assert_eq!(gateway_a.outbound.next().await, Some(request));

        // The gateway broadcasts output to every socket of the kernel.
        let output = text(json!({
            "header": {"msg_id": "o1", "msg_type": "stream"},
            "parent_header": {"msg_id": "req"},
            "content": {"name": "stdout", "text": "hi"}
        }));
        for (gateway, browser) in [(&gateway_a, &mut browser_a), (&gateway_b, &mut browser_b)] {
            gateway.inbound.unbounded_send(Ok(output.clone())).unwrap();
            assert_eq!(browser.outbound.next().await, Some(output.clone()));
        }

        // The second relay drains while the first one's request is still live.
        drop(browser_b.inbound);
        run_b.await.unwrap();
        let second_stats = second_worker.await.unwrap();
        drop(browser_a.inbound);
        run_a.await.unwrap();
        let first_stats = first_worker.await.unwrap();

        assert_eq!(first_stats.stored, 1);
        assert_eq!(second_stats.stored, 0);
        assert_eq!(second_stats.foreign, 1);
        assert_eq!(harness.store.count_outputs(cell).unwrap(), 1);
        assert!(harness.correlations.is_empty());
    }

    #[tokio::test]
    async fn kernel_failure_mid_execution_releases_correlations() {
        let harness = Harness::new();
        let (relay, worker) = harness.relay();
        let (client, browser) = pipe();
        let (kernel, mut gateway) = pipe();
        let run = tokio::spawn(relay.run(client, kernel));

        let request = execute_request("req-1", Uuid::new_v4());
        browser.inbound.unbounded_send(Ok(request.clone())).unwrap();
        assert_eq!(gateway.outbound.next().await, Some(request));
        assert_eq!(harness.correlations.len(), 1);

        gateway
            .inbound
            .unbounded_send(Err(RelayError::Kernel("kernel died".into())))
            .unwrap();
        let report = run.await.unwrap();
        assert!(matches!(report.kernel_to_client.end, PumpEnd::ReadError(_)));

        let stats = worker.await.unwrap();
        assert_eq!(stats.abandoned, 1);
        assert!(harness.correlations.is_empty());
    }

    #[tokio::test]
    async fn control_frames_stay_on_their_own_socket() {
        let harness = Harness::new();
        let (relay, _worker) = harness.relay();
        let (client, mut browser) = pipe();
        let (kernel, mut gateway) = pipe();
        let run = tokio::spawn(relay.run(client, kernel));

        let ping = Frame::Ping(Bytes::from_static(b"hb"));
        let pong = Frame::Pong(Bytes::from_static(b"hb"));
        let data = Frame::Text("{}".into());
        browser.inbound.unbounded_send(Ok(ping.clone())).unwrap();
        browser.inbound.unbounded_send(Ok(data.clone())).unwrap();
        assert_eq!(gateway.outbound.next().await, Some(data.clone()));
        gateway.inbound.unbounded_send(Ok(pong)).unwrap();
        gateway.inbound.unbounded_send(Ok(data.clone())).unwrap();
        assert_eq!(browser.outbound.next().await, Some(data));

        drop(browser.inbound);
        let report = run.await.unwrap();
        assert_eq!(report.client_to_kernel.frames, 1);
        assert_eq!(report.kernel_to_client.frames, 1);
    }
}
