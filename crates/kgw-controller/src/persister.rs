use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use kgw_protocol::{Envelope, KernelMessage, MessageKind};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::correlation::CorrelationTable;
use crate::model::CellOutput;
use crate::store::DynStore;

/// Frames a persistence worker may have queued before new ones are dropped.
pub const QUEUE_CAPACITY: usize = 1024;

/// What became of one kernel-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored { cell_id: Uuid, output_index: u32 },
    /// `execute_reply` observed; the correlation entry for `request` was dropped.
    ReplyObserved { cell_id: Uuid, request: String },
    Ignored,
    /// Output whose parent request was never recorded or already completed.
    Orphan,
    /// Output for a request another relay recorded and persists.
    Foreign,
    Malformed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub stored: usize,
    pub replies: usize,
    pub ignored: usize,
    pub orphans: usize,
    pub foreign: usize,
    pub malformed: usize,
    pub failed: usize,
    /// Requests still in flight when the relay closed.
    pub abandoned: usize,
}

impl PersistStats {
    fn record(&mut self, outcome: &PersistOutcome) {
        match outcome {
            PersistOutcome::Stored { .. } => self.stored += 1,
            PersistOutcome::ReplyObserved { .. } => self.replies += 1,
            PersistOutcome::Ignored => self.ignored += 1,
            PersistOutcome::Orphan => self.orphans += 1,
            PersistOutcome::Foreign => self.foreign += 1,
            PersistOutcome::Malformed => self.malformed += 1,
            PersistOutcome::Failed => self.failed += 1,
        }
    }
}

/// Turns kernel output frames into stored cell outputs for one relay.
///
/// Every persister carries its own relay id. It stores output only for
/// requests recorded under that id, so a kernel watched by several relays
/// gets each output written once.
#[derive(Clone)]
pub struct OutputPersister {
    correlations: Arc<CorrelationTable>,
    store: DynStore,
    relay_id: Uuid,
}

impl OutputPersister {
    pub fn new(correlations: Arc<CorrelationTable>, store: DynStore) -> Self {
        Self {
            correlations,
            store,
            relay_id: Uuid::new_v4(),
        }
    }

    pub fn relay_id(&self) -> Uuid {
        self.relay_id
    }

    /// Processes one frame. Never fails; problems are logged and reported in
    /// the outcome.
    pub fn handle(&self, frame: &[u8]) -> PersistOutcome {
        let envelope = match Envelope::parse(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(error = %err, "skipping unparseable kernel frame");
                return PersistOutcome::Malformed;
            }
        };
        let kind = envelope.kind();
        if !kind.is_output() && kind != MessageKind::ExecuteReply {
            return PersistOutcome::Ignored;
        }

        let msg_type = envelope.header.msg_type.as_str();
        let Some(parent_msg_id) = envelope.parent_msg_id() else {
            tracing::warn!(msg_type, msg_id = envelope.msg_id(), "output without parent header");
            return PersistOutcome::Orphan;
        };
        let Some(entry) = self.correlations.lookup(parent_msg_id) else {
            tracing::warn!(
                msg_type,
                parent_msg_id,
                "no cell recorded for parent message; dropping output"
            );
            return PersistOutcome::Orphan;
        };
        if entry.relay_id != self.relay_id {
            return PersistOutcome::Foreign;
        }
        let cell_id = entry.cell_id;

        let payload = match envelope.decode() {
            Ok(KernelMessage::Output(payload)) => payload,
            Ok(KernelMessage::ExecuteReply) => {
                self.correlations.forget(parent_msg_id, self.relay_id);
                tracing::debug!(%cell_id, parent_msg_id, "execution complete");
                return PersistOutcome::ReplyObserved {
                    cell_id,
                    request: parent_msg_id.to_string(),
                };
            }
            Ok(_) => return PersistOutcome::Ignored,
            Err(err) => {
                tracing::warn!(%cell_id, msg_type, error = %err, "dropping malformed output");
                return PersistOutcome::Malformed;
            }
        };

        let output_index = match self.store.count_outputs(cell_id) {
            Ok(count) => count,
            Err(err) => {
                tracing::error!(%cell_id, error = %err, "failed to count cell outputs");
                return PersistOutcome::Failed;
            }
        };
        let output = CellOutput {
            id: Uuid::new_v4(),
            cell_id,
            output_index,
            kind: payload.kind(),
            data: payload.data(),
            blob_ref: None,
            execution_count: payload.execution_count(),
        };
        match self.store.insert_output(&output) {
            Ok(()) => {
                tracing::debug!(%cell_id, output_index, kind = %output.kind, "cell output stored");
                PersistOutcome::Stored {
                    cell_id,
                    output_index,
                }
            }
            Err(err) => {
                tracing::error!(%cell_id, output_index, error = %err, "failed to store cell output");
                PersistOutcome::Failed
            }
        }
    }

    /// Drops the correlation entries of requests that never got a reply.
    fn release(&self, pending: HashSet<String>) -> usize {
        let released = pending
            .iter()
            .filter(|msg_id| self.correlations.forget(msg_id, self.relay_id).is_some())
            .count();
        if released > 0 {
            tracing::debug!(relay_id = %self.relay_id, released, "released unfinished executions");
        }
        released
    }

    /// Starts a worker that persists queued frames strictly in arrival order.
    /// The worker ends once every [`PersistQueue`] handle is dropped and the
    /// backlog is drained, then forgets whatever its relay left in flight.
    pub fn spawn_worker(&self) -> (PersistQueue, JoinHandle<PersistStats>) {
        self.spawn_worker_with_capacity(QUEUE_CAPACITY)
    }

    pub fn spawn_worker_with_capacity(
        &self,
        capacity: usize,
    ) -> (PersistQueue, JoinHandle<PersistStats>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity);
        let persister = self.clone();
        let handle = tokio::spawn(async move {
            let mut stats = PersistStats::default();
            let mut pending = HashSet::new();
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Pending(msg_id) => {
                        pending.insert(msg_id);
                    }
                    Job::Frame(frame) => {
                        let outcome = persister.handle(&frame);
                        if let PersistOutcome::ReplyObserved { request, .. } = &outcome {
                            pending.remove(request);
                        }
                        stats.record(&outcome);
                    }
                }
            }
            stats.abandoned = persister.release(pending);
            stats
        });
        let queue = PersistQueue {
            tx,
            correlations: self.correlations.clone(),
            relay_id: self.relay_id,
        };
        (queue, handle)
    }
}

#[derive(Debug)]
enum Job {
    Pending(String),
    Frame(Bytes),
}

/// Sending half of a persistence worker. Never waits: when the worker falls
/// behind, work is dropped with a warning.
#[derive(Clone, Debug)]
pub struct PersistQueue {
    tx: mpsc::Sender<Job>,
    correlations: Arc<CorrelationTable>,
    relay_id: Uuid,
}

impl PersistQueue {
    /// Records that the request `msg_id` runs `cell_id` on this queue's relay.
    /// Nothing is recorded when the worker cannot track the request.
    pub fn record_request(&self, msg_id: &str, cell_id: Uuid) -> bool {
        match self.tx.try_send(Job::Pending(msg_id.to_string())) {
            Ok(()) => {
                self.correlations.record(msg_id, self.relay_id, cell_id);
                true
            }
            Err(err) => {
                tracing::warn!(%cell_id, msg_id, reason = %send_failure(&err), "execute request not recorded");
                false
            }
        }
    }

    pub fn enqueue(&self, frame: Bytes) -> bool {
        match self.tx.try_send(Job::Frame(frame)) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(reason = %send_failure(&err), "output frame dropped");
                false
            }
        }
    }
}

fn send_failure<T>(err: &TrySendError<T>) -> &'static str {
    match err {
        TrySendError::Full(_) => "persistence queue is full",
        TrySendError::Closed(_) => "persistence worker is gone",
    }
}
