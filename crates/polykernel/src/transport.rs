//! Duplex message channel between the manager and an out-of-thread kernel.
//!
//! ## Design
//!
//! A launched kernel is driven exclusively through messages: the manager
//! holds a [`WorkerTransport`] (request sender + reply receiver) and the
//! engine holds the matching [`EngineEndpoint`]. The two halves are created
//! together by [`duplex`]; the launcher hands one to the engine it spawns
//! and returns the other.
//!
//! Outbound requests are `EXECUTE(code, execution_id)`, `INTERRUPT`, and
//! `DISPOSE`. Inbound replies are `READY` plus the kernel event kinds.
//! A kernel is not usable until `READY` has been observed; the manager
//! awaits it before returning from create.
//!
//! For message-based interrupt (no shared memory region) `INTERRUPT` races
//! with `EXECUTE`; engines are required to poll their request queue at safe
//! points, which is what [`EngineEndpoint::poll_request`] is for.

use tokio::sync::mpsc;

use crate::events::KernelEvent;

/// Bounded channel capacity for each direction of a kernel transport.
pub const TRANSPORT_BUFFER: usize = 64;

/// Message from the manager to the kernel engine.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    Execute { code: String, execution_id: u64 },
    Interrupt,
    Dispose,
}

/// Message from the kernel engine to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    /// Startup handshake; the kernel is usable once this is observed.
    Ready,
    /// A kernel event attributed to one execution.
    Event {
        execution_id: u64,
        event: KernelEvent,
    },
}

/// The far side of the transport has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker transport closed")]
pub struct TransportClosed;

/// Manager-side half of a kernel channel.
#[derive(Debug)]
pub struct WorkerTransport {
    request_tx: mpsc::Sender<WorkerRequest>,
    reply_rx: mpsc::Receiver<WorkerReply>,
}

impl WorkerTransport {
    pub async fn send(&self, request: WorkerRequest) -> Result<(), TransportClosed> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| TransportClosed)
    }

    pub async fn recv(&mut self) -> Option<WorkerReply> {
        self.reply_rx.recv().await
    }

    /// A clone of the request sender, for paths that must bypass the
    /// execute queue (interrupt delivery, dispose).
    pub fn sender(&self) -> mpsc::Sender<WorkerRequest> {
        self.request_tx.clone()
    }

    /// Splits the transport into its raw halves. Used when the reply stream
    /// moves into a dedicated pump task.
    pub fn split(self) -> (mpsc::Sender<WorkerRequest>, mpsc::Receiver<WorkerReply>) {
        (self.request_tx, self.reply_rx)
    }
}

/// Engine-side half of a kernel channel.
#[derive(Debug)]
pub struct EngineEndpoint {
    requests: mpsc::Receiver<WorkerRequest>,
    replies: mpsc::Sender<WorkerReply>,
}

impl EngineEndpoint {
    /// Sends the `READY` handshake. Returns `false` if the manager side is
    /// already gone.
    pub async fn ready(&self) -> bool {
        self.replies.send(WorkerReply::Ready).await.is_ok()
    }

    /// Emits one event attributed to `execution_id`. Returns `false` if the
    /// manager side is already gone.
    pub async fn emit(&self, execution_id: u64, event: KernelEvent) -> bool {
        self.replies
            .send(WorkerReply::Event {
                execution_id,
                event,
            })
            .await
            .is_ok()
    }

    /// Blocks until the next request, or `None` once the manager side is
    /// dropped.
    pub async fn next_request(&mut self) -> Option<WorkerRequest> {
        self.requests.recv().await
    }

    /// Non-blocking request check for safe-point polling during an
    /// execution. Returns `None` when the queue is empty *or* closed; a
    /// closed queue also surfaces through [`next_request`](Self::next_request)
    /// at the end of the execution.
    pub fn poll_request(&mut self) -> Option<WorkerRequest> {
        self.requests.try_recv().ok()
    }
}

/// Creates a connected transport/endpoint pair with [`TRANSPORT_BUFFER`]
/// capacity in each direction.
pub fn duplex() -> (WorkerTransport, EngineEndpoint) {
    let (request_tx, request_rx) = mpsc::channel(TRANSPORT_BUFFER);
    let (reply_tx, reply_rx) = mpsc::channel(TRANSPORT_BUFFER);
    (
        WorkerTransport {
            request_tx,
            reply_rx,
        },
        EngineEndpoint {
            requests: request_rx,
            replies: reply_tx,
        },
    )
}
