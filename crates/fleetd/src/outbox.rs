//! Outbound queue.
//!
//! Every producer (dispatcher, executor, telemetry forwarders, heartbeat)
//! enqueues through a cloned [`Outbox`]. Enqueue never blocks. A single
//! session writer drains the queue, so frames reach the transport in enqueue
//! order.
//!
//! Only high-volume traffic is bounded: `task_status`, `task_log` and `ping`
//! frames each hold a capacity permit while queued, and when no permit is
//! left the newest such frame is dropped. Handshake messages, capabilities,
//! screenshots and `task_completed` never need a permit, so a telemetry
//! backlog cannot crowd them out.
//!
//! The queue outlives sessions. Frames enqueued while disconnected are sent
//! after the next successful connect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fleet_protocol::{ClientMessage, MessageKind};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// An encoded frame plus the capacity permit it holds while queued.
#[derive(Debug)]
struct Queued {
    frame: String,
    _permit: Option<OwnedSemaphorePermit>,
}

/// Producer handle for the outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Queued>,
    capacity: Arc<Semaphore>,
    dropped: Arc<AtomicU64>,
}

/// Consumer side, owned by the supervisor and lent to each session.
#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::UnboundedReceiver<Queued>,
}

impl OutboxReceiver {
    /// Waits for the next frame. Taking it frees its capacity permit.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await.map(|queued| queued.frame)
    }

    pub fn try_recv(&mut self) -> Result<String, TryRecvError> {
        self.rx.try_recv().map(|queued| queued.frame)
    }
}

/// Kinds that may be dropped under backpressure.
fn is_bounded(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::TaskStatus | MessageKind::TaskLog | MessageKind::Ping
    )
}

impl Outbox {
    /// `capacity` bounds queued telemetry and heartbeat frames.
    pub fn new(capacity: usize) -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                capacity: Arc::new(Semaphore::new(capacity.max(1))),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            OutboxReceiver { rx },
        )
    }

    /// Encodes and enqueues `message`. Returns false if it was dropped.
    pub fn send(&self, message: &ClientMessage) -> bool {
        let kind = message.kind();

        let permit = if is_bounded(kind) {
            match Arc::clone(&self.capacity).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(kind = %kind, dropped, "Outbound queue full, dropping message");
                    return false;
                }
            }
        } else {
            None
        };

        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to encode outbound message");
                return false;
            }
        };

        let queued = Queued {
            frame,
            _permit: permit,
        };
        if self.tx.send(queued).is_err() {
            debug!(kind = %kind, "Outbound queue closed, dropping message");
            return false;
        }
        true
    }

    /// Total messages dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
