//! Per-job telemetry sink backed by two bounded channels.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleet_core::{JobId, TaskLogEntry, TaskStatusReport};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::engine::TelemetrySink;

/// Telemetry sink owned by the executor for exactly one job.
///
/// Emits use `try_send`, so a full channel drops the newest item instead of
/// blocking the engine. [`ChannelSink::close`] takes the senders out; the
/// forwarders then see their channels close, and any later emit is a no-op.
pub struct ChannelSink {
    job_id: JobId,
    status: Mutex<Option<mpsc::Sender<TaskStatusReport>>>,
    log: Mutex<Option<mpsc::Sender<TaskLogEntry>>>,
    dropped_status: AtomicU64,
    dropped_logs: AtomicU64,
}

impl ChannelSink {
    pub fn new(
        job_id: JobId,
        status_capacity: usize,
        log_capacity: usize,
    ) -> (
        Self,
        mpsc::Receiver<TaskStatusReport>,
        mpsc::Receiver<TaskLogEntry>,
    ) {
        let (status_tx, status_rx) = mpsc::channel(status_capacity.max(1));
        let (log_tx, log_rx) = mpsc::channel(log_capacity.max(1));
        let sink = Self {
            job_id,
            status: Mutex::new(Some(status_tx)),
            log: Mutex::new(Some(log_tx)),
            dropped_status: AtomicU64::new(0),
            dropped_logs: AtomicU64::new(0),
        };
        (sink, status_rx, log_rx)
    }

    /// Closes both channels. Idempotent.
    pub fn close(&self) {
        lock(&self.status).take();
        lock(&self.log).take();
    }

    pub fn dropped_status(&self) -> u64 {
        self.dropped_status.load(Ordering::Relaxed)
    }

    pub fn dropped_logs(&self) -> u64 {
        self.dropped_logs.load(Ordering::Relaxed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn offer<T>(slot: &Mutex<Option<mpsc::Sender<T>>>, item: T, dropped: &AtomicU64) -> bool {
    let guard = lock(slot);
    let Some(tx) = guard.as_ref() else {
        return false;
    };
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

impl TelemetrySink for ChannelSink {
    fn emit_status(&self, report: TaskStatusReport) -> bool {
        let sent = offer(&self.status, report, &self.dropped_status);
        if !sent {
            debug!(job_id = %self.job_id, "Status update dropped");
        }
        sent
    }

    fn emit_log(&self, entry: TaskLogEntry) -> bool {
        offer(&self.log, entry, &self.dropped_logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{JobProgress, LogLevel};

    fn log(n: usize) -> TaskLogEntry {
        TaskLogEntry::new(JobId::new("j1"), LogLevel::Info, format!("line {n}"))
    }

    #[tokio::test]
    async fn test_full_log_channel_drops_newest() {
        let (sink, _status_rx, mut log_rx) = ChannelSink::new(JobId::new("j1"), 4, 3);

        let accepted = (0..5).filter(|n| sink.emit_log(log(*n))).count();

        assert_eq!(accepted, 3);
        assert_eq!(sink.dropped_logs(), 2);
        assert_eq!(log_rx.recv().await.unwrap().message, "line 0");
        assert_eq!(log_rx.recv().await.unwrap().message, "line 1");
        assert_eq!(log_rx.recv().await.unwrap().message, "line 2");
    }

    #[tokio::test]
    async fn test_close_ends_receivers_and_silences_emits() {
        let (sink, mut status_rx, mut log_rx) = ChannelSink::new(JobId::new("j1"), 4, 4);
        assert!(sink.emit_log(log(0)));

        sink.close();
        sink.close();

        // Buffered items still drain, then the channel reports closed.
        assert!(log_rx.recv().await.is_some());
        assert!(log_rx.recv().await.is_none());
        assert!(status_rx.recv().await.is_none());

        assert!(!sink.emit_log(log(1)));
        assert!(!sink.emit_status(TaskStatusReport::running(
            JobId::new("j1"),
            "Daily",
            JobProgress::default(),
            "",
        )));
        assert_eq!(sink.dropped_logs(), 0);
    }
}
