//! Single-flight job execution.
//!
//! The executor owns the active job from acceptance until completion. It
//! guarantees:
//!
//! - at most one job runs at a time; a second `run_task` is answered with a
//!   `device busy` failure and never reaches the engine
//! - every accepted job produces exactly one `task_completed`
//! - telemetry from a job is forwarded before its completion and dropped
//!   once the job has ended
//!
//! ```text
//! run_task ──> submit ──> spawn(run_job)
//!                            │
//!                            ├─> engine.run_task(job, ChannelSink)
//!                            │        │ status / log (try_send)
//!                            │        v
//!                            │   forwarders ──> Outbox
//!                            │
//!                            └─> clear sinks, close sink, drain forwarders,
//!                                release slot, send task_completed
//! ```

pub mod sink;

use std::sync::Arc;

use fleet_core::{Job, JobId, JobProgress, TaskLogEntry, TaskStatusReport};
use fleet_protocol::{ClientMessage, RunTaskPayload};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::engine::{Engine, TelemetrySink};
use crate::error::EngineError;
use crate::outbox::Outbox;

pub use sink::ChannelSink;

/// Error text for a job rejected because another one is running.
pub const DEVICE_BUSY: &str = "device busy";

pub struct JobExecutor {
    engine: Option<Arc<dyn Engine>>,
    outbox: Outbox,
    config: ExecutorConfig,
    active: RwLock<Option<Job>>,
}

impl JobExecutor {
    pub fn new(engine: Option<Arc<dyn Engine>>, outbox: Outbox, config: ExecutorConfig) -> Self {
        Self {
            engine,
            outbox,
            config,
            active: RwLock::new(None),
        }
    }

    /// Accepts or rejects a job.
    ///
    /// Rejections are answered immediately with a failed `task_completed`.
    /// An accepted job runs in the background; the returned handle resolves
    /// after its completion has been enqueued.
    pub async fn submit(self: &Arc<Self>, payload: RunTaskPayload) -> Option<JoinHandle<()>> {
        let mut active = self.active.write().await;

        if let Some(current) = active.as_ref() {
            warn!(
                job_id = %payload.job_id,
                active_job = %current.job_id,
                "Rejecting job, device busy"
            );
            self.outbox
                .send(&ClientMessage::failed(payload.job_id, DEVICE_BUSY, 0));
            return None;
        }

        let Some(engine) = self.engine.clone() else {
            warn!(job_id = %payload.job_id, "Rejecting job, no automation engine");
            self.outbox.send(&ClientMessage::failed(
                payload.job_id,
                EngineError::NotInitialized.to_string(),
                0,
            ));
            return None;
        };

        let job = Job::new(
            payload.job_id,
            payload.controller,
            payload.resource,
            payload.tasks,
        );
        info!(
            job_id = %job.job_id,
            controller = %job.controller,
            resource = %job.resource,
            tasks = job.total_tasks(),
            "Job accepted"
        );

        self.outbox
            .send(&ClientMessage::TaskStatus(TaskStatusReport::running(
                job.job_id.clone(),
                "",
                JobProgress {
                    completed: 0,
                    total: job.total_tasks(),
                },
                "job started",
            )));

        // Armed under the write lock: from here on a matching stop_task
        // reaches this job even if run_task has not started yet.
        engine.prepare_job();
        *active = Some(job.clone());
        drop(active);

        Some(tokio::spawn(Arc::clone(self).run_job(engine, job)))
    }

    /// Stops the active job if `job_id` names it; anything else is ignored.
    ///
    /// The slot stays read-locked while the engine is asked to stop, so the
    /// request can never land on a job accepted afterwards.
    pub async fn stop(&self, job_id: &JobId) {
        let active = self.active.read().await;
        let is_active = active.as_ref().is_some_and(|job| &job.job_id == job_id);

        if !is_active {
            debug!(job_id = %job_id, "Ignoring stop for a job that is not running");
            return;
        }

        let Some(engine) = &self.engine else {
            return;
        };
        info!(job_id = %job_id, "Stopping job");
        if let Err(e) = engine.stop_task().await {
            warn!(job_id = %job_id, error = %e, "Engine failed to stop job");
        }
        drop(active);
    }

    /// Id of the running job, if any.
    pub async fn active_job(&self) -> Option<JobId> {
        self.active.read().await.as_ref().map(|job| job.job_id.clone())
    }

    /// Asks the engine to stop whatever is running. Used on agent exit.
    pub async fn shutdown(&self) {
        if let Some(job_id) = self.active_job().await {
            self.stop(&job_id).await;
        }
    }

    async fn run_job(self: Arc<Self>, engine: Arc<dyn Engine>, job: Job) {
        let started = Instant::now();
        let job_id = job.job_id.clone();

        let (sink, status_rx, log_rx) = ChannelSink::new(
            job_id.clone(),
            self.config.status_capacity,
            self.config.log_capacity,
        );
        let sink = Arc::new(sink);
        let status_forwarder = tokio::spawn(forward_status(status_rx, self.outbox.clone()));
        let log_forwarder = tokio::spawn(forward_logs(log_rx, self.outbox.clone()));

        let result = self.drive(&engine, job, sink.clone()).await;

        engine.clear_telemetry_sinks();
        sink.close();
        if let Err(e) = status_forwarder.await {
            warn!(job_id = %job_id, error = %e, "Status forwarder ended abnormally");
        }
        if let Err(e) = log_forwarder.await {
            warn!(job_id = %job_id, error = %e, "Log forwarder ended abnormally");
        }
        if sink.dropped_logs() > 0 || sink.dropped_status() > 0 {
            warn!(
                job_id = %job_id,
                dropped_logs = sink.dropped_logs(),
                dropped_status = sink.dropped_status(),
                "Telemetry dropped under backpressure"
            );
        }

        self.active.write().await.take();

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let completion = match result {
            Ok(()) => {
                info!(job_id = %job_id, duration_ms, "Job completed");
                ClientMessage::completed(job_id, duration_ms)
            }
            Err(e) => {
                warn!(job_id = %job_id, duration_ms, error = %e, "Job failed");
                ClientMessage::failed(job_id, e.to_string(), duration_ms)
            }
        };
        self.outbox.send(&completion);
    }

    /// Runs the engine on its own task so a panic fails the job instead of
    /// the executor, and applies the optional watchdog.
    async fn drive(
        &self,
        engine: &Arc<dyn Engine>,
        job: Job,
        sink: Arc<dyn TelemetrySink>,
    ) -> Result<(), EngineError> {
        let mut handle = {
            let engine = Arc::clone(engine);
            tokio::spawn(async move { engine.run_task(&job, sink).await })
        };

        let joined = match self.config.job_timeout {
            None => (&mut handle).await,
            Some(limit) => match timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(timeout_secs = limit.as_secs(), "Job exceeded watchdog, stopping");
                    if let Err(e) = engine.stop_task().await {
                        warn!(error = %e, "Engine failed to stop job");
                    }
                    handle.abort();
                    return Err(EngineError::TimedOut(limit));
                }
            },
        };

        joined.unwrap_or_else(|e| Err(EngineError::Aborted(e.to_string())))
    }
}

async fn forward_status(mut rx: mpsc::Receiver<TaskStatusReport>, outbox: Outbox) {
    while let Some(report) = rx.recv().await {
        outbox.send(&ClientMessage::TaskStatus(report));
    }
}

async fn forward_logs(mut rx: mpsc::Receiver<TaskLogEntry>, outbox: Outbox) {
    while let Some(entry) = rx.recv().await {
        outbox.send(&ClientMessage::TaskLog(entry));
    }
}
