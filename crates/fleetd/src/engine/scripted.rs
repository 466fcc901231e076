//! A programmable in-process engine.
//!
//! Used to drive the agent in tests and demos without launching processes.
//! Every call is counted so tests can assert on engine interaction.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{
    Capabilities, Job, JobProgress, LogLevel, TaskInfo, TaskLogEntry, TaskStatusReport,
};
use tokio::sync::Notify;

use super::{Engine, Screenshot, SinkSlot, TelemetrySink};
use crate::error::EngineError;

/// How `run_task` behaves once every task has been emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    /// Return immediately.
    None,
    /// Block until `stop_task`, then fail with [`EngineError::Stopped`].
    UntilStopped,
    /// Block forever, even across `stop_task`.
    Forever,
}

pub struct ScriptedEngine {
    capabilities: Capabilities,
    version: String,
    failing_task: Option<String>,
    logs_per_task: usize,
    hold: Hold,
    screenshot: Result<Screenshot, String>,
    sinks: SinkSlot,
    started: Notify,
    stop_requested: Notify,
    stopped: AtomicBool,
    run_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    clear_calls: AtomicUsize,
    accepted_logs: AtomicUsize,
    dropped_logs: AtomicUsize,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    /// Engine advertising `Daily` and `Farm` on controller `Win32` with
    /// resource `Official`. Every task succeeds immediately.
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities {
                tasks: vec![
                    TaskInfo {
                        name: "Daily".to_string(),
                        label: "Daily routine".to_string(),
                        ..Default::default()
                    },
                    TaskInfo {
                        name: "Farm".to_string(),
                        label: "Farm stage".to_string(),
                        ..Default::default()
                    },
                ],
                controllers: vec!["Win32".to_string()],
                resources: vec!["Official".to_string()],
            },
            version: "scripted-1.0".to_string(),
            failing_task: None,
            logs_per_task: 0,
            hold: Hold::None,
            screenshot: Err("no screen attached".to_string()),
            sinks: SinkSlot::default(),
            started: Notify::new(),
            stop_requested: Notify::new(),
            stopped: AtomicBool::new(false),
            run_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            clear_calls: AtomicUsize::new(0),
            accepted_logs: AtomicUsize::new(0),
            dropped_logs: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Makes the named task fail with [`EngineError::TaskFailed`].
    #[must_use]
    pub fn with_failing_task(mut self, name: impl Into<String>) -> Self {
        self.failing_task = Some(name.into());
        self
    }

    /// Emits `count` log lines per task, back to back.
    #[must_use]
    pub fn with_logs_per_task(mut self, count: usize) -> Self {
        self.logs_per_task = count;
        self
    }

    /// Keeps the job running until `stop_task` is called.
    #[must_use]
    pub fn holding_until_stopped(mut self) -> Self {
        self.hold = Hold::UntilStopped;
        self
    }

    /// Keeps the job running forever; `stop_task` is counted but ignored.
    #[must_use]
    pub fn ignoring_stop(mut self) -> Self {
        self.hold = Hold::Forever;
        self
    }

    #[must_use]
    pub fn with_screenshot(mut self, screenshot: Screenshot) -> Self {
        self.screenshot = Ok(screenshot);
        self
    }

    /// Waits until `run_task` has been entered. A start that happened before
    /// the call is not lost.
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn run_calls(&self) -> usize {
        self.run_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }

    /// Log lines the sink accepted.
    pub fn accepted_logs(&self) -> usize {
        self.accepted_logs.load(Ordering::SeqCst)
    }

    /// Log lines the sink refused.
    pub fn dropped_logs(&self) -> usize {
        self.dropped_logs.load(Ordering::SeqCst)
    }

    async fn hold(&self) -> Result<(), EngineError> {
        match self.hold {
            Hold::None => Ok(()),
            Hold::UntilStopped => {
                while !self.stopped.load(Ordering::SeqCst) {
                    self.stop_requested.notified().await;
                }
                Err(EngineError::Stopped)
            }
            Hold::Forever => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn capabilities(&self) -> Result<Capabilities, EngineError> {
        Ok(self.capabilities.clone())
    }

    fn prepare_job(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }

    async fn run_task(&self, job: &Job, sink: Arc<dyn TelemetrySink>) -> Result<(), EngineError> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        self.sinks.install(sink);
        self.started.notify_one();

        let total = job.total_tasks();
        for (index, task) in job.tasks.iter().enumerate() {
            if !self.capabilities.has_task(&task.name) {
                return Err(EngineError::UnknownTask(task.name.clone()));
            }

            self.sinks.emit_status(TaskStatusReport::running(
                job.job_id.clone(),
                &task.name,
                JobProgress {
                    completed: index,
                    total,
                },
                format!("running {}", task.name),
            ));

            for line in 0..self.logs_per_task {
                let entry = TaskLogEntry::new(
                    job.job_id.clone(),
                    LogLevel::Info,
                    format!("{} line {line}", task.name),
                )
                .with_node(&task.name);
                if self.sinks.emit_log(entry) {
                    self.accepted_logs.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.dropped_logs.fetch_add(1, Ordering::SeqCst);
                }
            }

            if self.failing_task.as_deref() == Some(task.name.as_str()) {
                return Err(EngineError::TaskFailed {
                    name: task.name.clone(),
                });
            }
        }

        self.hold().await
    }

    async fn stop_task(&self) -> Result<(), EngineError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_requested.notify_one();
        Ok(())
    }

    async fn take_screenshot(&self) -> Result<Screenshot, EngineError> {
        self.screenshot.clone().map_err(EngineError::Screenshot)
    }

    fn clear_telemetry_sinks(&self) {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        self.sinks.clear();
    }

    fn version(&self) -> String {
        self.version.clone()
    }
}
