//! The automation engine capability.
//!
//! The agent never drives device automation itself. It talks to an
//! [`Engine`], which reports what it can run, runs one job at a time and
//! reports progress through a [`TelemetrySink`] owned by the executor.
//!
//! - [`process::ProcessEngine`] launches an external program per task.
//! - [`scripted::ScriptedEngine`] is a programmable engine for tests.

pub mod process;
pub mod scripted;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fleet_core::{Capabilities, Job, TaskLogEntry, TaskOptions, TaskStatusReport};

use crate::error::EngineError;

pub use process::ProcessEngine;
pub use scripted::ScriptedEngine;

/// Version reported when no engine (or no engine version) is available.
pub const UNKNOWN_VERSION: &str = "unknown";

/// A captured screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screenshot {
    /// Encoded image bytes (PNG).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Receives telemetry from a running job.
///
/// Emitting never blocks. `false` means the item was dropped, either because
/// the buffer is full or because the sink was closed after the job ended.
pub trait TelemetrySink: Send + Sync {
    fn emit_status(&self, report: TaskStatusReport) -> bool;
    fn emit_log(&self, entry: TaskLogEntry) -> bool;
}

/// Holds the sink of the running job for engines that emit from more than
/// one place. Emits after [`SinkSlot::clear`] are dropped.
#[derive(Default)]
pub struct SinkSlot {
    sink: Mutex<Option<Arc<dyn TelemetrySink>>>,
}

impl SinkSlot {
    pub fn install(&self, sink: Arc<dyn TelemetrySink>) {
        *self.lock() = Some(sink);
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn emit_status(&self, report: TaskStatusReport) -> bool {
        match self.current() {
            Some(sink) => sink.emit_status(report),
            None => false,
        }
    }

    pub fn emit_log(&self, entry: TaskLogEntry) -> bool {
        match self.current() {
            Some(sink) => sink.emit_log(entry),
            None => false,
        }
    }

    fn current(&self) -> Option<Arc<dyn TelemetrySink>> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<dyn TelemetrySink>>> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Turns a task name and its user options into the override passed to the
/// engine. Must be a pure function of its inputs.
pub trait OptionResolver: Send + Sync {
    fn resolve(&self, task: &str, options: &TaskOptions) -> Result<serde_json::Value, EngineError>;
}

/// Resolver that forwards the options unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

impl OptionResolver for PassthroughResolver {
    fn resolve(&self, _task: &str, options: &TaskOptions) -> Result<serde_json::Value, EngineError> {
        Ok(serde_json::Value::Object(options.clone()))
    }
}

/// The automation engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Tasks, controllers and resources this engine can run.
    async fn capabilities(&self) -> Result<Capabilities, EngineError>;

    /// Resets per-job stop state. Called by the executor before the job
    /// becomes visible to `stop_task`, so a stop that arrives before
    /// `run_task` starts is still honoured.
    fn prepare_job(&self);

    /// Runs every task of `job` in order. May take arbitrarily long.
    ///
    /// A stop requested since the last [`Engine::prepare_job`] must fail the
    /// job with [`EngineError::Stopped`].
    ///
    /// Telemetry goes to `sink` until [`Engine::clear_telemetry_sinks`] is
    /// called.
    async fn run_task(&self, job: &Job, sink: Arc<dyn TelemetrySink>) -> Result<(), EngineError>;

    /// Asks the running job to stop. Advisory: `run_task` still returns on
    /// its own once the engine honours the request.
    async fn stop_task(&self) -> Result<(), EngineError>;

    async fn take_screenshot(&self) -> Result<Screenshot, EngineError>;

    /// Drops every reference to the current telemetry sink. Called by the
    /// executor before it closes the sink.
    fn clear_telemetry_sinks(&self);

    fn version(&self) -> String;
}
