//! Error types for the agent runtime.
//!
//! Each error type maps onto one branch of the agent's failure taxonomy:
//!
//! - [`TransportError`] ends the current session and triggers reconnection.
//!   It is the only error that propagates up to the supervisor.
//! - [`EngineError`] is terminal to a single job or screenshot request and is
//!   reported to the server as data (`task_completed.error`,
//!   `screenshot.error`).
//! - [`StoreError`] is logged; a failing credential store never ends a session.
//! - [`ConfigError`] is only raised at startup.
//! - [`AgentError`] covers commands issued through the agent handle.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// Transport Errors
// ============================================================================

/// Failures of the physical connection.
///
/// Any of these is treated as connection loss: the session is torn down and
/// the supervisor reconnects with backoff.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// Endpoint that was dialed.
        url: String,
        /// Underlying failure.
        reason: String,
    },

    /// The connection handshake did not finish in time.
    #[error("timed out connecting to {url} after {timeout:?}")]
    Timeout {
        /// Endpoint that was dialed.
        url: String,
        /// Configured connect timeout.
        timeout: Duration,
    },

    /// Writing a frame failed.
    #[error("failed to send frame: {0}")]
    Send(String),

    /// Reading a frame failed.
    #[error("failed to receive frame: {0}")]
    Receive(String),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    Closed,
}

// ============================================================================
// Engine Errors
// ============================================================================

/// Failures reported by the automation engine.
///
/// The `Display` text of these errors is sent verbatim to the server as the
/// `error` field of `task_completed`, so messages are written for operators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No engine is configured on this device.
    #[error("automation engine not initialized")]
    NotInitialized,

    /// The job names a controller the engine does not advertise.
    #[error("unknown controller: {0}")]
    UnknownController(String),

    /// The job names a resource the engine does not advertise.
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// The job names a task the engine does not advertise.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Task options could not be resolved into an override.
    #[error("failed to resolve options for {task}: {reason}")]
    Options {
        /// Task whose options failed.
        task: String,
        /// Why resolution failed.
        reason: String,
    },

    /// No window matched the configured class/title filter.
    #[error("no matching window found")]
    NoMatchingWindow,

    /// A task ran but reported failure.
    #[error("task failed: {name}")]
    TaskFailed {
        /// Name of the failing task.
        name: String,
    },

    /// The job was stopped on request.
    #[error("job stopped")]
    Stopped,

    /// The job exceeded the executor watchdog.
    #[error("job timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    /// An engine process could not be launched or awaited.
    #[error("failed to run {command}: {reason}")]
    Process {
        /// Program that was launched.
        command: String,
        /// Underlying I/O failure.
        reason: String,
    },

    /// Screen capture failed.
    #[error("screenshot failed: {0}")]
    Screenshot(String),

    /// The engine task ended abnormally (panicked or was aborted).
    #[error("engine task aborted: {0}")]
    Aborted(String),

    /// Any other engine-specific failure.
    #[error("{0}")]
    Other(String),
}

// ============================================================================
// Credential Store Errors
// ============================================================================

/// Failures reading or writing persisted device credentials.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem access failed.
    #[error("credential store I/O error at {}: {source}", path.display())]
    Io {
        /// File that was accessed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The stored file is not valid credentials JSON.
    #[error("credential file {} is malformed: {source}", path.display())]
    Format {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Failures loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        /// Config file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for the expected schema.
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value parsed but is out of range.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted field name, e.g. `server.ws_url`.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

// ============================================================================
// Agent Errors
// ============================================================================

/// Errors returned by commands on the agent handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The bind code is empty or whitespace.
    #[error("bind code must not be empty")]
    EmptyBindCode,

    /// The agent has already exited.
    #[error("agent is not running")]
    NotRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_messages_are_operator_facing() {
        assert_eq!(
            EngineError::NotInitialized.to_string(),
            "automation engine not initialized"
        );
        assert_eq!(
            EngineError::TaskFailed {
                name: "Farm".to_string()
            }
            .to_string(),
            "task failed: Farm"
        );
        assert_eq!(EngineError::Stopped.to_string(), "job stopped");
        assert_eq!(
            EngineError::TimedOut(Duration::from_secs(90)).to_string(),
            "job timed out after 90s"
        );
        assert_eq!(EngineError::Other("boom".to_string()).to_string(), "boom");
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Connect {
            url: "ws://localhost:15618/ws/device".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("ws://localhost:15618/ws/device"));
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(TransportError::Closed.to_string(), "connection closed by peer");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Invalid {
            field: "server.ws_url".to_string(),
            reason: "must start with ws:// or wss://".to_string(),
        };
        assert!(err.to_string().contains("server.ws_url"));
    }

    #[test]
    fn test_agent_error_display() {
        assert_eq!(
            AgentError::EmptyBindCode.to_string(),
            "bind code must not be empty"
        );
    }
}
