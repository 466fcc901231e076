//! Telemetry records produced by the automation engine while a job runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;
use crate::job::{JobId, JobStatus};

/// Progress through a job's task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub completed: usize,
    pub total: usize,
}

/// A progress/status update for the active job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStatusReport {
    pub job_id: JobId,
    pub status: JobStatus,
    pub current_task: String,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl TaskStatusReport {
    /// Creates a `running` status report.
    pub fn running(
        job_id: JobId,
        current_task: impl Into<String>,
        progress: JobProgress,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::Running,
            current_task: current_task.into(),
            progress,
            message: message.into(),
        }
    }
}

/// Severity of a task log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(DomainError::InvalidFieldValue {
                field: "level",
                value: other.to_string(),
                expected: "debug, info, warn, error",
            }),
        }
    }
}

/// One log line emitted by the engine for the active job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskLogEntry {
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

impl TaskLogEntry {
    pub fn new(job_id: JobId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id,
            level,
            message: message.into(),
            node_name: None,
            event_type: None,
        }
    }

    #[must_use]
    pub fn with_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    #[must_use]
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_log_entry_omits_empty_optionals() {
        let entry = TaskLogEntry::new(JobId::new("j1"), LogLevel::Info, "hello");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("node_name"));
        assert!(!json.contains("event_type"));

        let entry = entry.with_node("Daily").with_event_type("task");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["node_name"], "Daily");
        assert_eq!(json["event_type"], "task");
    }

    #[test]
    fn test_status_report_wire_shape() {
        let report = TaskStatusReport::running(
            JobId::new("j1"),
            "Daily",
            JobProgress { completed: 1, total: 3 },
            "",
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["progress"]["completed"], 1);
        assert_eq!(json["progress"]["total"], 3);
        assert!(json.get("message").is_none());
    }
}
