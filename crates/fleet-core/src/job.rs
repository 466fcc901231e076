//! Job entities: one accepted unit of work made of ordered tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;

/// Per-task options, opaque to the agent and handed to the option resolver.
pub type TaskOptions = serde_json::Map<String, serde_json::Value>;

/// Server-assigned identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single named task and its options.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskItem {
    #[serde(default)]
    pub name: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub options: TaskOptions,
}

impl TaskItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: TaskOptions::new(),
        }
    }

    /// Adds an option, builder style.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// Servers send `"options": null` for tasks without options.
fn null_as_empty<'de, D>(deserializer: D) -> Result<TaskOptions, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<TaskOptions>::deserialize(deserializer)?.unwrap_or_default())
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DomainError::InvalidFieldValue {
                field: "status",
                value: other.to_string(),
                expected: "running, completed, failed",
            }),
        }
    }
}

/// One accepted unit of work.
///
/// At most one job exists at a time; it is owned by the job executor from
/// acceptance until completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: JobId,
    pub controller: String,
    pub resource: String,
    pub tasks: Vec<TaskItem>,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
}

impl Job {
    /// Creates a running job stamped with the current time.
    pub fn new(
        job_id: impl Into<JobId>,
        controller: impl Into<String>,
        resource: impl Into<String>,
        tasks: Vec<TaskItem>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            controller: controller.into(),
            resource: resource.into(),
            tasks,
            status: JobStatus::Running,
            started_at: Utc::now(),
        }
    }

    pub fn total_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Task names in execution order.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.iter().map(|t| t.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_starts_running() {
        let job = Job::new("j1", "Win32", "Official", vec![TaskItem::new("Daily")]);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.total_tasks(), 1);
        assert_eq!(job.task_names().collect::<Vec<_>>(), vec!["Daily"]);
    }

    #[test]
    fn test_status_parse_and_display() {
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert_eq!(JobStatus::Completed.to_string(), "completed");
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_task_item_null_options() {
        let item: TaskItem =
            serde_json::from_value(json!({"name": "Daily", "options": null})).unwrap();
        assert_eq!(item.name, "Daily");
        assert!(item.options.is_empty());
    }

    #[test]
    fn test_task_item_missing_options() {
        let item: TaskItem = serde_json::from_value(json!({"name": "Daily"})).unwrap();
        assert!(item.options.is_empty());
    }

    #[test]
    fn test_task_item_keeps_opaque_options() {
        let item: TaskItem = serde_json::from_value(json!({
            "name": "Farm",
            "options": {"stage": "1-7", "times": 3, "nested": {"a": [1, 2]}}
        }))
        .unwrap();
        assert_eq!(item.options.get("times"), Some(&json!(3)));
        assert_eq!(item.options.get("nested"), Some(&json!({"a": [1, 2]})));
    }
}
