//! Capability descriptors reported to the server after authentication.

use serde::{Deserialize, Serialize};

/// Everything this device can run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub tasks: Vec<TaskInfo>,
    pub controllers: Vec<String>,
    pub resources: Vec<String>,
}

impl Capabilities {
    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.iter().any(|t| t.name == name)
    }

    pub fn has_controller(&self, name: &str) -> bool {
        self.controllers.iter().any(|c| c == name)
    }

    pub fn has_resource(&self, name: &str) -> bool {
        self.resources.iter().any(|r| r == name)
    }

    pub fn task(&self, name: &str) -> Option<&TaskInfo> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

/// A runnable task and the options it accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskInfo {
    pub name: String,
    pub label: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionInfo>,
}

impl TaskInfo {
    /// Label for display, falling back to the task name.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.name
        } else {
            &self.label
        }
    }
}

/// One option of a task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub option_type: String,
    pub label: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<CaseInfo>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default_case: String,
}

/// One selectable case of a `select`-style option.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaseInfo {
    pub name: String,
    pub label: String,
}
