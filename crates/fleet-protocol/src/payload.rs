//! Payload structures for kinds that do not map directly onto a core type.
//!
//! All payloads default missing fields so that a server omitting an optional
//! field (or sending `"payload": null`) still decodes.

use fleet_core::{DeviceId, DeviceToken, JobId, JobStatus, TaskItem};
use serde::{Deserialize, Serialize};

// ============================================================================
// Client -> Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterPayload {
    pub bind_code: String,
    pub device_name: String,
    pub engine_version: String,
    pub client_version: String,
    pub install_path: String,
    pub os_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthPayload {
    pub device_token: DeviceToken,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub engine_version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskCompletedPayload {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotPayload {
    pub request_id: String,
    pub base64_image: String,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

// ============================================================================
// Server -> Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisteredPayload {
    pub device_id: DeviceId,
    pub device_token: DeviceToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticatedPayload {
    pub device_id: DeviceId,
    pub user_nickname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthFailedPayload {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunTaskPayload {
    pub job_id: JobId,
    pub controller: String,
    pub resource: String,
    pub tasks: Vec<TaskItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopTaskPayload {
    pub job_id: JobId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestScreenshotPayload {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}
