//! The envelope wrapper and the closed catalog of message kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ProtocolError;

/// Every message kind in the catalog, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    // Client -> Server
    Register,
    Auth,
    Ping,
    Capabilities,
    TaskStatus,
    TaskLog,
    TaskCompleted,
    Screenshot,

    // Server -> Client
    Registered,
    Authenticated,
    AuthFailed,
    Pong,
    RunTask,
    StopTask,
    RequestScreenshot,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 16] = [
        Self::Register,
        Self::Auth,
        Self::Ping,
        Self::Capabilities,
        Self::TaskStatus,
        Self::TaskLog,
        Self::TaskCompleted,
        Self::Screenshot,
        Self::Registered,
        Self::Authenticated,
        Self::AuthFailed,
        Self::Pong,
        Self::RunTask,
        Self::StopTask,
        Self::RequestScreenshot,
        Self::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Auth => "auth",
            Self::Ping => "ping",
            Self::Capabilities => "capabilities",
            Self::TaskStatus => "task_status",
            Self::TaskLog => "task_log",
            Self::TaskCompleted => "task_completed",
            Self::Screenshot => "screenshot",
            Self::Registered => "registered",
            Self::Authenticated => "authenticated",
            Self::AuthFailed => "auth_failed",
            Self::Pong => "pong",
            Self::RunTask => "run_task",
            Self::StopTask => "stop_task",
            Self::RequestScreenshot => "request_screenshot",
            Self::Error => "error",
        }
    }

    /// Looks up a kind by its wire name.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    /// Returns true for kinds the server sends to the device.
    pub fn is_server_to_client(&self) -> bool {
        matches!(
            self,
            Self::Registered
                | Self::Authenticated
                | Self::AuthFailed
                | Self::Pong
                | Self::RunTask
                | Self::StopTask
                | Self::RequestScreenshot
                | Self::Error
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame on the wire.
///
/// `kind` is kept as a raw string so that frames with unknown kinds still
/// decode and can be logged by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Creates an envelope stamped with the current time.
    pub fn new(kind: MessageKind, payload: Option<Value>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Returns the catalog kind, or `UnknownKind` for anything else.
    pub fn message_kind(&self) -> Result<MessageKind, ProtocolError> {
        MessageKind::parse(&self.kind).ok_or_else(|| ProtocolError::UnknownKind(self.kind.clone()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode {
            kind: self.kind.clone(),
            reason: e.to_string(),
        })
    }
}

/// Serializes `payload` into a fresh envelope of `kind`.
///
/// A `None` payload omits the field entirely.
pub fn encode<T: Serialize>(kind: MessageKind, payload: Option<&T>) -> Result<String, ProtocolError> {
    let payload = payload
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| ProtocolError::Encode {
            kind: kind.as_str().to_string(),
            reason: e.to_string(),
        })?;
    Envelope::new(kind, payload).to_json()
}

/// Parses one frame into an envelope. The payload is left undecoded.
pub fn decode(frame: &str) -> Result<Envelope, ProtocolError> {
    serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed {
        reason: e.to_string(),
    })
}
