//! Typed messages for each direction of the protocol.

use fleet_core::{
    Capabilities, DeviceToken, JobId, JobStatus, TaskLogEntry, TaskStatusReport,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::envelope::{decode, Envelope, MessageKind};
use crate::error::ProtocolError;
use crate::payload::{
    AuthFailedPayload, AuthPayload, AuthenticatedPayload, ErrorPayload, RegisterPayload,
    RegisteredPayload, RequestScreenshotPayload, RunTaskPayload, ScreenshotPayload,
    StopTaskPayload, TaskCompletedPayload,
};

/// Messages sent from the device to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Register(RegisterPayload),
    Auth(AuthPayload),
    Ping,
    Capabilities(Capabilities),
    TaskStatus(TaskStatusReport),
    TaskLog(TaskLogEntry),
    TaskCompleted(TaskCompletedPayload),
    Screenshot(ScreenshotPayload),
}

impl ClientMessage {
    /// Creates an auth message for a stored token.
    pub fn auth(
        device_token: DeviceToken,
        engine_version: impl Into<String>,
        client_version: impl Into<String>,
    ) -> Self {
        Self::Auth(AuthPayload {
            device_token,
            engine_version: engine_version.into(),
            client_version: client_version.into(),
        })
    }

    /// Creates a successful completion.
    pub fn completed(job_id: JobId, duration_ms: u64) -> Self {
        Self::TaskCompleted(TaskCompletedPayload {
            job_id,
            status: JobStatus::Completed,
            error: String::new(),
            duration_ms,
        })
    }

    /// Creates a failed completion carrying `error`.
    pub fn failed(job_id: JobId, error: impl Into<String>, duration_ms: u64) -> Self {
        Self::TaskCompleted(TaskCompletedPayload {
            job_id,
            status: JobStatus::Failed,
            error: error.into(),
            duration_ms,
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Register(_) => MessageKind::Register,
            Self::Auth(_) => MessageKind::Auth,
            Self::Ping => MessageKind::Ping,
            Self::Capabilities(_) => MessageKind::Capabilities,
            Self::TaskStatus(_) => MessageKind::TaskStatus,
            Self::TaskLog(_) => MessageKind::TaskLog,
            Self::TaskCompleted(_) => MessageKind::TaskCompleted,
            Self::Screenshot(_) => MessageKind::Screenshot,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let kind = self.kind();
        let payload = match self {
            Self::Register(p) => Some(to_value(kind, p)?),
            Self::Auth(p) => Some(to_value(kind, p)?),
            Self::Ping => None,
            Self::Capabilities(p) => Some(to_value(kind, p)?),
            Self::TaskStatus(p) => Some(to_value(kind, p)?),
            Self::TaskLog(p) => Some(to_value(kind, p)?),
            Self::TaskCompleted(p) => Some(to_value(kind, p)?),
            Self::Screenshot(p) => Some(to_value(kind, p)?),
        };
        Ok(Envelope::new(kind, payload))
    }

    /// Encodes this message as one frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_envelope()?.to_json()
    }

    /// Parses a device-originated envelope (used by servers and tests).
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let kind = envelope.message_kind()?;
        Ok(match kind {
            MessageKind::Register => Self::Register(payload(envelope, kind)?),
            MessageKind::Auth => Self::Auth(payload(envelope, kind)?),
            MessageKind::Ping => Self::Ping,
            MessageKind::Capabilities => Self::Capabilities(payload(envelope, kind)?),
            MessageKind::TaskStatus => Self::TaskStatus(payload(envelope, kind)?),
            MessageKind::TaskLog => Self::TaskLog(payload(envelope, kind)?),
            MessageKind::TaskCompleted => Self::TaskCompleted(payload(envelope, kind)?),
            MessageKind::Screenshot => Self::Screenshot(payload(envelope, kind)?),
            other => {
                return Err(ProtocolError::UnexpectedKind {
                    kind: other.as_str().to_string(),
                })
            }
        })
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(&decode(frame)?)
    }
}

/// Messages sent from the server to the device.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Registered(RegisteredPayload),
    Authenticated(AuthenticatedPayload),
    AuthFailed(AuthFailedPayload),
    Pong,
    RunTask(RunTaskPayload),
    StopTask(StopTaskPayload),
    RequestScreenshot(RequestScreenshotPayload),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Registered(_) => MessageKind::Registered,
            Self::Authenticated(_) => MessageKind::Authenticated,
            Self::AuthFailed(_) => MessageKind::AuthFailed,
            Self::Pong => MessageKind::Pong,
            Self::RunTask(_) => MessageKind::RunTask,
            Self::StopTask(_) => MessageKind::StopTask,
            Self::RequestScreenshot(_) => MessageKind::RequestScreenshot,
            Self::Error(_) => MessageKind::Error,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let kind = self.kind();
        let payload = match self {
            Self::Registered(p) => Some(to_value(kind, p)?),
            Self::Authenticated(p) => Some(to_value(kind, p)?),
            Self::AuthFailed(p) => Some(to_value(kind, p)?),
            Self::Pong => None,
            Self::RunTask(p) => Some(to_value(kind, p)?),
            Self::StopTask(p) => Some(to_value(kind, p)?),
            Self::RequestScreenshot(p) => Some(to_value(kind, p)?),
            Self::Error(p) => Some(to_value(kind, p)?),
        };
        Ok(Envelope::new(kind, payload))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_envelope()?.to_json()
    }

    /// Parses the typed payload of a server envelope.
    ///
    /// Unknown kinds yield `UnknownKind`; device-originated kinds yield
    /// `UnexpectedKind`. Both are logged and skipped by the dispatcher.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let kind = envelope.message_kind()?;
        Ok(match kind {
            MessageKind::Registered => Self::Registered(payload(envelope, kind)?),
            MessageKind::Authenticated => Self::Authenticated(payload(envelope, kind)?),
            MessageKind::AuthFailed => Self::AuthFailed(payload(envelope, kind)?),
            MessageKind::Pong => Self::Pong,
            MessageKind::RunTask => Self::RunTask(payload(envelope, kind)?),
            MessageKind::StopTask => Self::StopTask(payload(envelope, kind)?),
            MessageKind::RequestScreenshot => Self::RequestScreenshot(payload(envelope, kind)?),
            MessageKind::Error => Self::Error(payload(envelope, kind)?),
            other => {
                return Err(ProtocolError::UnexpectedKind {
                    kind: other.as_str().to_string(),
                })
            }
        })
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(&decode(frame)?)
    }
}

fn to_value<T: Serialize>(kind: MessageKind, value: &T) -> Result<serde_json::Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Encode {
        kind: kind.as_str().to_string(),
        reason: e.to_string(),
    })
}

/// A missing or null payload decodes as the payload's default.
fn payload<T: DeserializeOwned + Default>(
    envelope: &Envelope,
    kind: MessageKind,
) -> Result<T, ProtocolError> {
    match &envelope.payload {
        None => Ok(T::default()),
        Some(value) => {
            T::deserialize(value).map_err(|e| ProtocolError::InvalidPayload {
                kind: kind.as_str().to_string(),
                reason: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{
        CaseInfo, DeviceId, JobProgress, LogLevel, OptionInfo, TaskInfo, TaskItem,
    };
    use serde_json::json;

    fn client_samples() -> Vec<ClientMessage> {
        vec![
            ClientMessage::Register(RegisterPayload {
                bind_code: "ABC123".to_string(),
                device_name: "desk-1".to_string(),
                engine_version: "1.2.0".to_string(),
                client_version: "0.3.0".to_string(),
                install_path: "/opt/engine".to_string(),
                os_info: "linux/x86_64".to_string(),
            }),
            ClientMessage::auth(DeviceToken::new("t1"), "1.2.0", "0.3.0"),
            ClientMessage::Ping,
            ClientMessage::Capabilities(Capabilities {
                tasks: vec![TaskInfo {
                    name: "Farm".to_string(),
                    label: "Farm stage".to_string(),
                    description: "Repeat a stage".to_string(),
                    options: vec![OptionInfo {
                        name: "stage".to_string(),
                        option_type: "select".to_string(),
                        label: "Stage".to_string(),
                        cases: vec![CaseInfo {
                            name: "1-7".to_string(),
                            label: "1-7".to_string(),
                        }],
                        default_case: "1-7".to_string(),
                    }],
                }],
                controllers: vec!["Win32".to_string()],
                resources: vec!["Official".to_string()],
            }),
            ClientMessage::TaskStatus(TaskStatusReport::running(
                JobId::new("j1"),
                "Farm",
                JobProgress { completed: 0, total: 2 },
                "starting",
            )),
            ClientMessage::TaskLog(
                TaskLogEntry::new(JobId::new("j1"), LogLevel::Warn, "slow").with_node("Farm"),
            ),
            ClientMessage::failed(JobId::new("j1"), "boom", 42),
            ClientMessage::Screenshot(ScreenshotPayload {
                request_id: "r1".to_string(),
                base64_image: "iVBORw0K".to_string(),
                width: 1280,
                height: 720,
                error: String::new(),
            }),
        ]
    }

    fn server_samples() -> Vec<ServerMessage> {
        vec![
            ServerMessage::Registered(RegisteredPayload {
                device_id: DeviceId::new("d1"),
                device_token: DeviceToken::new("t1"),
            }),
            ServerMessage::Authenticated(AuthenticatedPayload {
                device_id: DeviceId::new("d1"),
                user_nickname: "doctor".to_string(),
            }),
            ServerMessage::AuthFailed(AuthFailedPayload {
                error: "invalid_token".to_string(),
                message: "token revoked".to_string(),
            }),
            ServerMessage::Pong,
            ServerMessage::RunTask(RunTaskPayload {
                job_id: JobId::new("j1"),
                controller: "Win32".to_string(),
                resource: "Official".to_string(),
                tasks: vec![
                    TaskItem::new("Daily"),
                    TaskItem::new("Farm").with_option("stage", json!("1-7")),
                ],
            }),
            ServerMessage::StopTask(StopTaskPayload {
                job_id: JobId::new("j1"),
            }),
            ServerMessage::RequestScreenshot(RequestScreenshotPayload {
                request_id: "r1".to_string(),
            }),
            ServerMessage::Error(ErrorPayload {
                code: "rate_limited".to_string(),
                message: "slow down".to_string(),
            }),
        ]
    }

    #[test]
    fn test_every_kind_roundtrips() {
        let clients = client_samples();
        let servers = server_samples();
        assert_eq!(clients.len() + servers.len(), MessageKind::ALL.len());

        for msg in clients {
            let frame = msg.encode().unwrap();
            let envelope = decode(&frame).unwrap();
            assert_eq!(envelope.kind, msg.kind().as_str());
            assert_eq!(ClientMessage::from_envelope(&envelope).unwrap(), msg);
        }

        for msg in servers {
            let frame = msg.encode().unwrap();
            let envelope = decode(&frame).unwrap();
            assert_eq!(envelope.kind, msg.kind().as_str());
            assert_eq!(ServerMessage::from_envelope(&envelope).unwrap(), msg);
        }
    }

    #[test]
    fn test_unknown_kind_is_reported_by_name() {
        let frame = r#"{"type":"firmware_update","payload":{}}"#;
        assert_eq!(
            ServerMessage::decode(frame),
            Err(ProtocolError::UnknownKind("firmware_update".to_string()))
        );
    }

    #[test]
    fn test_wrong_direction_is_unexpected() {
        let frame = ClientMessage::Ping.encode().unwrap();
        assert!(matches!(
            ServerMessage::decode(&frame),
            Err(ProtocolError::UnexpectedKind { .. })
        ));
    }

    #[test]
    fn test_bad_payload_shape_is_invalid_payload() {
        let frame = r#"{"type":"run_task","payload":{"job_id":"j1","tasks":"nope"}}"#;
        assert!(matches!(
            ServerMessage::decode(frame),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_null_payload_defaults() {
        let frame = r#"{"type":"stop_task","payload":null}"#;
        let msg = ServerMessage::decode(frame).unwrap();
        assert_eq!(msg, ServerMessage::StopTask(StopTaskPayload::default()));
    }

    #[test]
    fn test_register_wire_fields() {
        let frame = client_samples().remove(0).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "register");
        assert_eq!(value["payload"]["bind_code"], "ABC123");
        assert_eq!(value["payload"]["engine_version"], "1.2.0");
        assert_eq!(value["payload"]["install_path"], "/opt/engine");
    }
}
