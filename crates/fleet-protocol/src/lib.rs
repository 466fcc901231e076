//! Fleet Protocol - Wire protocol between a device and the orchestration server
//!
//! Every frame is one JSON envelope `{type, payload, timestamp}`. Decoding is
//! two-step: [`decode`] yields an [`Envelope`], then
//! [`ServerMessage::from_envelope`] (or [`ClientMessage::from_envelope`])
//! parses the per-kind payload. Either step may fail without affecting the
//! session; callers log the [`ProtocolError`] and skip the frame.

pub mod envelope;
pub mod error;
pub mod message;
pub mod payload;

pub use envelope::{decode, encode, Envelope, MessageKind};
pub use error::ProtocolError;
pub use message::{ClientMessage, ServerMessage};
pub use payload::{
    AuthFailedPayload, AuthPayload, AuthenticatedPayload, ErrorPayload, RegisterPayload,
    RegisteredPayload, RequestScreenshotPayload, RunTaskPayload, ScreenshotPayload,
    StopTaskPayload, TaskCompletedPayload,
};
