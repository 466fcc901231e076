//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding frames.
///
/// None of these are fatal to a session: a frame that fails to decode is
/// logged and skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not a valid envelope.
    #[error("malformed envelope: {reason}")]
    Malformed { reason: String },

    /// The envelope's `type` is not in the message catalog.
    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    /// The kind is known but not valid in this direction.
    #[error("unexpected message kind '{kind}' for this direction")]
    UnexpectedKind { kind: String },

    /// The payload does not match the shape expected for its kind.
    #[error("invalid '{kind}' payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    /// A payload could not be serialized.
    #[error("failed to encode '{kind}': {reason}")]
    Encode { kind: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::UnknownKind("reboot".to_string());
        assert_eq!(err.to_string(), "unknown message kind: reboot");

        let err = ProtocolError::InvalidPayload {
            kind: "run_task".to_string(),
            reason: "expected a sequence".to_string(),
        };
        assert!(err.to_string().contains("run_task"));
        assert!(err.to_string().contains("expected a sequence"));
    }
}
