//! State shared between the supervisor, dispatcher and agent handle.
//!
//! Each field sits behind its own `RwLock`: read locks for checks and
//! public status queries, write locks for mutation.

use std::fmt;

use fleet_core::{DeviceId, DeviceIdentity};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::trace;

/// Lifecycle of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The agent has exited and will not reconnect.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Authentication handshake state for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    /// `auth` or `register` sent, waiting for the server's answer.
    AwaitingServerAck,
    Authenticated,
}

/// Notifications for embedders (the binary logs them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Connected,
    Disconnected { reason: String },
    Registered { device_id: DeviceId },
    Authenticated { device_id: DeviceId, user_nickname: String },
    AuthFailed { message: String },
}

pub(crate) struct SharedState {
    pub(crate) connection: RwLock<ConnectionState>,
    pub(crate) auth: RwLock<AuthState>,
    pub(crate) identity: RwLock<DeviceIdentity>,
    /// Bind code waiting for the next unauthenticated session.
    pub(crate) pending_bind_code: Mutex<Option<String>>,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl SharedState {
    pub(crate) fn new(
        identity: DeviceIdentity,
        events: Option<mpsc::UnboundedSender<AgentEvent>>,
    ) -> Self {
        Self {
            connection: RwLock::new(ConnectionState::Disconnected),
            auth: RwLock::new(AuthState::Unauthenticated),
            identity: RwLock::new(identity),
            pending_bind_code: Mutex::new(None),
            events,
        }
    }

    pub(crate) async fn set_connection(&self, state: ConnectionState) {
        *self.connection.write().await = state;
    }

    pub(crate) async fn set_auth(&self, state: AuthState) {
        *self.auth.write().await = state;
    }

    /// Emits an event; a dropped receiver is ignored.
    pub(crate) fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                trace!("Event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state() {
        let state = SharedState::new(DeviceIdentity::default(), None);
        assert_eq!(*state.connection.read().await, ConnectionState::Disconnected);
        assert_eq!(*state.auth.read().await, AuthState::Unauthenticated);
        assert!(state.pending_bind_code.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_emit_delivers_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let state = SharedState::new(DeviceIdentity::default(), Some(tx));
        state.emit(AgentEvent::Connected);
        assert_eq!(rx.recv().await, Some(AgentEvent::Connected));

        drop(rx);
        // Must not panic once the receiver is gone.
        state.emit(AgentEvent::Connected);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
