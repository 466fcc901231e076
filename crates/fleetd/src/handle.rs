//! Client interface for a running agent.
//!
//! The `AgentHandle` is cheap to clone and can be shared across tasks. It
//! reads the agent's shared state and forwards commands; it never touches
//! the connection directly.

use std::sync::Arc;

use fleet_core::{DeviceId, JobId};
use tokio_util::sync::CancellationToken;

use crate::dispatcher::Dispatcher;
use crate::error::AgentError;
use crate::executor::JobExecutor;
use crate::state::{AuthState, ConnectionState, SharedState};

// ============================================================================
// Agent Handle
// ============================================================================

/// Handle for querying and commanding an [`Agent`](crate::Agent).
///
/// # Usage
///
/// ```ignore
/// let (agent, handle) = Agent::new(config, connector, engine, store, None);
/// tokio::spawn(agent.run(cancel));
///
/// handle.register("ABC123").await?;
/// if handle.is_connected().await { /* ... */ }
/// handle.stop();
/// ```
#[derive(Clone)]
pub struct AgentHandle {
    state: Arc<SharedState>,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<JobExecutor>,
    stop: CancellationToken,
}

impl AgentHandle {
    pub(crate) fn new(
        state: Arc<SharedState>,
        dispatcher: Arc<Dispatcher>,
        executor: Arc<JobExecutor>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            state,
            dispatcher,
            executor,
            stop,
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.connection.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    pub async fn auth_state(&self) -> AuthState {
        *self.state.auth.read().await
    }

    /// Server-assigned device id, once known.
    pub async fn device_id(&self) -> Option<DeviceId> {
        let identity = self.state.identity.read().await;
        (!identity.device_id.is_empty()).then(|| identity.device_id.clone())
    }

    /// Returns true if a device token is stored.
    pub async fn has_token(&self) -> bool {
        self.state.identity.read().await.has_token()
    }

    /// Id of the job currently running, if any.
    pub async fn active_job(&self) -> Option<JobId> {
        self.executor.active_job().await
    }

    /// Registers the device with a one-time bind code.
    ///
    /// Sent immediately when connected, otherwise held for the next session.
    ///
    /// # Errors
    ///
    /// - `AgentError::EmptyBindCode` if `code` is blank
    /// - `AgentError::NotRunning` if the agent has exited
    pub async fn register(&self, code: &str) -> Result<(), AgentError> {
        if self.stop.is_cancelled() {
            return Err(AgentError::NotRunning);
        }
        self.dispatcher.register(code).await
    }

    /// Stops the agent. The current session is closed and no reconnect is
    /// attempted. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}
