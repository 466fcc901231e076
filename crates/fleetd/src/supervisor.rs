//! Connection supervisor.
//!
//! [`Agent::run`] keeps one session open at a time and reconnects with
//! exponential backoff whenever the transport fails. A session owns the
//! connection and multiplexes four sources in one loop:
//!
//! ```text
//!            ┌──────────── session loop (biased select) ────────────┐
//!  cancel ──>│ exit                                                 │
//!  stop   ──>│ exit                                                 │
//!  reader ──>│ dispatcher.dispatch(frame) error -> connection lost  │
//!  Outbox ──>│ writer.send(frame)        error -> connection lost   │
//!  ticker ──>│ heartbeat enqueues ping                              │
//!            └──────────────────────────────────────────────────────┘
//! ```
//!
//! The outbound queue, executor and dispatcher outlive sessions, so a job
//! keeps running across reconnects and its telemetry is flushed once the
//! next session is up.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::DeviceIdentity;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, SupervisorConfig};
use crate::credentials::CredentialStore;
use crate::dispatcher::Dispatcher;
use crate::engine::Engine;
use crate::error::TransportError;
use crate::executor::JobExecutor;
use crate::handle::AgentHandle;
use crate::heartbeat;
use crate::outbox::{Outbox, OutboxReceiver};
use crate::state::{AgentEvent, ConnectionState, SharedState};
use crate::transport::{Connection, Connector};

// ============================================================================
// Backoff
// ============================================================================

/// Exponential reconnect delay: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Counts a failed attempt and returns the delay before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let exponent = (self.attempt - 1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Called after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failed attempts so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ============================================================================
// Agent
// ============================================================================

/// Why [`Agent::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// [`AgentHandle::stop`] was called.
    Stopped,
    /// The caller's cancellation token fired.
    Cancelled,
}

/// How one session ended.
enum SessionEnd {
    Lost(TransportError),
    Exit(AgentExit),
}

enum Attempt {
    Connected(Connection),
    Failed(TransportError),
    Exit(AgentExit),
}

/// The device agent: supervisor, dispatcher and executor wired together.
pub struct Agent {
    config: SupervisorConfig,
    connector: Arc<dyn Connector>,
    state: Arc<SharedState>,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<JobExecutor>,
    outbox: Outbox,
    outbound: OutboxReceiver,
    stop: CancellationToken,
}

impl Agent {
    /// Builds the agent and its handle.
    ///
    /// The stored identity is loaded here; a store that cannot be read is
    /// logged and the agent starts unregistered.
    pub fn new(
        config: AgentConfig,
        connector: Arc<dyn Connector>,
        engine: Option<Arc<dyn Engine>>,
        store: Arc<dyn CredentialStore>,
        events: Option<mpsc::UnboundedSender<AgentEvent>>,
    ) -> (Self, AgentHandle) {
        let identity = match store.load() {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "Failed to load device credentials, starting unregistered");
                DeviceIdentity::default()
            }
        };

        let state = Arc::new(SharedState::new(identity, events));
        let (outbox, outbound) = Outbox::new(config.supervisor.outbound_queue_capacity);
        let executor = Arc::new(JobExecutor::new(
            engine.clone(),
            outbox.clone(),
            config.executor,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&state),
            outbox.clone(),
            Arc::clone(&executor),
            engine,
            store,
            config.device,
        ));
        let stop = CancellationToken::new();

        let handle = AgentHandle::new(
            Arc::clone(&state),
            Arc::clone(&dispatcher),
            Arc::clone(&executor),
            stop.clone(),
        );

        let agent = Self {
            config: config.supervisor,
            connector,
            state,
            dispatcher,
            executor,
            outbox,
            outbound,
            stop,
        };
        (agent, handle)
    }

    /// Runs until stopped through the handle or until `cancel` fires.
    ///
    /// Transport failures never end the loop; they only trigger a reconnect.
    /// On exit the running job, if any, is asked to stop.
    pub async fn run(mut self, cancel: CancellationToken) -> AgentExit {
        info!(endpoint = self.connector.endpoint(), "Agent starting");

        let mut backoff = Backoff::new(self.config.retry_base_delay, self.config.reconnect_max_delay);

        let exit = loop {
            if cancel.is_cancelled() {
                break AgentExit::Cancelled;
            }
            if self.stop.is_cancelled() {
                break AgentExit::Stopped;
            }

            self.state.set_connection(ConnectionState::Connecting).await;
            debug!(endpoint = self.connector.endpoint(), "Connecting");

            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => Attempt::Exit(AgentExit::Cancelled),
                () = self.stop.cancelled() => Attempt::Exit(AgentExit::Stopped),
                result = self.connector.connect() => match result {
                    Ok(connection) => Attempt::Connected(connection),
                    Err(e) => Attempt::Failed(e),
                },
            };

            match attempt {
                Attempt::Exit(exit) => break exit,
                Attempt::Failed(e) => {
                    self.state.set_connection(ConnectionState::Disconnected).await;
                    warn!(
                        endpoint = self.connector.endpoint(),
                        attempt = backoff.attempt() + 1,
                        error = %e,
                        "Connection attempt failed"
                    );
                }
                Attempt::Connected(connection) => {
                    backoff.reset();
                    info!(endpoint = self.connector.endpoint(), "Connected to server");
                    self.state.set_connection(ConnectionState::Connected).await;
                    self.state.emit(AgentEvent::Connected);
                    self.dispatcher.on_session_start().await;

                    let end = self.run_session(connection, &cancel).await;

                    self.state.set_connection(ConnectionState::Disconnected).await;
                    self.dispatcher.on_session_end().await;

                    match end {
                        SessionEnd::Exit(exit) => {
                            self.state.emit(AgentEvent::Disconnected {
                                reason: "agent exiting".to_string(),
                            });
                            break exit;
                        }
                        SessionEnd::Lost(e) => {
                            warn!(error = %e, "Connection lost");
                            self.state.emit(AgentEvent::Disconnected {
                                reason: e.to_string(),
                            });
                        }
                    }
                }
            }

            let delay = backoff.next_delay();
            info!(
                attempt = backoff.attempt(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting after delay"
            );

            let interrupted = tokio::select! {
                biased;
                () = cancel.cancelled() => Some(AgentExit::Cancelled),
                () = self.stop.cancelled() => Some(AgentExit::Stopped),
                () = sleep(delay) => None,
            };
            if let Some(exit) = interrupted {
                break exit;
            }
        };

        self.state.set_connection(ConnectionState::Closed).await;
        self.executor.shutdown().await;
        info!(exit = ?exit, "Agent stopped");
        exit
    }

    async fn run_session(&mut self, connection: Connection, cancel: &CancellationToken) -> SessionEnd {
        let Connection {
            mut reader,
            mut writer,
        } = connection;

        let heartbeat = heartbeat::run(self.config.heartbeat_interval, self.outbox.clone());
        tokio::pin!(heartbeat);

        let end = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break SessionEnd::Exit(AgentExit::Cancelled),
                () = self.stop.cancelled() => break SessionEnd::Exit(AgentExit::Stopped),
                // Inbound first: a long outbound backlog must not delay stop_task.
                frame = reader.receive() => match frame {
                    Ok(frame) => self.dispatcher.dispatch(&frame).await,
                    Err(e) => break SessionEnd::Lost(e),
                },
                frame = self.outbound.recv() => {
                    // The agent holds a sender, so the queue never closes.
                    let Some(frame) = frame else { continue };
                    if let Err(e) = writer.send(frame).await {
                        break SessionEnd::Lost(e);
                    }
                }
                () = &mut heartbeat => {}
            }
        };

        writer.close().await;
        end
    }
}
