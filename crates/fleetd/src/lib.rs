//! fleetd - Device agent runtime
//!
//! This crate keeps a device connected to the fleet orchestration server and
//! runs the automation jobs it is sent:
//! - `supervisor` - Connection lifecycle, reconnect backoff and session loop
//! - `dispatcher` - Routing of server messages and the auth handshake
//! - `executor` - Single-flight job execution and telemetry forwarding
//! - `engine` - The automation engine capability and its implementations
//! - `transport` - WebSocket and in-memory connections
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         fleetd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐ frames  ┌─────────────────────────┐    │
//! │  │   Supervisor    │────────▶│       Dispatcher        │    │
//! │  │ (session loop)  │         │  (auth, routing)        │    │
//! │  └────────┬────────┘         └────────────┬────────────┘    │
//! │           ▲                               │ run/stop        │
//! │           │ drain                         ▼                 │
//! │  ┌────────┴────────┐ enqueue ┌─────────────────────────┐    │
//! │  │     Outbox      │◀────────│      JobExecutor        │    │
//! │  │ (bounded queue) │         │  (one job, telemetry)   │    │
//! │  └─────────────────┘         └────────────┬────────────┘    │
//! │                                           │                 │
//! │                                           ▼                 │
//! │                              ┌─────────────────────────┐    │
//! │                              │    Engine (trait)       │    │
//! │                              └─────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod credentials;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handle;
pub mod heartbeat;
pub mod outbox;
pub mod state;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use config::{AgentConfig, Config, DeviceProfile, ExecutorConfig, SupervisorConfig};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use engine::{Engine, ProcessEngine, Screenshot, ScriptedEngine, TelemetrySink};
pub use error::{AgentError, ConfigError, EngineError, StoreError, TransportError};
pub use executor::JobExecutor;
pub use handle::AgentHandle;
pub use state::{AgentEvent, AuthState, ConnectionState};
pub use supervisor::{Agent, AgentExit, Backoff};
pub use transport::{channel_transport, Connector, WebSocketConnector};
