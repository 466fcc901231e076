//! Fleet Core - Shared domain types for the device agent
//!
//! This crate provides the domain types shared between the wire
//! protocol (`fleet-protocol`) and the agent runtime (`fleetd`).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod capabilities;
pub mod error;
pub mod identity;
pub mod job;
pub mod matcher;
pub mod telemetry;

// Re-exports for convenience
pub use capabilities::{Capabilities, CaseInfo, OptionInfo, TaskInfo};
pub use error::DomainError;
pub use identity::{DeviceId, DeviceIdentity, DeviceToken};
pub use job::{Job, JobId, JobStatus, TaskItem, TaskOptions};
pub use matcher::{PatternMatcher, WindowFilter};
pub use telemetry::{JobProgress, LogLevel, TaskLogEntry, TaskStatusReport};
