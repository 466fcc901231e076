//! Physical connection to the orchestration server.
//!
//! A [`Connector`] dials the server and returns a [`Connection`] split into an
//! ordered frame reader and an ordered frame writer. Any error from either
//! half is connection loss: it is never retried locally and the supervisor
//! tears down the whole session.
//!
//! Two implementations are provided:
//! - [`websocket::WebSocketConnector`] for real servers (`ws://` and `wss://`)
//! - [`channel::ChannelConnector`], an in-memory pair used to drive the agent
//!   from tests

pub mod channel;
pub mod websocket;

use async_trait::async_trait;

use crate::error::TransportError;

pub use channel::{channel_transport, ChannelConnector, ChannelListener, ServerConnection};
pub use websocket::WebSocketConnector;

/// Receiving half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Waits for the next complete text frame.
    ///
    /// Must be cancel-safe: it is raced against other session activity.
    async fn receive(&mut self) -> Result<String, TransportError>;
}

/// Sending half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Sends one frame; frames are delivered in call order.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Closes the connection. Errors are ignored.
    async fn close(&mut self);
}

/// An established connection.
pub struct Connection {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

/// Dials the server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, TransportError>;

    /// Endpoint description for logs.
    fn endpoint(&self) -> &str;
}
