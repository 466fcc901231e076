//! In-memory transport.
//!
//! [`channel_transport`] returns a connector for the agent and a listener
//! that plays the server side. Every successful `connect` hands a fresh
//! [`ServerConnection`] to the listener. Dropping the server side closes the
//! agent's session, which makes reconnection observable without sockets.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleet_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;

use super::{Connection, Connector, FrameReader, FrameWriter};
use crate::error::TransportError;

const ENDPOINT: &str = "channel://fleet";

/// Creates a connected connector/listener pair.
pub fn channel_transport() -> (ChannelConnector, ChannelListener) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let connector = ChannelConnector {
        incoming: incoming_tx,
        refuse: Arc::new(AtomicBool::new(false)),
        attempts: Arc::new(AtomicUsize::new(0)),
    };
    (connector, ChannelListener { incoming: incoming_rx })
}

/// Agent side of the in-memory transport.
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    incoming: mpsc::UnboundedSender<ServerConnection>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl ChannelConnector {
    /// Makes subsequent connects fail (or succeed again).
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                url: ENDPOINT.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();

        self.incoming
            .send(ServerConnection {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Connect {
                url: ENDPOINT.to_string(),
                reason: "listener dropped".to_string(),
            })?;

        Ok(Connection {
            reader: Box::new(ChannelReader { rx: from_server }),
            writer: Box::new(ChannelWriter { tx: Some(to_server) }),
        })
    }

    fn endpoint(&self) -> &str {
        ENDPOINT
    }
}

/// Server side: yields one [`ServerConnection`] per agent connect.
#[derive(Debug)]
pub struct ChannelListener {
    incoming: mpsc::UnboundedReceiver<ServerConnection>,
}

impl ChannelListener {
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.incoming.recv().await
    }
}

/// The server's view of one agent session.
#[derive(Debug)]
pub struct ServerConnection {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerConnection {
    /// Sends a raw frame. Returns false if the agent side is gone.
    pub fn send_frame(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(frame.into()).is_ok()
    }

    pub fn send(&self, message: &ServerMessage) -> bool {
        match message.encode() {
            Ok(frame) => self.send_frame(frame),
            Err(_) => false,
        }
    }

    /// Next raw frame from the agent; `None` once the agent closed.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next decodable message from the agent; undecodable frames are skipped.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        loop {
            let frame = self.from_client.recv().await?;
            if let Ok(message) = ClientMessage::decode(&frame) {
                return Some(message);
            }
        }
    }
}

struct ChannelReader {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameReader for ChannelReader {
    async fn receive(&mut self) -> Result<String, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}

struct ChannelWriter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameWriter for ChannelWriter {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}
