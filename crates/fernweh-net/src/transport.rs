//! Transport abstraction consumed by the connection manager.
//!
//! The real app hands frames to a platform socket; this crate only sees a
//! duplex channel of typed frames. The in-memory pair below backs every
//! test, and `ChannelConnector` lets a scripted fake server play the
//! remote side, one fresh transport per connection attempt.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tracing::debug;

use fernweh_shared::error::ConnectError;
use fernweh_shared::protocol::{CommandFrame, ServerEvent};

/// Client half of a duplex frame channel. Dropping it closes the
/// connection as observed by the other side.
pub struct Transport {
    frame_tx: mpsc::Sender<CommandFrame>,
    event_rx: mpsc::Receiver<ServerEvent>,
}

impl Transport {
    /// Write one command frame. `Err` means the transport is gone.
    pub async fn send(&self, frame: CommandFrame) -> Result<(), TransportClosed> {
        self.frame_tx.send(frame).await.map_err(|_| TransportClosed)
    }

    /// Read the next server event. `None` means the transport is gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.event_rx.recv().await
    }
}

/// Server half of an in-memory duplex pair, used by tests to script the
/// remote side of the protocol.
pub struct ServerEnd {
    pub frame_rx: mpsc::Receiver<CommandFrame>,
    pub event_tx: mpsc::Sender<ServerEvent>,
}

impl ServerEnd {
    pub async fn recv_frame(&mut self) -> Option<CommandFrame> {
        self.frame_rx.recv().await
    }

    pub async fn emit(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

/// Build a connected in-memory transport pair.
pub fn duplex_pair() -> (Transport, ServerEnd) {
    let (frame_tx, frame_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);
    (
        Transport { frame_tx, event_rx },
        ServerEnd { frame_rx, event_tx },
    )
}

#[derive(Debug, thiserror::Error)]
#[error("Transport closed")]
pub struct TransportClosed;

/// Produces one transport per connection attempt. The connection manager
/// calls this again on every reconnect.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Transport, ConnectError>> + Send + '_>>;
}

/// Test connector: every attempt creates a fresh duplex pair and hands the
/// server end to whoever listens on the accept channel.
pub struct ChannelConnector {
    accept_tx: mpsc::Sender<ServerEnd>,
}

impl ChannelConnector {
    /// Returns the connector plus the receiver on which server ends of
    /// successive connection attempts arrive.
    pub fn new() -> (Self, mpsc::Receiver<ServerEnd>) {
        let (accept_tx, accept_rx) = mpsc::channel(8);
        (Self { accept_tx }, accept_rx)
    }
}

impl Connector for ChannelConnector {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Transport, ConnectError>> + Send + '_>> {
        Box::pin(async move {
            let (transport, server_end) = duplex_pair();
            debug!("In-memory transport attempt");
            self.accept_tx
                .send(server_end)
                .await
                .map_err(|_| ConnectError::Timeout)?;
            Ok(transport)
        })
    }
}
