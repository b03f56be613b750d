//! WebSocket adapter: one RPC connection per RFC 6455 socket.
//!
//! Logical streams multiplex over the socket with a two-byte big-endian
//! substream id in front of every frame. Substream 0 carries connection
//! control (SETTINGS, PING); client-allocated ids are odd, server ids even.
//! The handshake, client-side masking, fragment reassembly and WS-level
//! ping/pong are handled by `tungstenite` underneath.

mod client;
mod connection;
mod error;
mod server;
mod stream;

pub use connection::WsConnection;
pub use server::WsListener;
pub use stream::WsStream;

use async_trait::async_trait;
use zrpc_proto::Settings;
use zrpc_transport::{Connection, Endpoint, Listener, TlsConfig, Transport, TransportError};

/// The connection-control substream.
pub(crate) const CONTROL_SUBSTREAM: u16 = 0;

/// Frames a stream can hold unread before the peer is back-pressured.
pub(crate) const MAILBOX_FRAMES: usize = 16;

/// Outbound frames queued toward the socket before writers suspend.
pub(crate) const WRITER_QUEUE: usize = 64;

/// The WebSocket transport, registerable under the `ws` and `wss` schemes.
#[derive(Debug, Clone, Copy)]
pub struct WsTransport {
    settings: Settings,
}

impl WsTransport {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
        }
    }

    /// Override the SETTINGS announced on every new connection.
    pub fn with_settings(settings: Settings) -> Self {
        Self { settings }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsConfig>,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let conn = client::connect(endpoint, tls, self.settings).await?;
        Ok(Box::new(conn))
    }

    async fn listen(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsConfig>,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let listener = server::listen(endpoint, tls, self.settings).await?;
        Ok(Box::new(listener))
    }
}
