//! Native QUIC adapter: one RPC stream per QUIC bidirectional stream.
//!
//! TLS 1.3 comes from the QUIC stack; `END_STREAM` on the send side becomes a
//! QUIC FIN, `cancel` becomes STOP_SENDING + RESET_STREAM with the taxonomy
//! error code. Connection migration and 0-RTT stay below this layer.

mod client;
mod connection;
mod error;
mod server;
mod stream;

pub use client::client_endpoint;
pub use connection::QuinnConnection;
pub use server::{server_endpoint, QuinnListener};
pub use stream::QuinnStream;

use async_trait::async_trait;
use zrpc_transport::{Connection, Endpoint, Listener, TlsConfig, Transport, TransportError};

/// ALPN for native zRPC-over-QUIC.
pub const ALPN: &str = "zr/1";

/// Keepalive interval driving QUIC PING frames under [`Connection::ping`].
const KEEP_ALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Idle budget before the connection times out.
const MAX_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// The QUIC transport, registerable under the `zr` scheme.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuinnTransport;

impl QuinnTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for QuinnTransport {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsConfig>,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let (conn, quic_endpoint) = client::connect(endpoint, tls).await?;
        Ok(Box::new(QuinnConnection::with_endpoint(conn, quic_endpoint)))
    }

    async fn listen(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsConfig>,
    ) -> Result<Box<dyn Listener>, TransportError> {
        let listener = server::listen(endpoint, tls).await?;
        Ok(Box::new(listener))
    }
}
