use async_trait::async_trait;
use zrpc_transport::{Connection, Stream, TransportError};

use crate::error::map_connection_error;
use crate::stream::QuinnStream;

/// A live QUIC connection; each RPC stream is one bidirectional stream.
pub struct QuinnConnection {
    conn: quinn::Connection,
    // Client side: keeps the UDP endpoint driver alive for this connection.
    _endpoint: Option<quinn::Endpoint>,
}

impl QuinnConnection {
    pub fn new(conn: quinn::Connection) -> Self {
        Self {
            conn,
            _endpoint: None,
        }
    }

    pub fn with_endpoint(conn: quinn::Connection, endpoint: quinn::Endpoint) -> Self {
        Self {
            conn,
            _endpoint: Some(endpoint),
        }
    }
}

#[async_trait]
impl Connection for QuinnConnection {
    async fn open_stream(&self) -> Result<Box<dyn Stream>, TransportError> {
        // Quinn suspends here while the peer's stream limit is exhausted and
        // errors once the connection is gone.
        let (send, recv) = self.conn.open_bi().await.map_err(map_connection_error)?;
        Ok(Box::new(QuinnStream::new(send, recv)))
    }

    async fn accept_stream(&self) -> Result<Box<dyn Stream>, TransportError> {
        let (send, recv) = self.conn.accept_bi().await.map_err(map_connection_error)?;
        Ok(Box::new(QuinnStream::new(send, recv)))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        // Keepalive PING frames are driven by the transport config; the probe
        // here validates that the connection is still live.
        match self.conn.close_reason() {
            None => Ok(()),
            Some(reason) => Err(TransportError::not_connected(
                map_connection_error(reason).to_string(),
            )),
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.close_reason().is_none()
    }

    fn peer_identity(&self) -> Option<String> {
        let data = self.conn.handshake_data()?;
        let data = data
            .downcast::<quinn::crypto::rustls::HandshakeData>()
            .ok()?;
        data.server_name
    }

    async fn close(&self) {
        self.conn.close(0u32.into(), b"connection closed");
    }
}
