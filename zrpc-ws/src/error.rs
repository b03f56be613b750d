use tokio_tungstenite::tungstenite;
use zrpc_transport::TransportError;

/// Fold a tungstenite error into the SPI taxonomy.
pub(crate) fn map_ws_error(err: tungstenite::Error) -> TransportError {
    use tungstenite::Error::*;
    match err {
        ConnectionClosed | AlreadyClosed => TransportError::closed("websocket closed"),
        Io(err) => match err.kind() {
            std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                TransportError::connection_reset(err.to_string())
            }
            std::io::ErrorKind::TimedOut => TransportError::connection_timeout(err.to_string()),
            _ => TransportError::network(err.to_string()),
        },
        Tls(err) => TransportError::connection_failed(format!("tls: {err}")),
        Capacity(err) => TransportError::resource_exhausted(err.to_string()),
        Protocol(err) => TransportError::protocol(err.to_string()),
        WriteBufferFull(_) => TransportError::resource_exhausted("write buffer full"),
        Utf8(err) => TransportError::protocol(format!("utf8: {err}")),
        AttackAttempt => TransportError::protocol("handshake attack attempt"),
        Url(err) => TransportError::invalid_argument(err.to_string()),
        Http(resp) => {
            TransportError::connection_failed(format!("upgrade rejected: {}", resp.status()))
        }
        HttpFormat(err) => TransportError::protocol(format!("http: {err}")),
    }
}
