use zrpc_transport::{TransportError, TransportErrorKind};

/// Fold a Quinn connection error into the SPI taxonomy.
pub(crate) fn map_connection_error(err: quinn::ConnectionError) -> TransportError {
    use quinn::ConnectionError as QE;
    match err {
        QE::VersionMismatch => TransportError::protocol("quic version mismatch"),
        QE::TransportError(ref e) => TransportError::protocol(e.to_string()),
        QE::ConnectionClosed(ref e) => TransportError::connection_reset(e.to_string()),
        QE::ApplicationClosed(ref e) => {
            // A zero code is the graceful local/remote shutdown path.
            if e.error_code.into_inner() == 0 {
                TransportError::closed("connection closed by application")
            } else {
                TransportError::connection_reset(e.to_string())
            }
        }
        QE::Reset => TransportError::connection_reset("connection reset by peer"),
        QE::TimedOut => TransportError::connection_timeout("quic idle/handshake timeout"),
        QE::LocallyClosed => TransportError::closed("connection closed locally"),
        QE::CidsExhausted => TransportError::resource_exhausted("connection ids exhausted"),
    }
}

pub(crate) fn map_connect_error(err: quinn::ConnectError) -> TransportError {
    TransportError::connection_failed(err.to_string())
}

pub(crate) fn map_write_error(err: quinn::WriteError) -> TransportError {
    use quinn::WriteError::*;
    match err {
        Stopped(code) => stream_code_error(code, "peer stopped reading"),
        ConnectionLost(err) => map_connection_error(err),
        ClosedStream => TransportError::closed("stream already closed"),
        ZeroRttRejected => TransportError::connection_failed("0-rtt rejected"),
    }
}

pub(crate) fn map_read_error(err: quinn::ReadError) -> TransportError {
    use quinn::ReadError::*;
    match err {
        Reset(code) => stream_code_error(code, "stream reset by peer"),
        ConnectionLost(err) => map_connection_error(err),
        ClosedStream => TransportError::closed("stream already closed"),
        IllegalOrderedRead => TransportError::protocol("illegal ordered read"),
        ZeroRttRejected => TransportError::connection_failed("0-rtt rejected"),
    }
}

/// Peer reset/stop codes carry the taxonomy code we put on the wire.
fn stream_code_error(code: quinn::VarInt, context: &str) -> TransportError {
    let kind = u32::try_from(code.into_inner())
        .map(TransportErrorKind::from_code)
        .unwrap_or(TransportErrorKind::Protocol);
    TransportError::new(kind, format!("{context} (code {code})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_cancel_code_surfaces_as_cancelled() {
        let code = quinn::VarInt::from_u32(TransportErrorKind::Cancelled.code());
        let err = stream_code_error(code, "reset");
        assert_eq!(err.kind(), TransportErrorKind::Cancelled);
    }

    #[test]
    fn oversize_code_folds_to_protocol() {
        let code = quinn::VarInt::from_u64(u64::from(u32::MAX) + 1).unwrap();
        let err = stream_code_error(code, "reset");
        assert_eq!(err.kind(), TransportErrorKind::Protocol);
    }
}
