use std::fmt;

use thiserror::Error;

/// The closed set of failure kinds every adapter maps into.
///
/// Underlying library errors never cross the SPI; they are folded into one of
/// these kinds with a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Could not establish transport (DNS, TCP/UDP, TLS).
    ConnectionFailed,
    /// Peer aborted the connection.
    ConnectionReset,
    /// Handshake or keepalive exceeded its limit.
    ConnectionTimeout,
    /// Operation attempted on a closed connection.
    NotConnected,
    /// Codec detected malformed framing.
    InvalidFrame,
    /// Required header missing or malformed.
    InvalidHeader,
    /// Generic adapter protocol violation.
    Protocol,
    /// Stream, flow-control or window limit hit.
    ResourceExhausted,
    /// Caller provided nonsensical input.
    InvalidArgument,
    /// Resource already closed by the local side.
    Closed,
    /// Other I/O failure.
    Network,
    /// Deadline elapsed.
    DeadlineExceeded,
    /// Local or remote cancel.
    Cancelled,
}

impl TransportErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::ConnectionReset => "CONNECTION_RESET",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::NotConnected => "NOT_CONNECTED",
            Self::InvalidFrame => "INVALID_FRAME",
            Self::InvalidHeader => "INVALID_HEADER",
            Self::Protocol => "PROTOCOL",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Closed => "CLOSED",
            Self::Network => "NETWORK",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// The code carried in RST_STREAM payloads and QUIC application errors.
    pub fn code(self) -> u32 {
        match self {
            Self::ConnectionFailed => 1,
            Self::ConnectionReset => 2,
            Self::ConnectionTimeout => 3,
            Self::NotConnected => 4,
            Self::InvalidFrame => 5,
            Self::InvalidHeader => 6,
            Self::Protocol => 7,
            Self::ResourceExhausted => 8,
            Self::InvalidArgument => 9,
            Self::Closed => 10,
            Self::Network => 11,
            Self::DeadlineExceeded => 12,
            Self::Cancelled => 13,
        }
    }

    /// Inverse of [`code`](Self::code); unknown codes fold into `Protocol`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::ConnectionFailed,
            2 => Self::ConnectionReset,
            3 => Self::ConnectionTimeout,
            4 => Self::NotConnected,
            5 => Self::InvalidFrame,
            6 => Self::InvalidHeader,
            7 => Self::Protocol,
            8 => Self::ResourceExhausted,
            9 => Self::InvalidArgument,
            10 => Self::Closed,
            11 => Self::Network,
            12 => Self::DeadlineExceeded,
            13 => Self::Cancelled,
            _ => Self::Protocol,
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport-layer failure: one taxonomy kind plus a diagnostic message.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionFailed, message)
    }

    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionReset, message)
    }

    pub fn connection_timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionTimeout, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::NotConnected, message)
    }

    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidFrame, message)
    }

    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidHeader, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ResourceExhausted, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidArgument, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Network, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::DeadlineExceeded, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Cancelled, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        let kinds = [
            TransportErrorKind::ConnectionFailed,
            TransportErrorKind::ConnectionReset,
            TransportErrorKind::ConnectionTimeout,
            TransportErrorKind::NotConnected,
            TransportErrorKind::InvalidFrame,
            TransportErrorKind::InvalidHeader,
            TransportErrorKind::Protocol,
            TransportErrorKind::ResourceExhausted,
            TransportErrorKind::InvalidArgument,
            TransportErrorKind::Closed,
            TransportErrorKind::Network,
            TransportErrorKind::DeadlineExceeded,
            TransportErrorKind::Cancelled,
        ];
        for kind in kinds {
            assert_eq!(TransportErrorKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn unknown_code_folds_to_protocol() {
        assert_eq!(
            TransportErrorKind::from_code(0xDEAD),
            TransportErrorKind::Protocol
        );
    }

    #[test]
    fn display_carries_kind_and_message() {
        let err = TransportError::deadline_exceeded("call budget spent");
        assert_eq!(err.to_string(), "DEADLINE_EXCEEDED: call budget spent");
    }
}
