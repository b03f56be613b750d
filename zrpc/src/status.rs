use std::fmt;

use zrpc_proto::{Headers, HEADER_MESSAGE, HEADER_STATUS};
use zrpc_transport::{TransportError, TransportErrorKind};

/// Application-visible result codes, numerically compatible with the gRPC
/// status space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Cancelled,
            2 => Self::Unknown,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The terminal outcome of a call: the code is the semantic signal, the
/// message is diagnostic only.
#[derive(Debug, Clone)]
pub struct Status {
    code: StatusCode,
    message: String,
    metadata: Headers,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: Headers::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn with_metadata(mut self, metadata: Headers) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn metadata(&self) -> &Headers {
        &self.metadata
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Map a transport failure observed by the client into a status.
    ///
    /// An aborted connection surfaces as `UNAVAILABLE` for a call in
    /// progress; after an explicit local cancel the same failure reads as
    /// `CANCELLED`.
    pub fn from_transport(err: &TransportError) -> Self {
        use TransportErrorKind::*;
        let code = match err.kind() {
            ConnectionFailed | Network => StatusCode::Unavailable,
            ConnectionTimeout | DeadlineExceeded => StatusCode::DeadlineExceeded,
            ConnectionReset | Closed | NotConnected => StatusCode::Unavailable,
            InvalidFrame | InvalidHeader | Protocol => StatusCode::Internal,
            ResourceExhausted => StatusCode::ResourceExhausted,
            InvalidArgument => StatusCode::InvalidArgument,
            Cancelled => StatusCode::Cancelled,
        };
        Self::new(code, err.to_string())
    }

    /// Map a transport failure on the server's inbound path.
    ///
    /// Malformed inbound traffic is the peer's fault, so framing violations
    /// surface as `INVALID_ARGUMENT` rather than `INTERNAL`.
    pub fn from_transport_inbound(err: &TransportError) -> Self {
        use TransportErrorKind::*;
        match err.kind() {
            InvalidFrame | InvalidHeader | Protocol => {
                Self::new(StatusCode::InvalidArgument, err.to_string())
            }
            _ => Self::from_transport(err),
        }
    }

    /// The header block conveying this status on the wire.
    pub(crate) fn to_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(HEADER_STATUS, (self.code as u32).to_string());
        if !self.message.is_empty() {
            headers.insert(HEADER_MESSAGE, self.message.clone());
        }
        for (name, value) in self.metadata.iter() {
            if !name.starts_with(':') {
                headers.append(name, value);
            }
        }
        headers
    }

    /// Recover a status from a response or trailer header block.
    ///
    /// A missing or malformed `:status` is itself an `INTERNAL` failure.
    pub(crate) fn from_headers(headers: &Headers) -> Result<Self, Status> {
        let raw = headers
            .get(HEADER_STATUS)
            .ok_or_else(|| Status::internal("response headers carry no :status"))?;
        let code = raw
            .parse::<u32>()
            .map_err(|_| Status::internal(format!("malformed :status {raw:?}")))?;

        let mut metadata = Headers::new();
        for (name, value) in headers.iter() {
            if !name.starts_with(':') && name != HEADER_MESSAGE {
                metadata.append(name, value);
            }
        }

        Ok(Self {
            code: StatusCode::from_u32(code),
            message: headers.get(HEADER_MESSAGE).unwrap_or_default().to_string(),
            metadata,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for value in 0..=16 {
            assert_eq!(StatusCode::from_u32(value) as u32, value);
        }
        assert_eq!(StatusCode::from_u32(99), StatusCode::Unknown);
    }

    #[test]
    fn headers_roundtrip() {
        let mut metadata = Headers::new();
        metadata.append("x-request-id", "r-17");
        let status = Status::new(StatusCode::NotFound, "no such row").with_metadata(metadata);

        let recovered = Status::from_headers(&status.to_headers()).unwrap();
        assert_eq!(recovered.code(), StatusCode::NotFound);
        assert_eq!(recovered.message(), "no such row");
        assert_eq!(recovered.metadata().get("x-request-id"), Some("r-17"));
    }

    #[test]
    fn missing_status_is_internal() {
        let err = Status::from_headers(&Headers::new()).unwrap_err();
        assert_eq!(err.code(), StatusCode::Internal);
    }

    #[test]
    fn transport_mapping_client_side() {
        let cases = [
            (TransportError::network("io"), StatusCode::Unavailable),
            (
                TransportError::connection_failed("dns"),
                StatusCode::Unavailable,
            ),
            (
                TransportError::deadline_exceeded("late"),
                StatusCode::DeadlineExceeded,
            ),
            (
                TransportError::connection_timeout("idle"),
                StatusCode::DeadlineExceeded,
            ),
            (TransportError::invalid_frame("junk"), StatusCode::Internal),
            (
                TransportError::resource_exhausted("window"),
                StatusCode::ResourceExhausted,
            ),
            (TransportError::cancelled("rst"), StatusCode::Cancelled),
            (TransportError::closed("gone"), StatusCode::Unavailable),
        ];
        for (err, code) in cases {
            assert_eq!(Status::from_transport(&err).code(), code, "{err}");
        }
    }

    #[test]
    fn transport_mapping_server_inbound() {
        let err = TransportError::invalid_frame("junk");
        assert_eq!(
            Status::from_transport_inbound(&err).code(),
            StatusCode::InvalidArgument
        );
        let err = TransportError::network("io");
        assert_eq!(
            Status::from_transport_inbound(&err).code(),
            StatusCode::Unavailable
        );
    }
}
