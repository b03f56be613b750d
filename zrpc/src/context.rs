use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zrpc_proto::Headers;

/// Per-call context handed to a server handler.
///
/// Lives from the request's HEADERS frame until the stream reaches a terminal
/// state; the cancellation token fires on reset, timeout and connection
/// close.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: String,
    metadata: Headers,
    deadline: Option<Instant>,
    peer_identity: Option<String>,
    cancel: CancellationToken,
}

impl RequestContext {
    pub(crate) fn new(
        method: String,
        metadata: Headers,
        deadline: Option<Instant>,
        peer_identity: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            method,
            metadata,
            deadline,
            peer_identity,
            cancel,
        }
    }

    /// The fully-qualified `Service/Method` name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Application metadata from the request headers, pseudo-headers
    /// excluded.
    pub fn metadata(&self) -> &Headers {
        &self.metadata
    }

    /// The effective deadline: the shorter of the caller's budget and the
    /// server's own policy.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Budget left before the deadline, if one is set.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn peer_identity(&self) -> Option<&str> {
        self.peer_identity.as_deref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Suspend until the call is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Per-call options on the client side.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub(crate) deadline: Option<Duration>,
    pub(crate) metadata: Headers,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the whole call; expiry cancels the stream and surfaces
    /// `DEADLINE_EXCEEDED`.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach application metadata to the request headers. Names starting
    /// with `:` are reserved and skipped.
    pub fn with_metadata(mut self, metadata: Headers) -> Self {
        self.metadata = metadata;
        self
    }
}
