use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zrpc_proto::Headers;
use zrpc_transport::{Stream as TransportStream, TransportError, TransportErrorKind};

use crate::message::{send_message, MessageReader};
use crate::{Status, StatusCode};

/// Per-call state shared by the send and receive halves.
pub(crate) struct CallShared {
    pub stream: Arc<dyn TransportStream>,
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
    pub server_side: bool,
    pub max_frame: u32,
}

impl CallShared {
    /// Cancel the call locally: the stream resets with `CANCELLED` and every
    /// later operation on either half fails the same way.
    pub fn cancel_call(&self) {
        self.cancel.cancel();
        self.stream.cancel(TransportErrorKind::Cancelled.code());
    }

    pub fn map_err(&self, err: &TransportError) -> Status {
        // A peer reset or torn connection is a cancellation signal for the
        // handler; the next suspension point in the handler observes it.
        if self.server_side {
            use TransportErrorKind::*;
            if matches!(
                err.kind(),
                Cancelled | ConnectionReset | Closed | NotConnected | DeadlineExceeded
            ) {
                self.cancel.cancel();
            }
            Status::from_transport_inbound(err)
        } else {
            Status::from_transport(err)
        }
    }
}

/// Run one stream operation under the call's cancel token and deadline.
///
/// Every suspension point of a call funnels through here, which is what makes
/// cancellation cooperative: the token or the timer wins the race, resets the
/// stream, and the mapped status comes back.
pub(crate) async fn guard<T, F>(shared: &CallShared, op: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::pin!(op);
    let result = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {
            shared.stream.cancel(TransportErrorKind::Cancelled.code());
            return Err(Status::cancelled("call cancelled"));
        }
        _ = deadline_sleep(shared.deadline) => {
            shared.cancel.cancel();
            shared.stream.cancel(TransportErrorKind::DeadlineExceeded.code());
            return Err(Status::deadline_exceeded("call deadline exceeded"));
        }
        result = &mut op => result,
    };
    result.map_err(|err| shared.map_err(&err))
}

/// [`guard`] for operations whose failures are already statuses.
pub(crate) async fn guard_status<T, F>(shared: &CallShared, op: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    tokio::pin!(op);
    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => {
            shared.stream.cancel(TransportErrorKind::Cancelled.code());
            Err(Status::cancelled("call cancelled"))
        }
        _ = deadline_sleep(shared.deadline) => {
            shared.cancel.cancel();
            shared.stream.cancel(TransportErrorKind::DeadlineExceeded.code());
            Err(Status::deadline_exceeded("call deadline exceeded"))
        }
        result = &mut op => result,
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The sending half of a streaming call.
///
/// Independent of the receive half: finishing or dropping this side leaves
/// the peer free to keep sending.
pub struct StreamSender {
    shared: Arc<CallShared>,
    finished: bool,
}

impl StreamSender {
    pub(crate) fn new(shared: Arc<CallShared>) -> Self {
        Self {
            shared,
            finished: false,
        }
    }

    /// Send one message, suspending while the stream is back-pressured.
    pub async fn send(&mut self, message: impl Into<Bytes>) -> Result<(), Status> {
        self.send_inner(message.into(), false).await
    }

    /// Send a final message and close the send side in one step.
    pub async fn send_last(&mut self, message: impl Into<Bytes>) -> Result<(), Status> {
        self.send_inner(message.into(), true).await
    }

    async fn send_inner(&mut self, message: Bytes, end: bool) -> Result<(), Status> {
        if self.finished {
            return Err(Status::new(
                StatusCode::FailedPrecondition,
                "send side already finished",
            ));
        }
        let shared = &self.shared;
        guard(
            shared,
            send_message(&*shared.stream, &message, shared.max_frame, end),
        )
        .await?;
        if end {
            self.finished = true;
        }
        Ok(())
    }

    /// Close the send side with `END_STREAM`. Idempotent.
    pub async fn finish(&mut self) -> Result<(), Status> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let shared = &self.shared;
        guard(shared, shared.stream.close()).await
    }

    /// Abort the whole call; the peer observes `CANCELLED`.
    pub fn cancel(&self) {
        self.shared.cancel_call();
    }
}

/// The receiving half of a streaming call.
///
/// On the client this parses the response HEADERS (and its status) before the
/// first message; on the server the request headers were consumed by the
/// dispatcher and only messages remain.
pub struct StreamReceiver {
    shared: Arc<CallShared>,
    reader: MessageReader,
    expect_headers: bool,
    response_metadata: Option<Headers>,
    terminal: Option<Status>,
}

impl StreamReceiver {
    /// A client-side receiver: the next inbound frame must be the response
    /// HEADERS.
    pub(crate) fn response(shared: Arc<CallShared>) -> Self {
        Self {
            shared,
            reader: MessageReader::new(false),
            expect_headers: true,
            response_metadata: None,
            terminal: None,
        }
    }

    /// A server-side receiver for a request whose HEADERS frame is already
    /// consumed; `ended` marks a request that finished on its headers.
    pub(crate) fn request(shared: Arc<CallShared>, ended: bool) -> Self {
        Self {
            shared,
            reader: MessageReader::new(ended),
            expect_headers: false,
            response_metadata: None,
            terminal: None,
        }
    }

    /// Parse the response headers if they have not arrived yet.
    ///
    /// A terminal (non-OK) status in those headers ends the call here; no
    /// further frames are read.
    pub(crate) async fn ensure_headers(&mut self) -> Result<(), Status> {
        if !self.expect_headers {
            return Ok(());
        }

        let shared = self.shared.clone();
        let frame = guard(&shared, shared.stream.read_frame()).await?;
        let Some(frame) = frame else {
            return Err(Status::unavailable("stream closed before response headers"));
        };
        if frame.frame_type != zrpc_proto::FrameType::Headers {
            shared
                .stream
                .cancel(TransportErrorKind::Protocol.code());
            return Err(Status::internal(format!(
                "expected response headers, got {:?}",
                frame.frame_type
            )));
        }

        let mut block = frame.payload.clone();
        let headers = Headers::decode(&mut block)
            .map_err(|err| Status::internal(format!("malformed response headers: {err}")))?;
        let status = Status::from_headers(&headers)?;
        self.expect_headers = false;

        if !status.is_ok() {
            self.terminal = Some(status.clone());
            return Err(status);
        }

        self.response_metadata = Some(headers);
        if frame.is_end_stream() {
            // An empty-but-successful response stream.
            self.reader = MessageReader::new(true);
        }
        Ok(())
    }

    /// The next message, or `None` once the peer half ended.
    ///
    /// A non-OK status in the response headers or trailers surfaces as the
    /// error; messages are delivered in order and never reordered.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        if let Some(status) = &self.terminal {
            return Err(status.clone());
        }
        self.ensure_headers().await?;

        let shared = self.shared.clone();
        let message = guard_status(
            &shared,
            self.reader
                .next_message(&*shared.stream, |err| shared.map_err(err)),
        )
        .await?;

        if message.is_none() {
            if let Some(trailers) = self.reader.trailers() {
                let status = Status::from_headers(trailers)?;
                if !status.is_ok() {
                    self.terminal = Some(status.clone());
                    return Err(status);
                }
            }
        }
        Ok(message)
    }

    /// Response header metadata, once headers have been read (client side).
    pub fn metadata(&self) -> Option<&Headers> {
        self.response_metadata.as_ref()
    }

    /// Trailing metadata, once the stream has ended with trailers.
    pub fn trailers(&self) -> Option<&Headers> {
        self.reader.trailers()
    }

    /// Abort the whole call; the peer observes `CANCELLED`.
    pub fn cancel(&self) {
        self.shared.cancel_call();
    }
}
