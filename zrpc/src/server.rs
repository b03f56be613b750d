use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zrpc_proto::{
    Frame, FrameType, Headers, DEFAULT_MAX_FRAME_SIZE, FLAG_END_HEADERS, HEADER_DEADLINE_MS,
    HEADER_METHOD,
};
use zrpc_transport::{
    Connection, Endpoint, Listener, Stream as TransportStream, TlsConfig, TransportErrorKind,
    TransportRegistry,
};

use crate::context::RequestContext;
use crate::streaming::{guard, CallShared, StreamReceiver, StreamSender};
use crate::{Status, StatusCode};

/// How long a freshly-accepted stream may take to produce its HEADERS frame.
const HEADERS_TIMEOUT: Duration = Duration::from_secs(15);

/// A method implementation bound into the dispatch table.
///
/// Exactly one handler runs per stream. The receiver yields the request
/// message(s); the sink enforces the response framing order (headers, data,
/// `END_STREAM`) no matter how the handler fails.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(
        &self,
        ctx: RequestContext,
        request: StreamReceiver,
        response: &mut ResponseSink,
    ) -> Result<(), Status>;
}

/// Configures a [`Server`].
pub struct ServerBuilder {
    registry: TransportRegistry,
    tls: Option<TlsConfig>,
    max_frame: u32,
    max_deadline: Duration,
}

impl ServerBuilder {
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// The server-side ceiling on any call's budget; the client's
    /// `:deadline-ms` only ever shortens it.
    pub fn with_max_deadline(mut self, max_deadline: Duration) -> Self {
        self.max_deadline = max_deadline;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame: u32) -> Self {
        self.max_frame = max_frame.min(zrpc_proto::MAX_FRAME_SIZE);
        self
    }

    pub fn finish(self) -> Server {
        Server {
            registry: self.registry,
            tls: self.tls,
            config: Arc::new(ServeConfig {
                max_frame: self.max_frame,
                max_deadline: self.max_deadline,
            }),
            handlers: HashMap::new(),
            listener: None,
        }
    }
}

struct ServeConfig {
    max_frame: u32,
    max_deadline: Duration,
}

/// An RPC server: a dispatch table plus one listener.
///
/// Registration is append-only and must be complete before [`Server::serve`];
/// the dispatch table is never locked afterwards.
pub struct Server {
    registry: TransportRegistry,
    tls: Option<TlsConfig>,
    config: Arc<ServeConfig>,
    handlers: HashMap<String, Arc<dyn Handler>>,
    listener: Option<Box<dyn Listener>>,
}

impl Server {
    pub fn builder(registry: TransportRegistry) -> ServerBuilder {
        ServerBuilder {
            registry,
            tls: None,
            max_frame: DEFAULT_MAX_FRAME_SIZE,
            max_deadline: Duration::from_secs(30),
        }
    }

    /// Bind a handler to a fully-qualified `Service/Method` name.
    pub fn register(&mut self, method: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.handlers.insert(method.into(), Arc::new(handler));
        self
    }

    /// Bind a unary function: one request message in, one response out.
    pub fn register_unary<F, Fut>(&mut self, method: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(RequestContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
    {
        self.register(method, UnaryFn { f })
    }

    /// Resolve the endpoint's transport and bind its listener.
    ///
    /// Returns the bound endpoint with the resolved port.
    pub async fn bind(&mut self, endpoint: &str) -> Result<Endpoint, Status> {
        let endpoint = Endpoint::parse(endpoint).map_err(|err| Status::from_transport(&err))?;
        let transport = self
            .registry
            .get(endpoint.scheme())
            .map_err(|err| Status::from_transport(&err))?;

        let listener = transport
            .listen(&endpoint, self.tls.as_ref())
            .await
            .map_err(|err| Status::from_transport(&err))?;

        let local = listener.local_endpoint();
        self.listener = Some(listener);
        Ok(local)
    }

    /// Run the accept loop until the listener closes.
    ///
    /// Each connection gets a supervisor task; each stream on it gets a
    /// handler task. A panicking handler costs its stream, never the
    /// connection.
    pub async fn serve(mut self) -> Result<(), Status> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| Status::internal("serve() called before bind()"))?;

        // Frozen before the first accept; shared read-only from here on.
        let dispatch = Arc::new(self.handlers);

        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let conn: Arc<dyn Connection> = Arc::from(conn);
                    tokio::spawn(supervise_connection(
                        conn,
                        dispatch.clone(),
                        self.config.clone(),
                    ));
                }
                Err(err) if err.kind() == TransportErrorKind::Closed => {
                    tracing::info!("listener closed, server stopping");
                    return Ok(());
                }
                Err(err) => return Err(Status::from_transport(&err)),
            }
        }
    }
}

/// Per-connection accept loop for inbound streams.
async fn supervise_connection(
    conn: Arc<dyn Connection>,
    dispatch: Arc<HashMap<String, Arc<dyn Handler>>>,
    config: Arc<ServeConfig>,
) {
    loop {
        let stream = match conn.accept_stream().await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(%err, "connection finished");
                return;
            }
        };

        let stream: Arc<dyn TransportStream> = Arc::from(stream);
        let conn = conn.clone();
        let dispatch = dispatch.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(status) = serve_stream(stream, conn, dispatch, config).await {
                tracing::debug!(%status, "stream finished with error");
            }
        });
    }
}

async fn serve_stream(
    stream: Arc<dyn TransportStream>,
    conn: Arc<dyn Connection>,
    dispatch: Arc<HashMap<String, Arc<dyn Handler>>>,
    config: Arc<ServeConfig>,
) -> Result<(), Status> {
    // The stream's first frame must be a complete header block.
    let frame = tokio::time::timeout(HEADERS_TIMEOUT, stream.read_frame())
        .await
        .map_err(|_| {
            stream.cancel(TransportErrorKind::ConnectionTimeout.code());
            Status::deadline_exceeded("no request headers within handshake budget")
        })?
        .map_err(|err| Status::from_transport_inbound(&err))?;

    let Some(frame) = frame else {
        return Err(Status::invalid_argument("stream closed before headers"));
    };
    if frame.frame_type != FrameType::Headers || frame.flags & FLAG_END_HEADERS == 0 {
        stream.cancel(TransportErrorKind::Protocol.code());
        return Err(Status::invalid_argument(format!(
            "expected request headers, got {:?}",
            frame.frame_type
        )));
    }

    let mut block = frame.payload.clone();
    let request_headers = match Headers::decode(&mut block) {
        Ok(headers) => headers,
        Err(err) => {
            stream.cancel(TransportErrorKind::InvalidHeader.code());
            return Err(Status::invalid_argument(format!("malformed headers: {err}")));
        }
    };
    let request_ended = frame.is_end_stream();

    let Some(method) = request_headers.get(HEADER_METHOD).map(str::to_string) else {
        respond_terminal(&stream, Status::invalid_argument("missing :method header")).await;
        return Ok(());
    };

    // The client's budget is only an upper bound on our own policy.
    let client_budget = request_headers
        .get(HEADER_DEADLINE_MS)
        .and_then(|ms| ms.parse::<u64>().ok())
        .map(Duration::from_millis);
    let budget = client_budget
        .map(|b| b.min(config.max_deadline))
        .unwrap_or(config.max_deadline);
    let deadline = Instant::now() + budget;

    let mut metadata = Headers::new();
    for (name, value) in request_headers.iter() {
        if !name.starts_with(':') {
            metadata.append(name, value);
        }
    }

    let Some(handler) = dispatch.get(&method).cloned() else {
        tracing::debug!(%method, "unknown method");
        respond_terminal(
            &stream,
            Status::unimplemented(format!("unknown method {method:?}")),
        )
        .await;
        return Ok(());
    };

    let cancel = CancellationToken::new();
    let ctx = RequestContext::new(
        method.clone(),
        metadata,
        Some(deadline),
        conn.peer_identity(),
        cancel.clone(),
    );

    let shared = Arc::new(CallShared {
        stream: stream.clone(),
        deadline: Some(deadline),
        cancel: cancel.clone(),
        server_side: true,
        max_frame: config.max_frame,
    });

    let receiver = StreamReceiver::request(shared.clone(), request_ended);
    let mut sink = ResponseSink::new(shared);

    // The handler runs in its own task so a panic is contained to this
    // stream.
    let task = tokio::spawn(async move {
        let outcome = handler.call(ctx, receiver, &mut sink).await;
        match outcome {
            Ok(()) => sink.finish_ok().await,
            Err(status) => sink.finish_err(status).await,
        }
    });

    tokio::select! {
        joined = task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(status)) => {
                tracing::debug!(%method, %status, "response could not be completed");
                Ok(())
            }
            Err(join_err) if join_err.is_panic() => {
                tracing::error!(%method, "handler panicked");
                stream.cancel(TransportErrorKind::Protocol.code());
                Err(Status::internal("handler panicked"))
            }
            Err(_) => Ok(()),
        },
        _ = tokio::time::sleep_until(deadline) => {
            tracing::debug!(%method, "deadline fired, cancelling handler");
            cancel.cancel();
            stream.cancel(TransportErrorKind::DeadlineExceeded.code());
            // The detached handler observes the token at its next suspension
            // point; its writes fail from here on.
            Ok(())
        }
    }
}

/// Reply with a status-only header block and end the stream.
async fn respond_terminal(stream: &Arc<dyn TransportStream>, status: Status) {
    let frame = Frame::headers(status_block(&status), true);
    if let Err(err) = stream.write_frame(frame).await {
        tracing::debug!(%err, "failed to send terminal status");
    }
}

/// Encode a status header block, stripping the message and metadata when
/// they cannot fit the header codec; the code must still reach the peer.
fn status_block(status: &Status) -> Bytes {
    match status.to_headers().to_bytes() {
        Ok(block) => block,
        Err(err) => {
            tracing::warn!(%err, code = %status.code(), "stripping unencodable status block");
            Status::new(status.code(), "")
                .to_headers()
                .to_bytes()
                .expect("bare status always encodes")
        }
    }
}

/// The response side handed to a handler.
///
/// Guarantees the wire order headers, data, `END_STREAM`: the OK header block
/// goes out lazily before the first message, and a failure after that point
/// is carried in trailers instead.
pub struct ResponseSink {
    shared: Arc<CallShared>,
    sender: StreamSender,
    metadata: Headers,
    headers_sent: bool,
    finished: bool,
}

impl ResponseSink {
    fn new(shared: Arc<CallShared>) -> Self {
        Self {
            sender: StreamSender::new(shared.clone()),
            shared,
            metadata: Headers::new(),
            headers_sent: false,
            finished: false,
        }
    }

    /// Attach response header metadata; ignored once headers are sent.
    pub fn set_metadata(&mut self, metadata: Headers) {
        if !self.headers_sent {
            self.metadata = metadata;
        }
    }

    /// Send one response message, emitting the OK headers first if needed.
    pub async fn send(&mut self, message: impl Into<Bytes>) -> Result<(), Status> {
        self.ensure_headers(false).await?;
        self.sender.send(message).await
    }

    async fn ensure_headers(&mut self, end_stream: bool) -> Result<(), Status> {
        if self.headers_sent {
            return Ok(());
        }
        let block = Status::ok()
            .with_metadata(self.metadata.clone())
            .to_headers()
            .to_bytes()
            .map_err(|err| Status::internal(format!("response metadata: {err}")))?;
        let frame = Frame::headers(block, end_stream);
        guard(&self.shared, self.shared.stream.write_frame(frame)).await?;
        self.headers_sent = true;
        Ok(())
    }

    /// Terminate successfully: emit headers if none went out, then
    /// `END_STREAM`.
    pub(crate) async fn finish_ok(&mut self) -> Result<(), Status> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        if !self.headers_sent {
            return self.ensure_headers(true).await;
        }
        self.sender.finish().await
    }

    /// Terminate with an error status, as headers or trailers depending on
    /// how far the response got.
    pub(crate) async fn finish_err(&mut self, status: Status) -> Result<(), Status> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let frame = Frame::headers(status_block(&status), true);
        guard(&self.shared, self.shared.stream.write_frame(frame)).await
    }
}

struct UnaryFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for UnaryFn<F>
where
    F: Fn(RequestContext, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
{
    async fn call(
        &self,
        ctx: RequestContext,
        mut request: StreamReceiver,
        response: &mut ResponseSink,
    ) -> Result<(), Status> {
        let Some(payload) = request.recv().await? else {
            return Err(Status::invalid_argument("request carried no payload"));
        };
        if request.recv().await?.is_some() {
            return Err(Status::new(
                StatusCode::InvalidArgument,
                "unary request carried multiple messages",
            ));
        }

        let reply = (self.f)(ctx, payload).await?;
        response.send(reply).await?;
        Ok(())
    }
}
