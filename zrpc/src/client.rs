use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zrpc_proto::{
    Frame, Headers, CONTENT_TYPE, DEFAULT_MAX_FRAME_SIZE, HEADER_CONTENT_TYPE, HEADER_DEADLINE_MS,
    HEADER_METHOD,
};
use zrpc_transport::{Connection, Endpoint, TlsConfig, TransportRegistry};

use crate::message::send_message;
use crate::streaming::{guard, CallShared, StreamReceiver, StreamSender};
use crate::{CallOptions, Status};

/// An RPC client bound to one connection.
///
/// Cheap to clone; all clones share the connection and its streams.
#[derive(Clone)]
pub struct Client {
    conn: Arc<dyn Connection>,
    max_frame: u32,
    default_deadline: Option<Duration>,
}

/// Configures and dials a [`Client`].
pub struct ClientBuilder {
    registry: TransportRegistry,
    tls: Option<TlsConfig>,
    max_frame: u32,
    default_deadline: Option<Duration>,
}

impl Client {
    /// Start a builder over the caller's scheme-to-transport bindings.
    pub fn builder(registry: TransportRegistry) -> ClientBuilder {
        ClientBuilder {
            registry,
            tls: None,
            max_frame: DEFAULT_MAX_FRAME_SIZE,
            default_deadline: None,
        }
    }

    /// Unary call: one request message, one response message.
    ///
    /// The deadline is armed before the stream opens; expiry at any point
    /// resets the stream and returns `DEADLINE_EXCEEDED`.
    pub async fn call(
        &self,
        method: &str,
        request: impl Into<Bytes>,
        options: CallOptions,
    ) -> Result<Bytes, Status> {
        let request = request.into();
        let shared = self.start(method, &options).await?;

        guard(
            &shared,
            send_message(&*shared.stream, &request, shared.max_frame, true),
        )
        .await?;

        let mut receiver = StreamReceiver::response(shared);
        unary_response(&mut receiver).await
    }

    /// Client streaming: the caller sends N messages, the server replies with
    /// one.
    pub async fn open_client_stream(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<(StreamSender, ClientResponse), Status> {
        let shared = self.start(method, &options).await?;
        let sender = StreamSender::new(shared.clone());
        let response = ClientResponse {
            receiver: StreamReceiver::response(shared),
        };
        Ok((sender, response))
    }

    /// Server streaming: one request message, N response messages.
    pub async fn open_server_stream(
        &self,
        method: &str,
        request: impl Into<Bytes>,
        options: CallOptions,
    ) -> Result<StreamReceiver, Status> {
        let request = request.into();
        let shared = self.start(method, &options).await?;

        guard(
            &shared,
            send_message(&*shared.stream, &request, shared.max_frame, true),
        )
        .await?;

        let mut receiver = StreamReceiver::response(shared);
        // Surface UNIMPLEMENTED and friends here rather than on first recv.
        receiver.ensure_headers().await?;
        Ok(receiver)
    }

    /// Bidirectional streaming: both sides send independently.
    pub async fn open_bidi(
        &self,
        method: &str,
        options: CallOptions,
    ) -> Result<(StreamSender, StreamReceiver), Status> {
        let shared = self.start(method, &options).await?;
        let sender = StreamSender::new(shared.clone());
        let receiver = StreamReceiver::response(shared);
        Ok((sender, receiver))
    }

    /// Probe connection liveness through the transport.
    pub async fn ping(&self) -> Result<(), Status> {
        self.conn
            .ping()
            .await
            .map_err(|err| Status::from_transport(&err))
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Close the connection, cancelling every call still in flight.
    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// Open the stream and emit the request HEADERS frame.
    async fn start(&self, method: &str, options: &CallOptions) -> Result<Arc<CallShared>, Status> {
        if method.is_empty() || method.starts_with(':') {
            return Err(Status::invalid_argument(format!("bad method name {method:?}")));
        }

        let deadline = options
            .deadline
            .or(self.default_deadline)
            .map(|budget| Instant::now() + budget);

        let mut headers = Headers::new();
        headers.insert(HEADER_METHOD, method);
        if let Some(at) = deadline {
            let remaining = at.saturating_duration_since(Instant::now());
            headers.insert(HEADER_DEADLINE_MS, remaining.as_millis().to_string());
        }
        if !options.metadata.contains(HEADER_CONTENT_TYPE) {
            headers.insert(HEADER_CONTENT_TYPE, CONTENT_TYPE);
        }
        for (name, value) in options.metadata.iter() {
            if !name.starts_with(':') {
                headers.append(name, value);
            }
        }
        // Encode before the stream opens so oversize metadata costs nothing
        // on the wire.
        let block = headers
            .to_bytes()
            .map_err(|err| Status::invalid_argument(format!("request metadata: {err}")))?;

        // No stream exists yet, so a plain timeout bounds the open.
        let open = self.conn.open_stream();
        let stream = match deadline {
            Some(at) => tokio::time::timeout_at(at, open)
                .await
                .map_err(|_| Status::deadline_exceeded("deadline before stream opened"))?,
            None => open.await,
        }
        .map_err(|err| Status::from_transport(&err))?;

        let shared = Arc::new(CallShared {
            stream: Arc::from(stream),
            deadline,
            cancel: CancellationToken::new(),
            server_side: false,
            max_frame: self.max_frame,
        });

        guard(
            &shared,
            shared.stream.write_frame(Frame::headers(block, false)),
        )
        .await?;

        tracing::debug!(method, stream = shared.stream.id(), "call started");
        Ok(shared)
    }
}

impl ClientBuilder {
    /// TLS material passed through to the selected transport.
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Applied to calls whose options carry no deadline of their own.
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = Some(deadline);
        self
    }

    pub fn with_max_frame_size(mut self, max_frame: u32) -> Self {
        self.max_frame = max_frame.min(zrpc_proto::MAX_FRAME_SIZE);
        self
    }

    /// Select the transport by endpoint scheme and establish the connection.
    pub async fn dial(self, endpoint: &str) -> Result<Client, Status> {
        let endpoint = Endpoint::parse(endpoint).map_err(|err| Status::from_transport(&err))?;
        let transport = self
            .registry
            .get(endpoint.scheme())
            .map_err(|err| Status::from_transport(&err))?;

        let conn = transport
            .connect(&endpoint, self.tls.as_ref())
            .await
            .map_err(|err| Status::from_transport(&err))?;

        tracing::info!(%endpoint, "client connected");
        Ok(Client {
            conn: Arc::from(conn),
            max_frame: self.max_frame,
            default_deadline: self.default_deadline,
        })
    }
}

/// The pending single response of a client-streaming call.
pub struct ClientResponse {
    receiver: StreamReceiver,
}

impl ClientResponse {
    /// Await the server's one response message.
    pub async fn response(mut self) -> Result<Bytes, Status> {
        unary_response(&mut self.receiver).await
    }

    /// Abort the whole call; the peer observes `CANCELLED`.
    pub fn cancel(&self) {
        self.receiver.cancel();
    }
}

async fn unary_response(receiver: &mut StreamReceiver) -> Result<Bytes, Status> {
    let Some(payload) = receiver.recv().await? else {
        return Err(Status::internal("response carried no payload"));
    };
    // Drain the end-of-stream marker so trailers are observed.
    if receiver.recv().await?.is_some() {
        return Err(Status::internal("unary response carried multiple messages"));
    }
    Ok(payload)
}
