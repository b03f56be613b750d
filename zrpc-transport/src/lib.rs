//! The transport service-provider interface.
//!
//! Adapters implement these contracts over a concrete wire protocol (QUIC,
//! WebSocket, ...); the RPC core drives them through trait objects and never
//! names an adapter type. Every adapter failure maps into the
//! [`TransportError`] taxonomy before it crosses this boundary.

mod endpoint;
mod error;
mod registry;
mod tls;

use async_trait::async_trait;
pub use endpoint::{Endpoint, Scheme};
pub use error::{TransportError, TransportErrorKind};
pub use registry::TransportRegistry;
pub use tls::TlsConfig;
use zrpc_proto::Frame;

/// A wire protocol capable of dialing and listening on endpoints.
///
/// The SPI does not interpret schemes; callers bind schemes to transports
/// through a [`TransportRegistry`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a client connection to the endpoint.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsConfig>,
    ) -> Result<Box<dyn Connection>, TransportError>;

    /// Bind a server listener on the endpoint.
    async fn listen(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsConfig>,
    ) -> Result<Box<dyn Listener>, TransportError>;
}

/// Accepts peer connections; owned by a server process.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Suspend until a new peer handshake completes.
    ///
    /// Fails with `CLOSED` once [`Listener::close`] has been called.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// The endpoint the listener is bound to, with the resolved port.
    fn local_endpoint(&self) -> Endpoint;

    /// Stop accepting. Idempotent; in-flight accepts fail with `CLOSED`.
    async fn close(&self);
}

/// A peer connection multiplexing independent streams.
///
/// No stream outlives its connection: closing the connection cancels every
/// live stream.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a new locally-initiated stream.
    ///
    /// Fails with `RESOURCE_EXHAUSTED` when peer stream limits are reached.
    async fn open_stream(&self) -> Result<Box<dyn Stream>, TransportError>;

    /// Suspend until the peer opens a new stream.
    async fn accept_stream(&self) -> Result<Box<dyn Stream>, TransportError>;

    /// Probe peer liveness.
    async fn ping(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// The authenticated peer identity (TLS server name or certificate
    /// subject), when the transport has one.
    fn peer_identity(&self) -> Option<String>;

    /// Close the connection, cancelling every live stream.
    async fn close(&self);
}

/// One logical stream: the unit of a single RPC.
///
/// The send and receive sides close independently; the stream is terminal
/// once both are closed or either is reset. Methods take `&self` so the two
/// halves can be driven from separate tasks through a shared handle.
#[async_trait]
pub trait Stream: Send + Sync {
    /// The transport-local stream id (odd client-initiated, even
    /// server-initiated).
    fn id(&self) -> u64;

    /// Write one frame, suspending while flow control back-pressures.
    ///
    /// `END_STREAM` is monotonic: after a frame carries it, further writes
    /// fail with `CLOSED`.
    async fn write_frame(&self, frame: Frame) -> Result<(), TransportError>;

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` once the peer's side ended cleanly after
    /// `END_STREAM`. A reset surfaces as the mapped error instead.
    async fn read_frame(&self) -> Result<Option<Frame>, TransportError>;

    /// Abruptly reset both directions with a transport error code.
    ///
    /// Non-suspending; at most one reset is emitted per direction and
    /// repeated calls are no-ops.
    fn cancel(&self, code: u32);

    /// Gracefully finish the send side (`END_STREAM` / FIN equivalent).
    async fn close(&self) -> Result<(), TransportError>;
}
