//! Transport-agnostic RPC runtime.
//!
//! The client and server speak a uniform framing over any transport that
//! implements the `zrpc-transport` SPI; the adapters in `zrpc-quinn` and
//! `zrpc-ws` are the reference implementations. Calls come in four shapes
//! (unary, client-stream, server-stream, bidi) with at-most-once per-stream
//! semantics, deadlines, cooperative cancellation and backpressure.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn example() -> Result<(), zrpc::Status> {
//! use zrpc::{CallOptions, Client};
//! use zrpc_transport::{Scheme, TransportRegistry};
//!
//! let registry = TransportRegistry::new()
//!     .register(Scheme::Ws, Arc::new(zrpc_ws::WsTransport::new()));
//!
//! let client = Client::builder(registry).dial("ws://127.0.0.1:9080").await?;
//! let reply = client
//!     .call("Echo/Say", &b"hello"[..], CallOptions::new())
//!     .await?;
//! # drop(reply);
//! # Ok(())
//! # }
//! ```

mod client;
mod context;
mod message;
mod server;
mod status;
mod streaming;

pub use client::{Client, ClientBuilder, ClientResponse};
pub use context::{CallOptions, RequestContext};
pub use server::{Handler, ResponseSink, Server, ServerBuilder};
pub use status::{Status, StatusCode};
pub use streaming::{StreamReceiver, StreamSender};

pub use zrpc_proto::Headers;
pub use zrpc_transport::{Endpoint, Scheme, TlsConfig, TransportRegistry};
