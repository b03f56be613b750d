use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use quinn::crypto::rustls::QuicServerConfig;
use rustls::server::WebPkiClientVerifier;
use tokio::net::lookup_host;
use zrpc_transport::{Connection, Endpoint, Listener, Scheme, TlsConfig, TransportError};

use crate::connection::QuinnConnection;
use crate::error::map_connection_error;
use crate::{ALPN, KEEP_ALIVE_INTERVAL, MAX_IDLE_TIMEOUT};

/// Bind a QUIC listener for the `zr` scheme.
pub(crate) async fn listen(
    endpoint: &Endpoint,
    tls: Option<&TlsConfig>,
) -> Result<QuinnListener, TransportError> {
    let tls = tls.ok_or_else(|| {
        TransportError::invalid_argument("quic listener requires a certificate and key")
    })?;

    let port = endpoint.port()?;
    let addr = resolve_bind(endpoint.host(), port).await?;

    let quic_endpoint = server_endpoint(tls, addr)?;
    let local = quic_endpoint
        .local_addr()
        .map_err(|err| TransportError::network(format!("local addr: {err}")))?;

    tracing::info!(%local, "quic listener bound");
    Ok(QuinnListener {
        endpoint: quic_endpoint,
        local: Endpoint::new(Scheme::Zr, endpoint.host(), local.port()),
        closed: AtomicBool::new(false),
    })
}

/// Build a server endpoint from TLS material. Exposed for callers that manage
/// endpoints themselves.
pub fn server_endpoint(tls: &TlsConfig, addr: SocketAddr) -> Result<quinn::Endpoint, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let key = tls
        .key
        .as_ref()
        .ok_or_else(|| TransportError::invalid_argument("server tls config has no key"))?
        .clone_key();

    let builder = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| TransportError::connection_failed(format!("tls setup: {err}")))?;

    let builder = if tls.require_client_cert {
        let mut roots = rustls::RootCertStore::empty();
        for cert in &tls.ca {
            roots
                .add(cert.clone())
                .map_err(|err| TransportError::invalid_argument(format!("bad ca cert: {err}")))?;
        }
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| TransportError::invalid_argument(format!("client verifier: {err}")))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut crypto = builder
        .with_single_cert(tls.cert.clone(), key)
        .map_err(|err| TransportError::invalid_argument(format!("bad server cert: {err}")))?;

    crypto.alpn_protocols = if tls.alpn.is_empty() {
        vec![ALPN.as_bytes().to_vec()]
    } else {
        tls.alpn.clone()
    };

    let config: QuicServerConfig = crypto
        .try_into()
        .map_err(|err| TransportError::connection_failed(format!("quic tls: {err}")))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(config));

    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_idle_timeout(Some(MAX_IDLE_TIMEOUT.try_into().map_err(|_| {
        TransportError::invalid_argument("idle timeout out of range")
    })?));
    config.transport_config(Arc::new(transport));

    quinn::Endpoint::server(config, addr)
        .map_err(|err| TransportError::network(format!("udp bind: {err}")))
}

async fn resolve_bind(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    if let Ok(addr) = format!("{host}:{port}").parse() {
        return Ok(addr);
    }
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|err| TransportError::connection_failed(format!("dns {host:?}: {err}")))?;
    addrs
        .next()
        .ok_or_else(|| TransportError::connection_failed(format!("dns {host:?}: no addresses")))
}

/// Accepts QUIC connections whose TLS handshake has completed.
pub struct QuinnListener {
    endpoint: quinn::Endpoint,
    local: Endpoint,
    closed: AtomicBool,
}

#[async_trait]
impl Listener for QuinnListener {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::closed("listener closed"));
            }

            let incoming = self
                .endpoint
                .accept()
                .await
                .ok_or_else(|| TransportError::closed("listener closed"))?;

            // Complete the handshake before handing the connection out; a
            // failed handshake only skips this peer.
            match incoming.await {
                Ok(conn) => {
                    tracing::debug!(remote = %conn.remote_address(), "accepted quic connection");
                    return Ok(Box::new(QuinnConnection::new(conn)));
                }
                Err(err) => {
                    tracing::debug!(err = %map_connection_error(err), "quic handshake failed");
                }
            }
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.endpoint.close(0u32.into(), b"listener closed");
        }
    }
}
