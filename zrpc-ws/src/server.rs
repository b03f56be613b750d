use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;
use tokio_util::sync::CancellationToken;
use zrpc_proto::Settings;
use zrpc_transport::{Connection, Endpoint, Listener, Scheme, TlsConfig, TransportError};

use crate::connection::WsConnection;
use crate::error::map_ws_error;

/// Bind a TCP listener for the `ws` or `wss` scheme.
pub(crate) async fn listen(
    endpoint: &Endpoint,
    tls: Option<&TlsConfig>,
    settings: Settings,
) -> Result<WsListener, TransportError> {
    let acceptor = match endpoint.scheme() {
        Scheme::Ws => None,
        Scheme::Wss => {
            let tls = tls.ok_or_else(|| {
                TransportError::invalid_argument("wss listener requires a certificate and key")
            })?;
            Some(tls_acceptor(tls)?)
        }
        other => {
            return Err(TransportError::invalid_argument(format!(
                "websocket transport cannot listen on scheme {other}"
            )))
        }
    };

    let port = endpoint.port()?;
    let addr = resolve_bind(endpoint.host(), port).await?;
    let tcp = TcpListener::bind(addr)
        .await
        .map_err(|err| TransportError::network(format!("tcp bind: {err}")))?;
    let local = tcp
        .local_addr()
        .map_err(|err| TransportError::network(format!("local addr: {err}")))?;

    tracing::info!(%local, "websocket listener bound");
    Ok(WsListener {
        tcp,
        acceptor,
        local: Endpoint::new(endpoint.scheme(), endpoint.host(), local.port()),
        closed: CancellationToken::new(),
        settings,
    })
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

fn tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let key = tls
        .key
        .as_ref()
        .ok_or_else(|| TransportError::invalid_argument("server tls config has no key"))?
        .clone_key();

    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| TransportError::connection_failed(format!("tls setup: {err}")))?
        .with_no_client_auth()
        .with_single_cert(tls.cert.clone(), key)
        .map_err(|err| TransportError::invalid_argument(format!("bad server cert: {err}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accepts upgraded WebSocket connections.
pub struct WsListener {
    tcp: TcpListener,
    acceptor: Option<TlsAcceptor>,
    local: Endpoint,
    closed: CancellationToken,
    settings: Settings,
}

impl WsListener {
    async fn upgrade(&self, stream: TcpStream, peer: SocketAddr) -> Result<WsConnection, TransportError> {
        match &self.acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|err| TransportError::connection_failed(format!("tls accept: {err}")))?;
                let ws = accept_async(tls_stream).await.map_err(map_ws_error)?;
                WsConnection::new(ws, true, Some(peer.to_string()), self.settings).await
            }
            None => {
                let ws = accept_async(stream).await.map_err(map_ws_error)?;
                WsConnection::new(ws, true, Some(peer.to_string()), self.settings).await
            }
        }
    }
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return Err(TransportError::closed("listener closed")),
                accepted = self.tcp.accept() => accepted
                    .map_err(|err| TransportError::network(format!("tcp accept: {err}")))?,
            };

            // A failed upgrade only skips this peer.
            match self.upgrade(stream, peer).await {
                Ok(conn) => {
                    tracing::debug!(%peer, "accepted websocket connection");
                    return Ok(Box::new(conn));
                }
                Err(err) => {
                    tracing::debug!(%peer, %err, "websocket handshake failed");
                }
            }
        }
    }

    fn local_endpoint(&self) -> Endpoint {
        self.local.clone()
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
