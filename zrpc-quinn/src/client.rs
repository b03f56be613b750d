use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use quinn::crypto::rustls::QuicClientConfig;
use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::CertificateDer;
use tokio::net::lookup_host;
use zrpc_transport::{Endpoint, TlsConfig, TransportError};

use crate::error::{map_connect_error, map_connection_error};
use crate::{ALPN, KEEP_ALIVE_INTERVAL, MAX_IDLE_TIMEOUT};

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Establish a client connection for the `zr` scheme.
///
/// The endpoint handle comes back with the connection so the caller can keep
/// the UDP driver alive for the connection's lifetime.
pub(crate) async fn connect(
    endpoint: &Endpoint,
    tls: Option<&TlsConfig>,
) -> Result<(quinn::Connection, quinn::Endpoint), TransportError> {
    let port = endpoint.port()?;
    let (server_name, remote) = resolve(endpoint.host(), port).await?;
    let server_name = tls
        .and_then(|t| t.server_name.clone())
        .unwrap_or(server_name);

    let quic_endpoint = client_endpoint(tls)?;
    let connecting = quic_endpoint
        .connect(remote, &server_name)
        .map_err(map_connect_error)?;
    let conn = connecting.await.map_err(map_connection_error)?;

    tracing::debug!(%endpoint, remote = %conn.remote_address(), "quic connection established");
    Ok((conn, quic_endpoint))
}

/// Build a client endpoint with the ALPN and verification policy of the
/// supplied config. Exposed for callers that manage endpoints themselves.
pub fn client_endpoint(tls: Option<&TlsConfig>) -> Result<quinn::Endpoint, TransportError> {
    let provider = provider();

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| TransportError::connection_failed(format!("tls setup: {err}")))?;

    let verify_peer = tls.map(|t| t.verify_peer).unwrap_or(true);
    let roots = tls.map(|t| t.ca.as_slice()).unwrap_or_default();

    let builder = if !verify_peer {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
    } else if !roots.is_empty() {
        let mut store = rustls::RootCertStore::empty();
        for cert in roots {
            store
                .add(cert.clone())
                .map_err(|err| TransportError::invalid_argument(format!("bad ca cert: {err}")))?;
        }
        builder.with_root_certificates(store)
    } else {
        builder.with_root_certificates(system_roots())
    };

    let mut crypto = match tls.and_then(|t| t.key.as_ref().map(|k| (t.cert.clone(), k.clone_key()))) {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|err| TransportError::invalid_argument(format!("bad client cert: {err}")))?,
        None => builder.with_no_client_auth(),
    };

    crypto.alpn_protocols = match tls.map(|t| t.alpn.clone()).filter(|a| !a.is_empty()) {
        Some(alpn) => alpn,
        None => vec![ALPN.as_bytes().to_vec()],
    };

    let client_config = QuicClientConfig::try_from(crypto)
        .map_err(|err| TransportError::connection_failed(format!("quic tls: {err}")))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(client_config));

    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_idle_timeout(Some(MAX_IDLE_TIMEOUT.try_into().map_err(|_| {
        TransportError::invalid_argument("idle timeout out of range")
    })?));
    client_config.transport_config(Arc::new(transport));

    let mut endpoint = quinn::Endpoint::client(
        "[::]:0"
            .parse()
            .expect("wildcard address is always parseable"),
    )
    .map_err(|err| TransportError::network(format!("udp bind: {err}")))?;
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

fn system_roots() -> rustls::RootCertStore {
    let mut store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in native.errors {
        tracing::warn!(?err, "failed to load root cert");
    }
    for cert in native.certs {
        if let Err(err) = store.add(cert) {
            tracing::warn!(?err, "failed to add root cert");
        }
    }

    store
}

async fn resolve(host: &str, port: u16) -> Result<(String, SocketAddr), TransportError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok((host.to_string(), SocketAddr::new(ip, port)));
    }

    let mut remotes = lookup_host((host, port))
        .await
        .map_err(|err| TransportError::connection_failed(format!("dns {host:?}: {err}")))?;

    match remotes.next() {
        Some(remote) => Ok((host.to_string(), remote)),
        None => Err(TransportError::connection_failed(format!(
            "dns {host:?}: no addresses"
        ))),
    }
}

/// Accept any server certificate. Only reachable through
/// [`TlsConfig::dangerous_without_verification`].
#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
