use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::CertificateDer;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use zrpc_proto::Settings;
use zrpc_transport::{Endpoint, Scheme, TlsConfig, TransportError};

use crate::connection::WsConnection;
use crate::error::map_ws_error;

/// Dial a `ws` or `wss` endpoint and complete the RFC 6455 upgrade.
pub(crate) async fn connect(
    endpoint: &Endpoint,
    tls: Option<&TlsConfig>,
    settings: Settings,
) -> Result<WsConnection, TransportError> {
    let url = request_url(endpoint)?;

    let connector = match endpoint.scheme() {
        Scheme::Ws => Connector::Plain,
        Scheme::Wss => Connector::Rustls(Arc::new(client_tls(tls)?)),
        other => {
            return Err(TransportError::invalid_argument(format!(
                "websocket transport cannot dial scheme {other}"
            )))
        }
    };

    let (ws, _response) = connect_async_tls_with_config(&url, None, false, Some(connector))
        .await
        .map_err(map_ws_error)?;

    tracing::debug!(%url, "websocket upgrade complete");

    let identity = match endpoint.scheme() {
        Scheme::Wss => Some(
            tls.and_then(|t| t.server_name.clone())
                .unwrap_or_else(|| endpoint.host().to_string()),
        ),
        _ => None,
    };

    WsConnection::new(ws, false, identity, settings).await
}

fn request_url(endpoint: &Endpoint) -> Result<String, TransportError> {
    let path = if endpoint.path().is_empty() {
        "/"
    } else {
        endpoint.path()
    };
    Ok(format!(
        "{}://{}:{}{}",
        endpoint.scheme(),
        endpoint.host(),
        endpoint.port()?,
        path
    ))
}

fn client_tls(tls: Option<&TlsConfig>) -> Result<rustls::ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

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
        builder.with_root_certificates(store)
    };

    match tls.and_then(|t| t.key.as_ref().map(|k| (t.cert.clone(), k.clone_key()))) {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|err| TransportError::invalid_argument(format!("bad client cert: {err}"))),
        None => Ok(builder.with_no_client_auth()),
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
