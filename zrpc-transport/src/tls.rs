use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// TLS material handed to an adapter.
///
/// Owned by the caller and read-only for adapters; an adapter that needs an
/// owned private key uses [`PrivateKeyDer::clone_key`].
#[derive(Debug)]
pub struct TlsConfig {
    /// Local certificate chain (server identity, or client cert for mTLS).
    pub cert: Vec<CertificateDer<'static>>,
    /// Private key matching `cert`.
    pub key: Option<PrivateKeyDer<'static>>,
    /// Additional roots trusted for peer verification; empty means system
    /// roots.
    pub ca: Vec<CertificateDer<'static>>,
    /// Expected server name, overriding the endpoint host for SNI.
    pub server_name: Option<String>,
    /// ALPN values offered in the handshake; adapters fill in their protocol
    /// default when empty.
    pub alpn: Vec<Vec<u8>>,
    /// Verify the peer certificate. Disabling is for tests and closed
    /// networks only.
    pub verify_peer: bool,
    /// Server side: demand and verify a client certificate.
    pub require_client_cert: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: Vec::new(),
            key: None,
            ca: Vec::new(),
            server_name: None,
            alpn: Vec::new(),
            verify_peer: true,
            require_client_cert: false,
        }
    }
}

impl Clone for TlsConfig {
    fn clone(&self) -> Self {
        Self {
            cert: self.cert.clone(),
            key: self.key.as_ref().map(|k| k.clone_key()),
            ca: self.ca.clone(),
            server_name: self.server_name.clone(),
            alpn: self.alpn.clone(),
            verify_peer: self.verify_peer,
            require_client_cert: self.require_client_cert,
        }
    }
}

impl TlsConfig {
    /// A server-side config from a certificate chain and key.
    pub fn for_server(cert: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self {
            cert,
            key: Some(key),
            ..Default::default()
        }
    }

    /// A client-side config trusting the given roots instead of the system
    /// store.
    pub fn with_roots(ca: Vec<CertificateDer<'static>>) -> Self {
        Self {
            ca,
            ..Default::default()
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_alpn<I, A>(mut self, alpn: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.alpn = alpn.into_iter().map(|a| a.as_ref().to_vec()).collect();
        self
    }

    /// Disable peer verification. Tests and closed networks only.
    pub fn dangerous_without_verification(mut self) -> Self {
        self.verify_peer = false;
        self
    }
}
