use std::fmt;

use url::Url;

use crate::TransportError;

/// Longest socket path accepted for the `unix` scheme (sun_path limit).
const MAX_UNIX_PATH: usize = 107;

/// The wire protocols an endpoint can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Native QUIC, ALPN `zr/1`.
    Zr,
    /// HTTP/2 over TLS, ALPN `h2`.
    H2,
    /// HTTP/3, ALPN `h3`.
    H3,
    /// Unix domain socket.
    Unix,
    /// WebSocket over TCP.
    Ws,
    /// WebSocket over TLS.
    Wss,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zr => "zr",
            Self::H2 => "h2",
            Self::H3 => "h3",
            Self::Unix => "unix",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "zr" => Some(Self::Zr),
            "h2" => Some(Self::H2),
            "h3" => Some(Self::H3),
            "unix" => Some(Self::Unix),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }

    /// The port implied when the endpoint does not name one.
    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::H2 | Self::H3 | Self::Wss => Some(443),
            Self::Ws => Some(80),
            Self::Zr | Self::Unix => None,
        }
    }

    /// The ALPN value negotiated inside TLS, where the scheme has one.
    pub fn alpn(self) -> Option<&'static str> {
        match self {
            Self::Zr => Some("zr/1"),
            Self::H2 => Some("h2"),
            Self::H3 => Some("h3"),
            Self::Unix | Self::Ws | Self::Wss => None,
        }
    }

    /// Whether the path component is meaningful for this scheme.
    pub fn uses_path(self) -> bool {
        matches!(self, Self::H2 | Self::H3 | Self::Unix | Self::Ws | Self::Wss)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `scheme://host[:port][/path]` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: Option<u16>,
    path: String,
}

impl Endpoint {
    /// Parse an endpoint string.
    ///
    /// Unknown schemes, missing hosts and over-long unix paths fail with
    /// `INVALID_ARGUMENT`.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let url = Url::parse(input)
            .map_err(|err| TransportError::invalid_argument(format!("bad endpoint {input:?}: {err}")))?;

        let scheme = Scheme::parse(url.scheme()).ok_or_else(|| {
            TransportError::invalid_argument(format!("unknown scheme {:?}", url.scheme()))
        })?;

        if scheme == Scheme::Unix {
            let path = url.path().to_string();
            if path.is_empty() || path == "/" {
                return Err(TransportError::invalid_argument("unix endpoint has no path"));
            }
            if path.len() > MAX_UNIX_PATH {
                return Err(TransportError::invalid_argument(format!(
                    "unix path of {} bytes exceeds {MAX_UNIX_PATH}",
                    path.len()
                )));
            }
            return Ok(Self {
                scheme,
                host: String::new(),
                port: None,
                path,
            });
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::invalid_argument(format!("endpoint {input:?} has no host")))?
            .to_string();

        Ok(Self {
            scheme,
            host,
            port: url.port(),
            path: url.path().to_string(),
        })
    }

    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port: Some(port),
            path: "/".to_string(),
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The explicit port, or the scheme default.
    ///
    /// `zr` has no default and `INVALID_ARGUMENT` is returned when the
    /// endpoint names none; `unix` endpoints have no port at all.
    pub fn port(&self) -> Result<u16, TransportError> {
        self.port
            .or_else(|| self.scheme.default_port())
            .ok_or_else(|| {
                TransportError::invalid_argument(format!(
                    "{} endpoint requires an explicit port",
                    self.scheme
                ))
            })
    }

    /// The path component; only meaningful for HTTP-family, WebSocket and
    /// unix schemes.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The filesystem path of a `unix` endpoint.
    pub fn socket_path(&self) -> Option<&str> {
        (self.scheme == Scheme::Unix).then_some(self.path.as_str())
    }

    /// `host:port` suitable for a socket address lookup.
    pub fn authority(&self) -> Result<String, TransportError> {
        Ok(format!("{}:{}", self.host, self.port()?))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme == Scheme::Unix {
            return write!(f, "unix://{}", self.path);
        }
        write!(f, "{}://{}", self.scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if self.path != "/" && !self.path.is_empty() {
            f.write_str(&self.path)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportErrorKind;

    #[test]
    fn parses_native_quic() {
        let ep = Endpoint::parse("zr://127.0.0.1:8443").unwrap();
        assert_eq!(ep.scheme(), Scheme::Zr);
        assert_eq!(ep.host(), "127.0.0.1");
        assert_eq!(ep.port().unwrap(), 8443);
    }

    #[test]
    fn zr_without_port_is_invalid() {
        let ep = Endpoint::parse("zr://example.com").unwrap();
        let err = ep.port().unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::InvalidArgument);
    }

    #[test]
    fn default_ports() {
        assert_eq!(Endpoint::parse("ws://host").unwrap().port().unwrap(), 80);
        assert_eq!(Endpoint::parse("wss://host").unwrap().port().unwrap(), 443);
        assert_eq!(Endpoint::parse("h2://host").unwrap().port().unwrap(), 443);
        assert_eq!(Endpoint::parse("h3://host").unwrap().port().unwrap(), 443);
    }

    #[test]
    fn unknown_scheme_is_invalid_argument() {
        let err = Endpoint::parse("ftp://host:21").unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::InvalidArgument);
    }

    #[test]
    fn unix_paths() {
        let ep = Endpoint::parse("unix:///var/run/zrpc.sock").unwrap();
        assert_eq!(ep.socket_path(), Some("/var/run/zrpc.sock"));
        assert_eq!(ep.to_string(), "unix:///var/run/zrpc.sock");
    }

    #[test]
    fn unix_path_cap() {
        let long = format!("unix:///{}", "a".repeat(120));
        let err = Endpoint::parse(&long).unwrap_err();
        assert_eq!(err.kind(), TransportErrorKind::InvalidArgument);
    }

    #[test]
    fn path_is_preserved_for_websocket() {
        let ep = Endpoint::parse("ws://host:9080/rpc").unwrap();
        assert_eq!(ep.path(), "/rpc");
        assert_eq!(ep.to_string(), "ws://host:9080/rpc");
    }

    #[test]
    fn alpn_values() {
        assert_eq!(Scheme::Zr.alpn(), Some("zr/1"));
        assert_eq!(Scheme::H2.alpn(), Some("h2"));
        assert_eq!(Scheme::H3.alpn(), Some("h3"));
        assert_eq!(Scheme::Ws.alpn(), None);
    }
}
