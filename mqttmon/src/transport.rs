//! Transport layer for broker connections.
//!
//! The session engine only needs an ordered byte stream. [`Connector`]
//! opens one from a broker address:
//! - [`TcpConnector`]: plain TCP (`mqtt://`, `tcp://` or a bare `host:port`)
//! - `TlsConnector`: TLS (`mqtts://`, `ssl://`), behind the `tls` feature
//!
//! Tests plug in their own connector backed by in-memory pipes.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte stream carrying MQTT packets.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Boxed transport handed to the session engine.
pub type BoxTransport = Box<dyn Transport>;

/// Opens transports to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a byte stream to `addr`.
    async fn connect(&self, addr: &str) -> io::Result<BoxTransport>;
}

/// Transport type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP connection.
    Tcp,
    /// TLS encrypted connection.
    Tls,
}

impl TransportType {
    /// Parse transport type from URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "tcp" | "mqtt" | "" => Some(TransportType::Tcp),
            "tls" | "mqtts" | "ssl" => Some(TransportType::Tls),
            _ => None,
        }
    }

    /// Get default port for this transport type.
    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Tcp => 1883,
            TransportType::Tls => 8883,
        }
    }
}

/// A broker address split into transport, host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    pub transport: TransportType,
    pub host: String,
    pub port: u16,
}

impl BrokerAddr {
    /// Parse `scheme://host:port`, `host:port` or `host`.
    pub fn parse(addr: &str) -> io::Result<Self> {
        let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidInput, msg);

        let (scheme, rest) = match addr.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("", addr),
        };
        let transport = TransportType::from_scheme(scheme)
            .ok_or_else(|| invalid(format!("unsupported scheme: {}", scheme)))?;

        // drop credentials and path, if any
        let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
        let rest = rest.split(['/', '?']).next().unwrap_or_default();

        let (host, port) = match rest.rsplit_once(':') {
            // bracketed IPv6 without port
            Some((_, tail)) if tail.ends_with(']') => (rest, transport.default_port()),
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid(format!("invalid port in {}", addr)))?;
                (host, port)
            }
            None => (rest, transport.default_port()),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid(format!("missing host in {}", addr)));
        }

        Ok(Self {
            transport,
            host: host.to_string(),
            port,
        })
    }
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl TcpConnector {
    async fn open(addr: &BrokerAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        stream.set_nodelay(true)?;
        debug!("TCP connected to {}:{}", addr.host, addr.port);
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &str) -> io::Result<BoxTransport> {
        let addr = BrokerAddr::parse(addr)?;
        if addr.transport != TransportType::Tcp {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS addresses need a TlsConnector",
            ));
        }
        Ok(Box::new(Self::open(&addr).await?))
    }
}

#[cfg(feature = "tls")]
pub use tls::{TlsConfig, TlsConnector};

#[cfg(feature = "tls")]
pub mod tls {
    //! TLS configuration and connector.

    use std::io;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tracing::debug;

    use super::{BoxTransport, BrokerAddr, Connector, TcpConnector, TransportType};

    /// TLS configuration for client connections.
    #[derive(Clone)]
    pub struct TlsConfig {
        connector: tokio_rustls::TlsConnector,
    }

    impl TlsConfig {
        /// Verify the broker against the webpki root store.
        pub fn new() -> Self {
            let root_store = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };

            let config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            Self::from_rustls(config)
        }

        /// Use a caller-built rustls config (custom roots, client certs).
        pub fn from_rustls(config: ClientConfig) -> Self {
            Self {
                connector: tokio_rustls::TlsConnector::from(Arc::new(config)),
            }
        }
    }

    impl Default for TlsConfig {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Connector for both `mqtt://` and `mqtts://` addresses.
    #[derive(Clone, Default)]
    pub struct TlsConnector {
        config: TlsConfig,
    }

    impl TlsConnector {
        pub fn new(config: TlsConfig) -> Self {
            Self { config }
        }
    }

    #[async_trait]
    impl Connector for TlsConnector {
        async fn connect(&self, addr: &str) -> io::Result<BoxTransport> {
            let addr = BrokerAddr::parse(addr)?;
            let stream = TcpConnector::open(&addr).await?;
            if addr.transport == TransportType::Tcp {
                return Ok(Box::new(stream));
            }

            let domain = ServerName::try_from(addr.host.clone())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid domain name"))?;
            let stream = self.config.connector.connect(domain, stream).await?;
            debug!("TLS handshake with {} complete", addr.host);
            Ok(Box::new(stream))
        }
    }
}
