use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::socket::client::SocketType;
use crate::socket::tls::TlsConfig;
use crate::tls::pinning::{spki_hash_x509, PinStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Endpoint {
    /// Derive an endpoint from an http(s) or ws(s) URL.
    pub fn from_url(url: &url::Url) -> Result<Self, NetError> {
        let secure = match url.scheme() {
            "https" | "wss" => true,
            "http" | "ws" => false,
            _ => return Err(NetError::DisallowedUrlScheme),
        };
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let port = url
            .port()
            .unwrap_or(if secure { 443 } else { 80 });
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            secure,
        })
    }
}

/// Manages the connection process: DNS -> TCP -> TLS -> pin check.
/// Roughly equivalent to net::ConnectJob.
pub struct ConnectJob<'a> {
    tls: &'a TlsConfig,
    pins: &'a PinStore,
    timeout: Duration,
}

impl<'a> ConnectJob<'a> {
    pub fn new(tls: &'a TlsConfig, pins: &'a PinStore, timeout: Duration) -> Self {
        Self { tls, pins, timeout }
    }

    /// Open a socket to `endpoint`. The whole sequence, TLS included, must
    /// finish within the connect timeout.
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<SocketType, NetError> {
        match tokio::time::timeout(self.timeout, self.connect_inner(endpoint)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(host = %endpoint.host, port = endpoint.port, "connect timed out");
                Err(NetError::ConnectionTimedOut)
            }
        }
    }

    async fn connect_inner(&self, endpoint: &Endpoint) -> Result<SocketType, NetError> {
        let host = endpoint.host.as_str();

        // 1. DNS Resolution
        let addrs: Vec<_> = tokio::net::lookup_host((host, endpoint.port))
            .await
            .map_err(|_| NetError::NameNotResolved)?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::NameNotResolved);
        }

        // 2. TCP Connect, first address that answers
        let mut last_error = NetError::ConnectionFailed;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect(addr).await.connection_context(host, endpoint.port) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_error = e,
            }
        }
        let stream = stream.ok_or(last_error)?;
        let _ = stream.set_nodelay(true);

        if !endpoint.secure {
            return Ok(SocketType::Tcp(stream));
        }

        // 3. TLS Handshake
        let trust_failed = Arc::new(AtomicBool::new(false));
        let connector = self.tls.connector(trust_failed.clone())?;
        let mut config = connector.configure().map_err(|_| NetError::SslProtocolError)?;
        config.set_use_server_name_indication(TlsConfig::should_set_sni(host));
        config.set_verify_hostname(self.tls.verify_peer);

        let tls_stream = tokio_boring::connect(config, host, stream)
            .await
            .map_err(|e| {
                if trust_failed.load(Ordering::Acquire) {
                    tracing::warn!(host, "server certificate not trusted");
                    NetError::CertAuthorityInvalid
                } else {
                    tracing::debug!(host, error = %e, "TLS handshake failed");
                    NetError::SslProtocolError
                }
            })?;

        // 4. Pin check, before any application data is written
        let mut hashes = Vec::new();
        if let Some(chain) = tls_stream.ssl().peer_cert_chain() {
            for cert in chain {
                hashes.push(spki_hash_x509(cert)?);
            }
        }
        self.pins.check(host, &hashes)?;

        Ok(SocketType::Ssl(tls_stream))
    }
}
