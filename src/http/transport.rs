//! The transport seam.
//!
//! Everything above this module talks to the network through [`Transport`],
//! which opens one request and resolves once response headers arrive. The
//! body is handed back as a stream so buffered requests, event streams and
//! file transfers can all consume it their own way.
//!
//! [`HttpTransport`] is the production implementation: one HTTP/1.1
//! connection per request over [`ConnectJob`], with certificate pins checked
//! during connection setup. Dropping the returned future or body stream
//! aborts the exchange.

use crate::base::context::classify_socket_error;
use crate::base::neterror::NetError;
use crate::http::descriptor::RequestDescriptor;
use crate::http::requestbody::{BodyStream, RequestBody};
use crate::socket::connectjob::{ConnectJob, Endpoint};
use crate::socket::tls::TlsConfig;
use crate::tls::pinning::PinStore;
use futures::StreamExt;
use http::header::{CONTENT_LENGTH, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use url::{Position, Url};

const DEFAULT_USER_AGENT: &str = concat!("netmanager/", env!("CARGO_PKG_VERSION"));

/// Per-request time limits. A `None` read timeout waits forever, which is
/// what long-lived streams and large transfers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    /// Limit on waiting for response headers and for each body chunk.
    pub read: Option<Duration>,
    /// Limit on sending the request.
    pub write: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            read: Some(Duration::from_secs(30)),
            write: Some(Duration::from_secs(30)),
        }
    }
}

impl Timeouts {
    /// Same connect limit, no read or write limit.
    pub fn unbounded(&self) -> Self {
        Self {
            connect: self.connect,
            read: None,
            write: None,
        }
    }
}

/// One request as the transport sees it.
#[derive(Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub timeouts: Timeouts,
}

impl TransportRequest {
    pub fn new(method: Method, url: Url, timeouts: Timeouts) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeouts,
        }
    }

    pub fn from_descriptor(descriptor: &RequestDescriptor, timeouts: Timeouts) -> Self {
        Self {
            method: descriptor.http_method().clone(),
            url: descriptor.url().clone(),
            headers: descriptor.headers().clone(),
            body: descriptor.body_bytes().cloned().into(),
            timeouts,
        }
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }
}

/// Response headers plus the unread body.
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl TransportResponse {
    /// Declared body length, if the server sent one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Alias for the `Future` returned by [`Transport::open`].
pub type Opening = Pin<Box<dyn Future<Output = Result<TransportResponse, NetError>> + Send>>;

/// Opens HTTP exchanges. Implementations must be thread-safe.
pub trait Transport: Send + Sync {
    fn open(&self, request: TransportRequest) -> Opening;
}

/// Blanket implementation for Arc-wrapped transports.
impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn open(&self, request: TransportRequest) -> Opening {
        (**self).open(request)
    }
}

/// HTTP/1.1 over TCP or BoringSSL, with pin enforcement.
#[derive(Clone)]
pub struct HttpTransport {
    tls: TlsConfig,
    pins: PinStore,
}

impl HttpTransport {
    pub fn new(tls: TlsConfig, pins: PinStore) -> Self {
        Self { tls, pins }
    }

    pub fn pins(&self) -> &PinStore {
        &self.pins
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }
}

impl Transport for HttpTransport {
    fn open(&self, request: TransportRequest) -> Opening {
        let this = self.clone();
        Box::pin(async move { this.exchange(request).await })
    }
}

impl HttpTransport {
    async fn exchange(&self, request: TransportRequest) -> Result<TransportResponse, NetError> {
        let endpoint = Endpoint::from_url(&request.url)?;
        let socket = ConnectJob::new(&self.tls, &self.pins, request.timeouts.connect)
            .connect(&endpoint)
            .await?;
        tracing::debug!(
            host = %endpoint.host,
            secure = socket.is_secure(),
            peer = ?socket.tcp().peer_addr().ok(),
            "connected"
        );

        let (mut sender, conn) = http1::handshake(TokioIo::new(socket))
            .await
            .map_err(|e| map_hyper_error(&e))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "connection closed with error");
            }
        });

        let timeouts = request.timeouts;
        let http_request = build_request(request)?;
        let sending = sender.send_request(http_request);
        let deadline = timeouts
            .read
            .map(|read| read + timeouts.write.unwrap_or_default());
        let response = match deadline {
            Some(limit) => tokio::time::timeout(limit, sending)
                .await
                .map_err(|_| NetError::ConnectionTimedOut)?,
            None => sending.await,
        }
        .map_err(|e| map_hyper_error(&e))?;

        let (parts, body) = response.into_parts();
        tracing::debug!(status = %parts.status, host = %endpoint.host, "response headers");
        Ok(TransportResponse {
            status: parts.status,
            headers: parts.headers,
            body: body_stream(body, timeouts.read),
        })
    }
}

fn build_request(
    request: TransportRequest,
) -> Result<Request<http_body_util::combinators::UnsyncBoxBody<bytes::Bytes, NetError>>, NetError>
{
    let url = request.url;
    let path = &url[Position::BeforePath..Position::AfterQuery];
    let path = if path.is_empty() { "/" } else { path };

    let mut builder = Request::builder().method(request.method).uri(path);
    let headers = builder.headers_mut().ok_or(NetError::InvalidArgument)?;
    *headers = request.headers;

    if !headers.contains_key(HOST) {
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let value = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        headers.insert(
            HOST,
            HeaderValue::from_str(&value).map_err(|_| NetError::InvalidUrl)?,
        );
    }
    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    }
    if let Some(len) = request.body.len().filter(|_| !request.body.is_empty()) {
        if !headers.contains_key(CONTENT_LENGTH) {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }
    }

    builder
        .body(request.body.into_http_body())
        .map_err(|_| NetError::InvalidArgument)
}

/// Turn a hyper body into data chunks, applying the read timeout per chunk.
fn body_stream(body: Incoming, read_timeout: Option<Duration>) -> BodyStream {
    let frames = Box::pin(http_body_util::BodyStream::new(body));
    Box::pin(futures::stream::unfold(
        Some(frames),
        move |frames| async move {
            let mut frames = frames?;
            loop {
                let next = match read_timeout {
                    Some(limit) => match tokio::time::timeout(limit, frames.next()).await {
                        Ok(next) => next,
                        Err(_) => return Some((Err(NetError::ConnectionTimedOut), None)),
                    },
                    None => frames.next().await,
                };
                match next? {
                    Ok(frame) => {
                        if let Ok(data) = frame.into_data() {
                            if !data.is_empty() {
                                return Some((Ok(data), Some(frames)));
                            }
                        }
                    }
                    Err(e) => return Some((Err(map_hyper_error(&e)), None)),
                }
            }
        },
    ))
}

/// Classify a hyper error into the transport taxonomy.
pub fn map_hyper_error(e: &hyper::Error) -> NetError {
    if e.is_timeout() {
        return NetError::ConnectionTimedOut;
    }
    if e.is_parse() || e.is_parse_status() {
        return NetError::InvalidResponse;
    }
    if e.is_incomplete_message() {
        return NetError::EmptyResponse;
    }
    if e.is_canceled() || e.is_closed() {
        return NetError::ConnectionClosed;
    }
    if e.is_body_write_aborted() {
        return NetError::ConnectionAborted;
    }
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return classify_socket_error(io);
        }
        if let Some(net) = err.downcast_ref::<NetError>() {
            return *net;
        }
        source = err.source();
    }
    NetError::ConnectionFailed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_form_and_host_header() {
        let url = Url::parse("http://example.com:8080/a/b?x=1#frag").unwrap();
        let request = TransportRequest::new(Method::GET, url, Timeouts::default());
        let built = build_request(request).unwrap();
        assert_eq!(built.uri(), "/a/b?x=1");
        assert_eq!(built.headers()[HOST], "example.com:8080");
        assert!(built.headers().contains_key(USER_AGENT));
        assert!(!built.headers().contains_key(CONTENT_LENGTH));
    }

    #[test]
    fn test_content_length_for_bodies() {
        let url = Url::parse("https://example.com").unwrap();
        let request = TransportRequest::new(Method::POST, url, Timeouts::default())
            .body(RequestBody::from("hello"));
        let built = build_request(request).unwrap();
        assert_eq!(built.uri(), "/");
        assert_eq!(built.headers()[HOST], "example.com");
        assert_eq!(built.headers()[CONTENT_LENGTH], "5");
    }

    #[test]
    fn test_unbounded_timeouts_keep_connect() {
        let t = Timeouts::default().unbounded();
        assert_eq!(t.connect, Duration::from_secs(30));
        assert!(t.read.is_none());
        assert!(t.write.is_none());
    }
}
