//! Network manager with builder pattern.
//!
//! [`NetworkManager`] is the single entry point: it owns one [`NetContext`],
//! a [`RequestScheduler`] for ordinary requests and a [`SessionRegistry`]
//! for long-lived sessions.
//!
//! # Example
//!
//! ```rust,ignore
//! use netmanager::base::events::channel;
//! use netmanager::http::{CacheDirective, CachePolicy, RequestDescriptor};
//! use netmanager::NetworkManager;
//!
//! let manager = NetworkManager::builder().max_concurrent_requests(2).build();
//!
//! let (sink, mut events) = channel();
//! let request = RequestDescriptor::new("https://api.example.com/items")?
//!     .cache(CacheDirective::new(CachePolicy::CacheFirst).ttl(Duration::from_secs(60)));
//! let id = manager.send(request, sink)?;
//! while let Some(event) = events.recv().await { /* ... */ }
//! ```

use crate::base::events::{EventSink, Progress};
use crate::base::neterror::NetError;
use crate::context::{ManagerConfig, NetContext};
use crate::http::descriptor::{CachePolicy, RequestDescriptor};
use crate::http::httpcache::{CacheEntry, CacheStore};
use crate::http::interceptor::InterceptorChain;
use crate::http::multipart::MultipartForm;
use crate::http::options::RequestOptions;
use crate::http::response::HttpResponse;
use crate::http::scheduler::{JobId, RequestEvent, RequestScheduler};
use crate::http::transport::{Transport, TransportRequest};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::socket::tls::TlsConfig;
use crate::sse::{StreamEvent, StreamSession};
use crate::tls::pinning::PinStore;
use crate::transfer::{
    MultipartUploadSession, ResumeData, TransferEvent, TransferSession, UploadEvent,
};
use crate::ws::{WebSocketSession, WsEvent};
use http::{HeaderMap, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Entry point for requests, streams, sockets and transfers.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct NetworkManager {
    context: NetContext,
    scheduler: RequestScheduler,
    sessions: SessionRegistry,
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkManager {
    /// Create a manager with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> NetworkManagerBuilder {
        NetworkManagerBuilder::default()
    }

    /// Create a manager around an existing context.
    pub fn with_context(context: NetContext) -> Self {
        let scheduler = RequestScheduler::new(
            Arc::clone(context.transport()),
            context.interceptors().clone(),
            context.config().scheduler(),
        );
        Self {
            context,
            scheduler,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn context(&self) -> &NetContext {
        &self.context
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    // ----- requests -----

    /// Queue a request. A fresh cached copy is served instead when the
    /// request is cache-first; a successful `200` is stored when the request
    /// carries any caching policy other than network-only; a network-first
    /// request that fails falls back to any stored copy.
    pub fn send(
        &self,
        descriptor: RequestDescriptor,
        sink: EventSink<RequestEvent>,
    ) -> Result<JobId, NetError> {
        tokio::runtime::Handle::try_current().map_err(|_| NetError::InvalidState)?;

        let Some(directive) = descriptor.cache_directive().cloned() else {
            return self.scheduler.submit(descriptor, sink);
        };
        let cache = Arc::clone(self.context.cache());
        let key = CacheStore::generate_key(
            descriptor.http_method().as_str(),
            descriptor.url().as_str(),
        );

        if directive.policy == CachePolicy::CacheFirst {
            if let Some(entry) = cache.get(&key, directive.ttl) {
                tracing::debug!(key = %key, "served from cache");
                return self.scheduler.deliver(entry.to_response(), sink);
            }
        }

        let url = descriptor.url().clone();
        let policy = directive.policy;
        let wrapped: EventSink<RequestEvent> = Arc::new(move |event| match event {
            RequestEvent::Complete(response) => {
                if policy != CachePolicy::NetworkOnly && response.status() == StatusCode::OK {
                    cache.put(&key, CacheEntry::from_response(&url, &response));
                }
                sink(RequestEvent::Complete(response))
            }
            RequestEvent::Failed { error, attempts, exhausted }
                if policy == CachePolicy::NetworkFirst =>
            {
                match cache.get(&key, None) {
                    Some(entry) => {
                        tracing::debug!(key = %key, %error, "network failed, serving cached copy");
                        sink(RequestEvent::Complete(entry.to_response()))
                    }
                    None => sink(RequestEvent::Failed { error, attempts, exhausted }),
                }
            }
            other => sink(other),
        });
        self.scheduler.submit(descriptor, wrapped)
    }

    /// Queue a request described by an option map.
    pub fn send_options(
        &self,
        options: RequestOptions,
        sink: EventSink<RequestEvent>,
    ) -> Result<JobId, NetError> {
        self.send(options.into_descriptor()?, sink)
    }

    /// Cancel a request or session by id. No callback fires for a cancelled
    /// request; transfers and uploads report `Cancelled`.
    pub fn cancel(&self, id: &str) -> bool {
        self.scheduler.cancel(id) || self.sessions.cancel(id)
    }

    /// Cancel every queued request and live session.
    pub fn cancel_all(&self) {
        for id in self.scheduler.job_ids() {
            self.scheduler.cancel(&id);
        }
        self.sessions.cancel_all();
    }

    // ----- sessions -----

    /// Open a Server-Sent Events stream.
    pub fn stream(
        &self,
        id: impl Into<String>,
        descriptor: RequestDescriptor,
        sink: EventSink<StreamEvent>,
    ) -> Result<StreamSession, NetError> {
        let descriptor = self.context.interceptors().apply_request(descriptor);
        let request =
            TransportRequest::from_descriptor(&descriptor, self.context.config().timeouts());
        let session = StreamSession::new(id, sink);
        self.sessions.insert(SessionHandle::Stream(session.clone()))?;
        if let Err(e) = session.start(Arc::clone(self.context.transport()), request) {
            self.sessions.remove(session.id());
            return Err(e);
        }
        Ok(session)
    }

    /// Open a WebSocket. Pins configured for the host apply to `wss://`.
    pub fn websocket(
        &self,
        id: impl Into<String>,
        url: &str,
        headers: HeaderMap,
        sink: EventSink<WsEvent>,
    ) -> Result<WebSocketSession, NetError> {
        let session = WebSocketSession::new(id, url, headers, sink)?;
        self.sessions.insert(SessionHandle::WebSocket(session.clone()))?;
        let connect_timeout = self.context.config().timeouts().connect;
        if let Err(e) = session.connect(self.context.tls(), self.context.pins(), connect_timeout) {
            self.sessions.remove(session.id());
            return Err(e);
        }
        Ok(session)
    }

    /// POST a multipart form, reporting overall and per-file progress.
    pub fn multipart_upload(
        &self,
        id: impl Into<String>,
        url: &str,
        form: MultipartForm,
        headers: HeaderMap,
        sink: EventSink<UploadEvent>,
    ) -> Result<MultipartUploadSession, NetError> {
        let session = MultipartUploadSession::new(id, url, form, headers, sink)?;
        self.sessions.insert(SessionHandle::Upload(session.clone()))?;
        if let Err(e) = session.start(
            Arc::clone(self.context.transport()),
            self.context.config().timeouts(),
        ) {
            self.sessions.remove(session.id());
            return Err(e);
        }
        Ok(session)
    }

    /// Download `url` to `destination` in the background.
    pub fn download(
        &self,
        id: impl Into<String>,
        url: &str,
        destination: impl Into<PathBuf>,
        headers: HeaderMap,
        sink: EventSink<TransferEvent>,
    ) -> Result<TransferSession, NetError> {
        let session = TransferSession::download(
            id,
            url,
            destination,
            headers,
            self.transport(),
            self.context.config().timeouts(),
            sink,
        )?;
        self.start_transfer(session)
    }

    /// Continue a download paused in an earlier session.
    pub fn resume_download(
        &self,
        id: impl Into<String>,
        data: ResumeData,
        headers: HeaderMap,
        sink: EventSink<TransferEvent>,
    ) -> Result<TransferSession, NetError> {
        let session = TransferSession::from_resume_data(
            id,
            data,
            headers,
            self.transport(),
            self.context.config().timeouts(),
            sink,
        )?;
        self.sessions.insert(SessionHandle::Transfer(session.clone()))?;
        if let Err(e) = session.resume() {
            self.sessions.remove(session.id());
            return Err(e);
        }
        Ok(session)
    }

    /// Upload the file at `source` in the background.
    pub fn upload(
        &self,
        id: impl Into<String>,
        url: &str,
        source: impl Into<PathBuf>,
        headers: HeaderMap,
        sink: EventSink<TransferEvent>,
    ) -> Result<TransferSession, NetError> {
        let session = TransferSession::upload(
            id,
            url,
            source,
            headers,
            self.transport(),
            self.context.config().timeouts(),
            sink,
        )?;
        self.start_transfer(session)
    }

    fn start_transfer(&self, session: TransferSession) -> Result<TransferSession, NetError> {
        self.sessions.insert(SessionHandle::Transfer(session.clone()))?;
        if let Err(e) = session.start() {
            self.sessions.remove(session.id());
            return Err(e);
        }
        Ok(session)
    }

    /// Look up a live session.
    pub fn session(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id)
    }

    /// Look up a live transfer, e.g. to pause or resume it.
    pub fn transfer(&self, id: &str) -> Option<TransferSession> {
        match self.sessions.get(id)? {
            SessionHandle::Transfer(session) => Some(session),
            _ => None,
        }
    }

    fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(self.context.transport())
    }

    // ----- pinning -----

    /// Replace the pins for `domain` (`*.example.com` covers subdomains).
    /// Each pin is `sha256/<base64 SPKI hash>`.
    pub fn set_certificate_pins<I, S>(&self, domain: &str, pins: I) -> Result<(), NetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.context.pins().set_pins(domain, pins)
    }

    pub fn clear_certificate_pins(&self, domain: &str) {
        self.context.pins().clear_pins(domain);
    }

    pub fn clear_all_certificate_pins(&self) {
        self.context.pins().clear_all();
    }

    /// The store every connection validates against.
    pub fn pin_store(&self) -> PinStore {
        self.context.pins().clone()
    }

    // ----- interceptors -----

    pub fn add_request_interceptor<F>(&self, f: F)
    where
        F: Fn(RequestDescriptor) -> RequestDescriptor + Send + Sync + 'static,
    {
        self.context.interceptors().add_request(f);
    }

    pub fn add_response_interceptor<F>(&self, f: F)
    where
        F: Fn(HttpResponse) -> HttpResponse + Send + Sync + 'static,
    {
        self.context.interceptors().add_response(f);
    }

    pub fn add_response_observer<F>(&self, f: F)
    where
        F: Fn(&HttpResponse) + Send + Sync + 'static,
    {
        self.context.interceptors().add_response_observer(f);
    }

    pub fn clear_interceptors(&self) {
        self.context.interceptors().clear();
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        self.context.interceptors()
    }

    // ----- cache and diagnostics -----

    /// Drop cached responses, all of them or only those for `domain`.
    pub fn clear_cache(&self, domain: Option<&str>) {
        self.context.cache().clear(domain);
    }

    /// Requests queued, running or waiting to retry.
    pub fn active_jobs(&self) -> usize {
        self.scheduler.active_count()
    }

    /// Live streams, sockets, transfers and uploads.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Progress of a live transfer.
    pub fn transfer_progress(&self, id: &str) -> Option<Progress> {
        self.transfer(id).map(|t| t.progress())
    }
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("context", &self.context)
            .field("active_jobs", &self.active_jobs())
            .field("active_sessions", &self.active_sessions())
            .finish()
    }
}

/// Builder for a [`NetworkManager`].
#[derive(Default)]
pub struct NetworkManagerBuilder {
    config: ManagerConfig,
    tls: Option<TlsConfig>,
    pins: Option<PinStore>,
    transport: Option<Arc<dyn Transport>>,
}

impl NetworkManagerBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.config.max_concurrent_requests = max;
        self
    }

    /// Connect, read and write timeouts for ordinary requests.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let secs = timeout.as_secs().max(1);
        self.config.connect_timeout_secs = secs;
        self.config.read_timeout_secs = secs;
        self.config.write_timeout_secs = secs;
        self
    }

    /// Persist cached responses under `dir`.
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache.directory = Some(dir.into());
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Start from an existing pin store.
    pub fn pins(mut self, pins: PinStore) -> Self {
        self.pins = Some(pins);
        self
    }

    /// Send requests through `transport` instead of the built-in one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> NetworkManager {
        let tls = self.tls.unwrap_or_default();
        let pins = self.pins.unwrap_or_default();
        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(crate::http::transport::HttpTransport::new(
                tls.clone(),
                pins.clone(),
            ))
        });
        NetworkManager::with_context(NetContext::with_transport(self.config, tls, pins, transport))
    }
}
