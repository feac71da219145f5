//! One long-lived event stream.
//!
//! [`StreamSession`] is an explicit state machine. The transport driver
//! feeds it through `on_headers`, `on_data`, `on_complete` and `on_error`;
//! the session decides which callbacks fire and guarantees exactly one
//! terminal event. Cancelling drops the connection and silences the sink.
//!
//! ```text
//! Idle -> Connecting -> Open -> Receiving* -> Closed
//!                          \________________-> Failed
//! ```

use crate::base::cancel::CancelToken;
use crate::base::events::{lock, EventGate, EventSink, Finalizer};
use crate::base::neterror::NetError;
use crate::http::transport::{Transport, TransportRequest};
use crate::sse::decoder::{SseDecoder, SseEvent};
use futures::StreamExt;
use http::header::{ACCEPT, CACHE_CONTROL};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Open,
    Receiving,
    Closed,
    Failed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Closed | StreamState::Failed)
    }
}

#[derive(Debug)]
pub enum StreamEvent {
    /// Response headers accepted; events follow.
    Open { status: StatusCode, headers: HeaderMap },
    Chunk(SseEvent),
    /// Terminal: the server ended the stream.
    Complete {
        status: StatusCode,
        headers: HeaderMap,
        duration: Duration,
    },
    /// Terminal.
    Error(NetError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error(_))
    }
}

struct Core {
    state: StreamState,
    decoder: SseDecoder,
    status: StatusCode,
    headers: HeaderMap,
    started: Option<Instant>,
}

struct Inner {
    id: String,
    core: Mutex<Core>,
    gate: EventGate<StreamEvent>,
    cancel: CancelToken,
    finalizer: Finalizer,
}

/// Server-Sent Events session.
#[derive(Clone)]
pub struct StreamSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamSession {
    pub fn new(id: impl Into<String>, sink: EventSink<StreamEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                core: Mutex::new(Core {
                    state: StreamState::Idle,
                    decoder: SseDecoder::new(),
                    status: StatusCode::OK,
                    headers: HeaderMap::new(),
                    started: None,
                }),
                gate: EventGate::new(sink),
                cancel: CancelToken::new(),
                finalizer: Finalizer::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> StreamState {
        lock(&self.inner.core).state
    }

    /// Run `f` once when the session closes, fails or is cancelled.
    pub fn on_terminal<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.inner.finalizer.set(f);
    }

    /// Open the stream over `transport`. Read timeouts are lifted; the stream
    /// stays up until the server ends it or it is cancelled.
    pub fn start(
        &self,
        transport: Arc<dyn Transport>,
        mut request: TransportRequest,
    ) -> Result<(), NetError> {
        tokio::runtime::Handle::try_current().map_err(|_| NetError::InvalidState)?;
        {
            let mut core = lock(&self.inner.core);
            if core.state != StreamState::Idle {
                return Err(NetError::InvalidState);
            }
            core.state = StreamState::Connecting;
            core.started = Some(Instant::now());
        }

        request.timeouts = request.timeouts.unbounded();
        if !request.headers.contains_key(ACCEPT) {
            request
                .headers
                .insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        request
            .headers
            .entry(CACHE_CONTROL)
            .or_insert(HeaderValue::from_static("no-cache"));

        tracing::info!(session_id = %self.inner.id, url = %request.url, "stream starting");
        let session = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = session.drive(transport, request) => {}
            }
        });
        Ok(())
    }

    async fn drive(&self, transport: Arc<dyn Transport>, request: TransportRequest) {
        let response = match transport.open(request).await {
            Ok(response) => response,
            Err(error) => {
                self.on_error(error);
                return;
            }
        };
        if !self.on_headers(response.status, response.headers) {
            return;
        }
        let mut body = response.body;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(data) => self.on_data(&data),
                Err(error) => {
                    self.on_error(error);
                    return;
                }
            }
        }
        self.on_complete();
    }

    /// Headers arrived. A non-2xx status fails the session. Returns whether
    /// the body should be read.
    pub fn on_headers(&self, status: StatusCode, headers: HeaderMap) -> bool {
        {
            let mut core = lock(&self.inner.core);
            if core.state != StreamState::Connecting {
                return false;
            }
            if status.is_success() {
                core.state = StreamState::Open;
                core.status = status;
                core.headers = headers.clone();
            }
        }
        if !status.is_success() {
            self.on_error(NetError::HttpStatus(status.as_u16()));
            return false;
        }
        tracing::debug!(session_id = %self.inner.id, %status, "stream open");
        self.inner.gate.emit(StreamEvent::Open { status, headers });
        true
    }

    /// Raw body bytes arrived.
    pub fn on_data(&self, data: &[u8]) {
        let events = {
            let mut core = lock(&self.inner.core);
            if !matches!(core.state, StreamState::Open | StreamState::Receiving) {
                return;
            }
            core.state = StreamState::Receiving;
            core.decoder.feed(data)
        };
        for event in events {
            tracing::debug!(
                session_id = %self.inner.id,
                event = %event.event_type,
                len = event.data.len(),
                "stream event"
            );
            if !self.inner.gate.emit(StreamEvent::Chunk(event)) {
                break;
            }
        }
    }

    /// Graceful end of input: flush the decoder and close.
    pub fn on_complete(&self) {
        let (rest, status, headers, duration) = {
            let mut core = lock(&self.inner.core);
            if !matches!(core.state, StreamState::Open | StreamState::Receiving) {
                return;
            }
            core.state = StreamState::Closed;
            let duration = core.started.map(|t| t.elapsed()).unwrap_or_default();
            (
                core.decoder.finish(),
                core.status,
                std::mem::take(&mut core.headers),
                duration,
            )
        };
        for event in rest {
            self.inner.gate.emit(StreamEvent::Chunk(event));
        }
        tracing::info!(session_id = %self.inner.id, "stream closed");
        self.inner.finalizer.run();
        self.inner.gate.finish(StreamEvent::Complete {
            status,
            headers,
            duration,
        });
    }

    pub fn on_error(&self, error: NetError) {
        {
            let mut core = lock(&self.inner.core);
            if core.state.is_terminal() {
                return;
            }
            core.state = StreamState::Failed;
        }
        tracing::error!(session_id = %self.inner.id, %error, "stream failed");
        self.inner.finalizer.run();
        self.inner.gate.finish(StreamEvent::Error(error));
    }

    /// Abort the stream. Nothing is delivered afterwards. Returns false if
    /// the session had already ended.
    pub fn cancel(&self) -> bool {
        {
            let mut core = lock(&self.inner.core);
            if core.state.is_terminal() {
                return false;
            }
            core.state = StreamState::Closed;
        }
        self.inner.gate.close();
        self.inner.cancel.cancel();
        self.inner.finalizer.run();
        tracing::info!(session_id = %self.inner.id, "stream cancelled");
        true
    }
}
