//! WebSocket session over tokio-tungstenite.
//!
//! The TCP/TLS leg goes through [`ConnectJob`] so `wss://` connections are
//! pin-checked like every other request; tungstenite then runs the upgrade
//! handshake on the established socket.
//!
//! ```text
//! Connecting -> Open -> Closing -> Closed
//!      \__________\________\_____-> Failed
//! ```

use super::message::{CloseCode, CloseFrame, Message};
use crate::base::cancel::CancelToken;
use crate::base::context::classify_socket_error;
use crate::base::events::{lock, EventGate, EventSink, Finalizer};
use crate::base::neterror::NetError;
use crate::socket::client::SocketType;
use crate::socket::connectjob::{ConnectJob, Endpoint};
use crate::socket::tls::TlsConfig;
use crate::tls::pinning::PinStore;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<SocketType>;
type WsSink = SplitSink<WsStream, tungstenite::Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl WsState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WsState::Closed | WsState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Open,
    /// Text frame.
    Message(String),
    /// Binary frame, raw bytes.
    Binary(Bytes),
    Pong(Bytes),
    /// Terminal. Fired exactly once, whichever side closed.
    Close { code: u16, reason: String },
    /// Terminal.
    Error(NetError),
}

impl WsEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WsEvent::Close { .. } | WsEvent::Error(_))
    }
}

struct Inner {
    id: String,
    url: Url,
    headers: HeaderMap,
    state: std::sync::Mutex<WsState>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    requested_close: std::sync::Mutex<Option<CloseFrame>>,
    gate: EventGate<WsEvent>,
    cancel: CancelToken,
    finalizer: Finalizer,
}

/// One WebSocket connection and its receive loop.
#[derive(Clone)]
pub struct WebSocketSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl WebSocketSession {
    /// A session for a `ws://` or `wss://` URL. Nothing connects until
    /// [`WebSocketSession::connect`].
    pub fn new(
        id: impl Into<String>,
        url: &str,
        headers: HeaderMap,
        sink: EventSink<WsEvent>,
    ) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|_| NetError::InvalidUrl)?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(NetError::DisallowedUrlScheme);
        }
        if url.host_str().is_none() {
            return Err(NetError::InvalidUrl);
        }
        Ok(Self {
            inner: Arc::new(Inner {
                id: id.into(),
                url,
                headers,
                state: std::sync::Mutex::new(WsState::Connecting),
                writer: tokio::sync::Mutex::new(None),
                requested_close: std::sync::Mutex::new(None),
                gate: EventGate::new(sink),
                cancel: CancelToken::new(),
                finalizer: Finalizer::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn state(&self) -> WsState {
        *lock(&self.inner.state)
    }

    /// Run `f` once when the session closes, fails or is cancelled.
    pub fn on_terminal<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.inner.finalizer.set(f);
    }

    /// Connect in the background. `Open` is emitted once the upgrade
    /// completes, then frames flow until either side closes.
    pub fn connect(
        &self,
        tls: &TlsConfig,
        pins: &PinStore,
        connect_timeout: Duration,
    ) -> Result<(), NetError> {
        tokio::runtime::Handle::try_current().map_err(|_| NetError::InvalidState)?;
        let session = self.clone();
        let tls = tls.without_alpn();
        let pins = pins.clone();
        let cancel = self.inner.cancel.clone();
        tracing::info!(session_id = %self.inner.id, url = %self.inner.url, "websocket connecting");
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = session.run(tls, pins, connect_timeout) => {}
            }
            let writer = session.inner.writer.lock().await.take();
            if let Some(mut writer) = writer.filter(|_| !cancel.is_cancelled()) {
                // Flushes the close reply tungstenite queued for the peer.
                let _ = writer.close().await;
            }
        });
        Ok(())
    }

    async fn run(&self, tls: TlsConfig, pins: PinStore, connect_timeout: Duration) {
        let stream = match self.handshake(&tls, &pins, connect_timeout).await {
            Ok(stream) => stream,
            Err(error) => {
                self.fail(error);
                return;
            }
        };
        let (writer, reader) = stream.split();
        *self.inner.writer.lock().await = Some(writer);

        {
            let mut state = lock(&self.inner.state);
            if *state != WsState::Connecting {
                return;
            }
            *state = WsState::Open;
        }
        tracing::info!(session_id = %self.inner.id, "websocket open");
        self.inner.gate.emit(WsEvent::Open);

        self.receive(reader).await;
    }

    async fn handshake(
        &self,
        tls: &TlsConfig,
        pins: &PinStore,
        connect_timeout: Duration,
    ) -> Result<WsStream, NetError> {
        let endpoint = Endpoint::from_url(&self.inner.url)?;
        let socket = ConnectJob::new(tls, pins, connect_timeout)
            .connect(&endpoint)
            .await?;

        let mut request = self
            .inner
            .url
            .as_str()
            .into_client_request()
            .map_err(|_| NetError::InvalidUrl)?;
        for (name, value) in &self.inner.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }

        let (stream, _response) =
            tokio::time::timeout(connect_timeout, client_async(request, socket))
                .await
                .map_err(|_| NetError::ConnectionTimedOut)?
                .map_err(|e| map_ws_error(&e))?;
        Ok(stream)
    }

    /// Dispatch frames until a close frame, an error or end of stream.
    async fn receive(&self, mut reader: SplitStream<WsStream>) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(tungstenite::Message::Text(text)) => {
                    self.inner.gate.emit(WsEvent::Message(text));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    self.inner.gate.emit(WsEvent::Binary(Bytes::from(data)));
                }
                Ok(tungstenite::Message::Pong(data)) => {
                    self.inner.gate.emit(WsEvent::Pong(Bytes::from(data)));
                }
                Ok(tungstenite::Message::Close(frame)) => {
                    let remote = CloseFrame::from_wire(frame.as_ref());
                    let frame = lock(&self.inner.requested_close).take().unwrap_or(remote);
                    self.finish_close(frame);
                    return;
                }
                Ok(tungstenite::Message::Ping(_)) | Ok(tungstenite::Message::Frame(_)) => {}
                Err(e) => {
                    let requested = lock(&self.inner.requested_close).take();
                    match requested {
                        Some(frame) => self.finish_close(frame),
                        None => self.fail(map_ws_error(&e)),
                    }
                    return;
                }
            }
        }

        let frame = lock(&self.inner.requested_close)
            .take()
            .unwrap_or(CloseFrame {
                code: CloseCode::ABNORMAL,
                reason: String::new(),
            });
        self.finish_close(frame);
    }

    pub async fn send(&self, text: impl Into<String>) -> Result<(), NetError> {
        self.write(Message::Text(text.into())).await
    }

    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), NetError> {
        self.write(Message::Binary(data.into())).await
    }

    /// Send a ping. The reply arrives as [`WsEvent::Pong`].
    pub async fn ping(&self) -> Result<(), NetError> {
        self.write(Message::Ping(Bytes::new())).await
    }

    async fn write(&self, message: Message) -> Result<(), NetError> {
        if self.state() != WsState::Open {
            return Err(NetError::SocketNotConnected);
        }
        let mut writer = self.inner.writer.lock().await;
        let sink = writer.as_mut().ok_or(NetError::SocketNotConnected)?;
        sink.send(message.into_wire()).await.map_err(|e| {
            tracing::debug!(session_id = %self.inner.id, error = %e, "websocket send failed");
            map_ws_error(&e)
        })
    }

    /// Start the closing handshake. The `Close` event reports the code
    /// actually used: `code` if an endpoint may send it, 1000 otherwise.
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), NetError> {
        let frame = CloseFrame::new(code, reason);
        {
            let mut state = lock(&self.inner.state);
            if *state != WsState::Open {
                return Err(NetError::SocketNotConnected);
            }
            *state = WsState::Closing;
        }
        *lock(&self.inner.requested_close) = Some(frame.clone());
        tracing::info!(session_id = %self.inner.id, code = frame.code.0, "websocket closing");

        let mut writer = self.inner.writer.lock().await;
        if let Some(sink) = writer.as_mut() {
            if let Err(e) = sink.send(frame.into_wire()).await {
                tracing::debug!(session_id = %self.inner.id, error = %e, "close frame not sent");
            }
        }
        Ok(())
    }

    /// Drop the connection without a closing handshake or any further
    /// callbacks. Returns false if the session had already ended.
    pub fn cancel(&self) -> bool {
        {
            let mut state = lock(&self.inner.state);
            if state.is_terminal() {
                return false;
            }
            *state = WsState::Closed;
        }
        self.inner.gate.close();
        self.inner.cancel.cancel();
        self.inner.finalizer.run();
        tracing::info!(session_id = %self.inner.id, "websocket cancelled");
        true
    }

    fn finish_close(&self, frame: CloseFrame) {
        {
            let mut state = lock(&self.inner.state);
            if state.is_terminal() {
                return;
            }
            *state = WsState::Closed;
        }
        tracing::info!(
            session_id = %self.inner.id,
            code = frame.code.0,
            reason = %frame.reason,
            "websocket closed"
        );
        self.inner.finalizer.run();
        self.inner.gate.finish(WsEvent::Close {
            code: frame.code.into(),
            reason: frame.reason,
        });
    }

    fn fail(&self, error: NetError) {
        {
            let mut state = lock(&self.inner.state);
            if state.is_terminal() {
                return;
            }
            *state = WsState::Failed;
        }
        tracing::error!(session_id = %self.inner.id, %error, "websocket failed");
        self.inner.finalizer.run();
        self.inner.gate.finish(WsEvent::Error(error));
    }
}

/// Classify a tungstenite error.
fn map_ws_error(e: &tungstenite::Error) -> NetError {
    use tungstenite::Error;
    match e {
        Error::ConnectionClosed => NetError::ConnectionClosed,
        Error::AlreadyClosed => NetError::SocketNotConnected,
        Error::Io(io) => classify_socket_error(io),
        Error::Url(_) => NetError::InvalidUrl,
        Error::Http(response) => NetError::HttpStatus(response.status().as_u16()),
        Error::HttpFormat(_) => NetError::InvalidResponse,
        _ => NetError::WsProtocolError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::events::channel;

    #[test]
    fn test_scheme_checked() {
        let (sink, _rx) = channel();
        let err = WebSocketSession::new("w", "https://example.com", HeaderMap::new(), sink)
            .unwrap_err();
        assert_eq!(err, NetError::DisallowedUrlScheme);

        let (sink, _rx) = channel();
        let err = WebSocketSession::new("w", "not a url", HeaderMap::new(), sink).unwrap_err();
        assert_eq!(err, NetError::InvalidUrl);
    }

    #[tokio::test]
    async fn test_send_before_open_is_not_connected() {
        let (sink, _rx) = channel();
        let session =
            WebSocketSession::new("w", "ws://127.0.0.1:9", HeaderMap::new(), sink).unwrap();
        assert_eq!(session.state(), WsState::Connecting);
        assert_eq!(session.send("hi").await, Err(NetError::SocketNotConnected));
        assert_eq!(session.ping().await, Err(NetError::SocketNotConnected));
        assert_eq!(
            session.close(1000, "").await,
            Err(NetError::SocketNotConnected)
        );
    }

    #[test]
    fn test_finish_close_once() {
        let (sink, mut rx) = channel();
        let session =
            WebSocketSession::new("w", "ws://127.0.0.1:9", HeaderMap::new(), sink).unwrap();
        session.finish_close(CloseFrame::new(4000, "done"));
        session.finish_close(CloseFrame::new(1000, "again"));
        session.fail(NetError::ConnectionReset);

        assert_eq!(
            rx.try_recv().unwrap(),
            WsEvent::Close {
                code: 4000,
                reason: "done".into()
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), WsState::Closed);
        assert!(!session.cancel());
    }
}
