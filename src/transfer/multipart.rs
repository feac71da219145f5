//! Multipart form uploads with overall and per-file progress.

use crate::base::cancel::CancelToken;
use crate::base::events::{lock, EventGate, EventSink, Finalizer, Progress};
use crate::base::neterror::NetError;
use crate::http::descriptor::validate_http_url;
use crate::http::multipart::{MultipartForm, UploadTracker};
use crate::http::requestbody::RequestBody;
use crate::http::response::HttpResponse;
use crate::http::transport::{Timeouts, Transport, TransportRequest};
use bytes::BytesMut;
use futures::StreamExt;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use url::Url;

#[derive(Debug)]
pub enum UploadEvent {
    /// Overall position, plus the file being sent when inside a file part.
    Progress {
        progress: Progress,
        current_file: Option<String>,
    },
    FileProgress {
        filename: String,
        fraction: f64,
    },
    /// Terminal. Delivered for any status the server answers with; check
    /// [`HttpResponse::is_success`].
    Complete(HttpResponse),
    /// Terminal.
    Error(NetError),
    /// Terminal.
    Cancelled,
}

impl UploadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadEvent::Complete(_) | UploadEvent::Error(_) | UploadEvent::Cancelled
        )
    }
}

struct Inner {
    id: String,
    url: Url,
    headers: HeaderMap,
    form: MultipartForm,
    started: Mutex<bool>,
    gate: EventGate<UploadEvent>,
    cancel: CancelToken,
    finalizer: Finalizer,
}

/// One multipart POST.
#[derive(Clone)]
pub struct MultipartUploadSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MultipartUploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartUploadSession")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url.as_str())
            .finish()
    }
}

impl MultipartUploadSession {
    pub fn new(
        id: impl Into<String>,
        url: &str,
        form: MultipartForm,
        headers: HeaderMap,
        sink: EventSink<UploadEvent>,
    ) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|_| NetError::InvalidUrl)?;
        validate_http_url(&url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                id: id.into(),
                url,
                headers,
                form,
                started: Mutex::new(false),
                gate: EventGate::new(sink),
                cancel: CancelToken::new(),
                finalizer: Finalizer::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn on_terminal<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.inner.finalizer.set(f);
    }

    /// Encode the form and send it. Can be called once.
    pub fn start(&self, transport: Arc<dyn Transport>, timeouts: Timeouts) -> Result<(), NetError> {
        tokio::runtime::Handle::try_current().map_err(|_| NetError::InvalidState)?;
        {
            let mut started = lock(&self.inner.started);
            if *started || self.inner.cancel.is_cancelled() {
                return Err(NetError::InvalidState);
            }
            *started = true;
        }

        let encoded = self.inner.form.encode();
        tracing::debug!(
            upload_id = %self.inner.id,
            fields = self.inner.form.fields().len(),
            files = encoded.files.len(),
            size = encoded.body.len(),
            "multipart body encoded"
        );

        let tracker = Mutex::new(encoded.tracker());
        let session = self.clone();
        let body = RequestBody::chunked(encoded.body, move |n| {
            session.report(&tracker, n as u64);
        });

        let mut headers = self.inner.headers.clone();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(&encoded.content_type)
                .map_err(|_| NetError::InvalidArgument)?,
        );
        let request =
            TransportRequest::new(Method::POST, self.inner.url.clone(), timeouts.unbounded())
                .headers(headers)
                .body(body);

        let session = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = session.inner.cancel.cancelled() => return,
                result = send(transport, request) => result,
            };
            session.inner.finalizer.run();
            match result {
                Ok(response) => {
                    let response = response.with_duration(started.elapsed());
                    tracing::info!(
                        upload_id = %session.inner.id,
                        status = response.status().as_u16(),
                        "multipart upload completed"
                    );
                    session.inner.gate.finish(UploadEvent::Complete(response));
                }
                Err(error) => {
                    tracing::error!(
                        upload_id = %session.inner.id,
                        %error,
                        "multipart upload failed"
                    );
                    session.inner.gate.finish(UploadEvent::Error(error));
                }
            }
        });
        Ok(())
    }

    /// Abort the upload. Fires `Cancelled` unless it had already ended.
    pub fn cancel(&self) -> bool {
        if !self.inner.cancel.cancel() {
            return false;
        }
        self.inner.finalizer.run();
        self.inner.gate.finish(UploadEvent::Cancelled)
    }

    fn report(&self, tracker: &Mutex<UploadTracker>, bytes: u64) {
        let update = lock(tracker).advance(bytes);
        if let Some(file) = &update.current_file {
            self.inner.gate.emit(UploadEvent::FileProgress {
                filename: file.filename.clone(),
                fraction: file.fraction,
            });
        }
        self.inner.gate.emit(UploadEvent::Progress {
            progress: update.progress,
            current_file: update.current_file.map(|f| f.filename),
        });
    }
}

async fn send(
    transport: Arc<dyn Transport>,
    request: TransportRequest,
) -> Result<HttpResponse, NetError> {
    let response = transport.open(request).await?;
    let mut body = BytesMut::new();
    let mut chunks = response.body;
    while let Some(chunk) = chunks.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(HttpResponse::new(response.status, response.headers, body.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::events::channel;
    use crate::http::transport::{Opening, TransportResponse};
    use bytes::Bytes;

    /// Drains the request body like a real connection, then answers 201.
    struct Draining;

    impl Transport for Draining {
        fn open(&self, request: TransportRequest) -> Opening {
            Box::pin(async move {
                if let RequestBody::Stream { mut stream, .. } = request.body {
                    while let Some(chunk) = stream.next().await {
                        chunk?;
                    }
                }
                Ok(TransportResponse {
                    status: http::StatusCode::CREATED,
                    headers: HeaderMap::new(),
                    body: Box::pin(futures::stream::iter(vec![Ok(Bytes::from_static(b"ok"))])),
                })
            })
        }
    }

    #[tokio::test]
    async fn test_upload_reports_progress_then_completes() {
        let form = MultipartForm::new()
            .text("title", "holiday")
            .file("photo", "a.jpg", "image/jpeg", Bytes::from(vec![7u8; 40_000]));
        let (sink, mut rx) = channel();
        let session =
            MultipartUploadSession::new("m1", "http://example.com/up", form, HeaderMap::new(), sink)
                .unwrap();
        session
            .start(Arc::new(Draining), Timeouts::default())
            .unwrap();
        assert_eq!(
            session.start(Arc::new(Draining), Timeouts::default()),
            Err(NetError::InvalidState)
        );

        let mut last = 0;
        let mut saw_file = false;
        loop {
            match rx.recv().await.unwrap() {
                UploadEvent::Progress { progress, .. } => {
                    assert!(progress.transferred >= last);
                    last = progress.transferred;
                }
                UploadEvent::FileProgress { filename, fraction } => {
                    assert_eq!(filename, "a.jpg");
                    assert!((0.0..=1.0).contains(&fraction));
                    saw_file = true;
                }
                UploadEvent::Complete(response) => {
                    assert_eq!(response.status().as_u16(), 201);
                    assert_eq!(response.text(), "ok");
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(saw_file);
        assert!(last > 40_000);
        assert!(!session.cancel());
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (sink, mut rx) = channel();
        let session = MultipartUploadSession::new(
            "m2",
            "http://example.com/up",
            MultipartForm::new().text("a", "b"),
            HeaderMap::new(),
            sink,
        )
        .unwrap();
        assert!(session.cancel());
        assert!(matches!(rx.recv().await, Some(UploadEvent::Cancelled)));
        assert_eq!(
            session.start(Arc::new(Draining), Timeouts::default()),
            Err(NetError::InvalidState)
        );
    }
}
