//! File downloads and uploads with pause, resume and cancel.
//!
//! Downloads stream into `<destination>.part` and are renamed over the
//! destination only after the last byte is written, so a partial file is
//! never visible at the final path. A paused download keeps its part file;
//! resuming asks the server for the remaining range and appends when the
//! server honours it (`206`), or starts over when it does not (`200`).
//!
//! Uploads send the file as the raw request body. They cannot be resumed
//! mid-file; resuming a paused upload sends it again from the start.

use crate::base::cancel::CancelToken;
use crate::base::context::IoResultExt;
use crate::base::events::{lock, EventGate, EventSink, Finalizer, Progress};
use crate::base::neterror::NetError;
use crate::http::descriptor::validate_http_url;
use crate::http::requestbody::{RequestBody, UPLOAD_CHUNK_SIZE};
use crate::http::response::HttpResponse;
use crate::http::transport::{Timeouts, Transport, TransportRequest, TransportResponse};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::header::{ACCEPT_RANGES, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_RANGE, RANGE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Created, not started.
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Where a paused download left off. Serializable so it can outlive the
/// process and seed [`TransferSession::from_resume_data`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    pub url: String,
    pub destination: PathBuf,
    /// Bytes already in the part file.
    pub offset: u64,
    /// Validator sent as `If-Range`, when the server supplied one.
    pub etag: Option<String>,
}

#[derive(Debug)]
pub enum TransferOutcome {
    Downloaded { path: PathBuf, bytes: u64 },
    Uploaded(HttpResponse),
}

#[derive(Debug)]
pub enum TransferEvent {
    Progress(Progress),
    /// `None` when the transfer cannot continue from where it stopped.
    Paused(Option<ResumeData>),
    Resumed,
    /// Terminal.
    Complete(TransferOutcome),
    /// Terminal.
    Error(NetError),
    /// Terminal.
    Cancelled,
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferEvent::Complete(_) | TransferEvent::Error(_) | TransferEvent::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
enum Direction {
    Download { destination: PathBuf },
    Upload { source: PathBuf },
}

struct Core {
    state: TransferState,
    /// Bytes written to the part file, or read from the source file.
    transferred: u64,
    total: u64,
    etag: Option<String>,
    resumable: bool,
    run: Option<CancelToken>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    id: String,
    url: Url,
    headers: HeaderMap,
    direction: Direction,
    transport: Arc<dyn Transport>,
    timeouts: Timeouts,
    core: Mutex<Core>,
    gate: EventGate<TransferEvent>,
    finalizer: Finalizer,
}

/// One download or upload.
#[derive(Clone)]
pub struct TransferSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("state", &self.state())
            .finish()
    }
}

impl TransferSession {
    /// Download `url` to `destination`. Call [`TransferSession::start`] to
    /// begin.
    pub fn download(
        id: impl Into<String>,
        url: &str,
        destination: impl Into<PathBuf>,
        headers: HeaderMap,
        transport: Arc<dyn Transport>,
        timeouts: Timeouts,
        sink: EventSink<TransferEvent>,
    ) -> Result<Self, NetError> {
        let destination = destination.into();
        if destination.file_name().is_none() {
            return Err(NetError::InvalidArgument);
        }
        Self::create(
            id.into(),
            parse_url(url)?,
            headers,
            Direction::Download { destination },
            transport,
            timeouts,
            sink,
        )
    }

    /// Upload the file at `source` to `url` as an
    /// `application/octet-stream` POST. A missing file fails here.
    pub fn upload(
        id: impl Into<String>,
        url: &str,
        source: impl Into<PathBuf>,
        headers: HeaderMap,
        transport: Arc<dyn Transport>,
        timeouts: Timeouts,
        sink: EventSink<TransferEvent>,
    ) -> Result<Self, NetError> {
        let source = source.into();
        let url = parse_url(url)?;
        let metadata = std::fs::metadata(&source).file_context(&source)?;
        if !metadata.is_file() {
            return Err(NetError::FileNotFound);
        }
        Self::create(
            id.into(),
            url,
            headers,
            Direction::Upload { source },
            transport,
            timeouts,
            sink,
        )
    }

    /// A paused download rebuilt from saved [`ResumeData`]. Call
    /// [`TransferSession::resume`] to continue it.
    pub fn from_resume_data(
        id: impl Into<String>,
        data: ResumeData,
        headers: HeaderMap,
        transport: Arc<dyn Transport>,
        timeouts: Timeouts,
        sink: EventSink<TransferEvent>,
    ) -> Result<Self, NetError> {
        let session = Self::download(
            id,
            &data.url,
            data.destination,
            headers,
            transport,
            timeouts,
            sink,
        )?;
        {
            let mut core = lock(&session.inner.core);
            core.state = TransferState::Paused;
            core.transferred = data.offset;
            core.etag = data.etag;
            core.resumable = true;
        }
        Ok(session)
    }

    fn create(
        id: String,
        url: Url,
        headers: HeaderMap,
        direction: Direction,
        transport: Arc<dyn Transport>,
        timeouts: Timeouts,
        sink: EventSink<TransferEvent>,
    ) -> Result<Self, NetError> {
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                url,
                headers,
                direction,
                transport,
                timeouts: timeouts.unbounded(),
                core: Mutex::new(Core {
                    state: TransferState::Pending,
                    transferred: 0,
                    total: 0,
                    etag: None,
                    resumable: false,
                    run: None,
                    task: None,
                }),
                gate: EventGate::new(sink),
                finalizer: Finalizer::new(),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> TransferState {
        lock(&self.inner.core).state
    }

    /// Bytes moved so far and the expected total (zero when unknown).
    pub fn progress(&self) -> Progress {
        let core = lock(&self.inner.core);
        Progress::new(core.transferred, core.total)
    }

    /// Run `f` once when the transfer completes, fails or is cancelled.
    pub fn on_terminal<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.inner.finalizer.set(f);
    }

    pub fn start(&self) -> Result<(), NetError> {
        tokio::runtime::Handle::try_current().map_err(|_| NetError::InvalidState)?;
        let mut core = lock(&self.inner.core);
        if core.state != TransferState::Pending {
            return Err(NetError::InvalidState);
        }
        core.state = TransferState::Running;
        tracing::info!(transfer_id = %self.inner.id, url = %self.inner.url, "transfer started");
        self.launch(&mut core);
        Ok(())
    }

    /// Stop the running transfer. Returns the state needed to continue it,
    /// or `None` if it cannot continue from where it stopped (or was not
    /// running).
    pub fn pause(&self) -> Option<ResumeData> {
        let resume = {
            let mut core = lock(&self.inner.core);
            if core.state != TransferState::Running {
                return None;
            }
            core.state = TransferState::Paused;
            if let Some(run) = core.run.take() {
                run.cancel();
            }
            match &self.inner.direction {
                Direction::Download { destination } if core.resumable && core.transferred > 0 => {
                    Some(ResumeData {
                        url: self.inner.url.to_string(),
                        destination: destination.clone(),
                        offset: core.transferred,
                        etag: core.etag.clone(),
                    })
                }
                _ => None,
            }
        };
        tracing::info!(
            transfer_id = %self.inner.id,
            resumable = resume.is_some(),
            "transfer paused"
        );
        self.inner.gate.emit(TransferEvent::Paused(resume.clone()));
        resume
    }

    /// Continue a paused transfer.
    pub fn resume(&self) -> Result<(), NetError> {
        tokio::runtime::Handle::try_current().map_err(|_| NetError::InvalidState)?;
        {
            let mut core = lock(&self.inner.core);
            if core.state != TransferState::Paused {
                return Err(NetError::InvalidState);
            }
            core.state = TransferState::Running;
            self.launch(&mut core);
        }
        tracing::info!(transfer_id = %self.inner.id, "transfer resumed");
        self.inner.gate.emit(TransferEvent::Resumed);
        Ok(())
    }

    /// Stop for good and discard any part file. Fires `Cancelled` unless the
    /// transfer had already ended.
    pub fn cancel(&self) -> bool {
        let previous = {
            let mut core = lock(&self.inner.core);
            if core.state.is_terminal() {
                return false;
            }
            core.state = TransferState::Cancelled;
            if let Some(run) = core.run.take() {
                run.cancel();
            }
            core.task.take()
        };

        if let Direction::Download { destination } = &self.inner.direction {
            let part = part_path(destination);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Some(previous) = previous {
                        let _ = previous.await;
                    }
                    let _ = tokio::fs::remove_file(&part).await;
                });
            }
        }

        tracing::info!(transfer_id = %self.inner.id, "transfer cancelled");
        self.inner.finalizer.run();
        self.inner.gate.finish(TransferEvent::Cancelled);
        true
    }

    /// Spawn one run. Waits for the previous run to wind down first so a
    /// resumed download never races the paused one's last write.
    fn launch(&self, core: &mut Core) {
        let token = CancelToken::new();
        core.run = Some(token.clone());
        let previous = core.task.take();
        let session = self.clone();
        core.task = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = match &session.inner.direction {
                Direction::Download { destination } => {
                    session.run_download(destination, &token).await
                }
                Direction::Upload { source } => session.run_upload(source, &token).await,
            };
            if token.is_cancelled() {
                return;
            }
            match result {
                Ok(Some(outcome)) => session.complete(outcome),
                Ok(None) => {}
                Err(error) => session.fail(error),
            }
        }));
    }

    /// `Ok(None)` means the run was interrupted by pause or cancel.
    async fn run_download(
        &self,
        destination: &Path,
        token: &CancelToken,
    ) -> Result<Option<TransferOutcome>, NetError> {
        let part = part_path(destination);
        let (resumable, etag) = {
            let core = lock(&self.inner.core);
            (core.resumable, core.etag.clone())
        };
        let offset = if resumable {
            match tokio::fs::metadata(&part).await {
                Ok(metadata) => metadata.len(),
                Err(_) => 0,
            }
        } else {
            0
        };

        let mut headers = self.inner.headers.clone();
        if offset > 0 {
            headers.insert(
                RANGE,
                HeaderValue::from_str(&format!("bytes={}-", offset))
                    .map_err(|_| NetError::InvalidArgument)?,
            );
            if let Some(value) = etag.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
                headers.insert(IF_RANGE, value);
            }
        }
        let request =
            TransportRequest::new(Method::GET, self.inner.url.clone(), self.inner.timeouts)
                .headers(headers);

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            response = self.inner.transport.open(request) => response?,
        };

        let append = match response.status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => true,
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                return Err(NetError::RequestRangeNotSatisfiable)
            }
            status if status.is_success() => false,
            status => return Err(NetError::HttpStatus(status.as_u16())),
        };
        let start = if append { offset } else { 0 };
        let total = if append {
            content_range_total(&response.headers)
                .or_else(|| response.content_length().map(|len| offset + len))
                .unwrap_or(0)
        } else {
            response.content_length().unwrap_or(0)
        };
        let accepts_ranges = response
            .headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.eq_ignore_ascii_case("bytes"));
        {
            let mut core = lock(&self.inner.core);
            core.transferred = start;
            core.total = total;
            core.resumable = accepts_ranges || append;
            if let Some(etag) = response.headers.get(ETAG).and_then(|v| v.to_str().ok()) {
                core.etag = Some(etag.to_string());
            } else if !append {
                core.etag = None;
            }
        }
        tracing::debug!(
            transfer_id = %self.inner.id,
            status = %response.status,
            offset = start,
            total,
            "download response"
        );

        let mut file = if append {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&part)
                .await
                .file_context(&part)?
        } else {
            tokio::fs::File::create(&part).await.file_context(&part)?
        };

        let mut body = response.body;
        let mut written = start;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    file.flush().await.file_context(&part)?;
                    return Ok(None);
                }
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await.file_context(&part)?;
            written += chunk.len() as u64;
            lock(&self.inner.core).transferred = written;
            self.inner
                .gate
                .emit(TransferEvent::Progress(Progress::new(written, total)));
        }
        file.flush().await.file_context(&part)?;
        file.sync_all().await.file_context(&part)?;
        drop(file);

        if token.is_cancelled() {
            return Ok(None);
        }
        tokio::fs::rename(&part, destination)
            .await
            .file_context(destination)?;
        Ok(Some(TransferOutcome::Downloaded {
            path: destination.to_path_buf(),
            bytes: written,
        }))
    }

    async fn run_upload(
        &self,
        source: &Path,
        token: &CancelToken,
    ) -> Result<Option<TransferOutcome>, NetError> {
        let file = tokio::fs::File::open(source).await.file_context(source)?;
        let size = file.metadata().await.file_context(source)?.len();
        {
            let mut core = lock(&self.inner.core);
            core.transferred = 0;
            core.total = size;
        }

        let mut headers = self.inner.headers.clone();
        headers
            .entry(CONTENT_TYPE)
            .or_insert(HeaderValue::from_static("application/octet-stream"));
        let body = RequestBody::Stream {
            stream: file_stream(file, source.to_path_buf(), self.clone(), size),
            length: Some(size),
        };
        let request =
            TransportRequest::new(Method::POST, self.inner.url.clone(), self.inner.timeouts)
                .headers(headers)
                .body(body);

        let exchange = async {
            let response = self.inner.transport.open(request).await?;
            collect(response).await
        };
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(None),
            response = exchange => response?,
        };
        if !response.is_success() {
            return Err(NetError::HttpStatus(response.status().as_u16()));
        }
        Ok(Some(TransferOutcome::Uploaded(response)))
    }

    fn complete(&self, outcome: TransferOutcome) {
        {
            let mut core = lock(&self.inner.core);
            if core.state != TransferState::Running {
                return;
            }
            core.state = TransferState::Completed;
            core.run = None;
        }
        tracing::info!(transfer_id = %self.inner.id, "transfer complete");
        self.inner.finalizer.run();
        self.inner.gate.finish(TransferEvent::Complete(outcome));
    }

    fn fail(&self, error: NetError) {
        {
            let mut core = lock(&self.inner.core);
            if core.state != TransferState::Running {
                return;
            }
            core.state = TransferState::Failed;
            core.run = None;
        }
        tracing::error!(transfer_id = %self.inner.id, %error, "transfer failed");
        self.inner.finalizer.run();
        self.inner.gate.finish(TransferEvent::Error(error));
    }

    fn report_sent(&self, sent: u64, total: u64) {
        lock(&self.inner.core).transferred = sent;
        self.inner
            .gate
            .emit(TransferEvent::Progress(Progress::new(sent, total)));
    }
}

fn parse_url(url: &str) -> Result<Url, NetError> {
    let url = Url::parse(url).map_err(|_| NetError::InvalidUrl)?;
    validate_http_url(&url)?;
    Ok(url)
}

/// `<destination>.part`, next to the destination.
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Total length from `Content-Range: bytes a-b/total`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Read `file` in fixed chunks, reporting each one as the transport takes it.
fn file_stream(
    file: tokio::fs::File,
    path: PathBuf,
    session: TransferSession,
    size: u64,
) -> crate::http::requestbody::BodyStream {
    Box::pin(futures::stream::unfold(
        Some((file, 0u64)),
        move |state| {
            let path = path.clone();
            let session = session.clone();
            async move {
                let (mut file, sent) = state?;
                let mut buf = BytesMut::zeroed(UPLOAD_CHUNK_SIZE);
                match file.read(&mut buf).await.file_context(&path) {
                    Ok(0) => None,
                    Ok(n) => {
                        buf.truncate(n);
                        let sent = sent + n as u64;
                        session.report_sent(sent, size);
                        Some((Ok(buf.freeze()), Some((file, sent))))
                    }
                    Err(error) => Some((Err(error), None)),
                }
            }
        },
    ))
}

async fn collect(response: TransportResponse) -> Result<HttpResponse, NetError> {
    let mut body = BytesMut::new();
    let mut chunks = response.body;
    while let Some(chunk) = chunks.next().await {
        body.extend_from_slice(&chunk?);
    }
    Ok(HttpResponse::new(
        response.status,
        response.headers,
        Bytes::from(body),
    ))
}
