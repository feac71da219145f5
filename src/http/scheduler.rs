//! Priority scheduling with bounded concurrency.
//!
//! Jobs wait in a max-heap ordered by priority, then submission order. A
//! fixed number of workers run attempts; the heap, the active count and the
//! admission check share one mutex so the ceiling is never overshot. Network
//! I/O and retry delays happen outside that lock.
//!
//! A job that fails with a retryable error gives its worker back, sleeps out
//! the backoff delay, and re-enters the heap with a priority boost.

use crate::base::cancel::CancelToken;
use crate::base::events::{lock, EventGate, EventSink, Progress};
use crate::base::loadstate::LoadState;
use crate::base::neterror::NetError;
use crate::http::descriptor::{validate_http_url, RequestDescriptor};
use crate::http::interceptor::InterceptorChain;
use crate::http::response::HttpResponse;
use crate::http::retry::{evaluate, AttemptOutcome, RetryDecision};
use crate::http::transport::{Timeouts, Transport, TransportRequest};
use bytes::BytesMut;
use dashmap::DashMap;
use futures::StreamExt;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Opaque job handle. Callers may supply their own.
pub type JobId = String;

/// Callbacks for one submitted request.
#[derive(Debug)]
pub enum RequestEvent {
    /// Response bytes received so far. Never decreases for a job.
    Progress(Progress),
    /// Attempt `attempt` failed; the next one starts after `delay`.
    WillRetry {
        attempt: u32,
        delay: Duration,
        error: NetError,
    },
    /// Terminal: a response arrived.
    Complete(HttpResponse),
    /// Terminal: no usable response. `exhausted` marks a spent retry budget.
    Failed {
        error: NetError,
        attempts: u32,
        exhausted: bool,
    },
}

impl RequestEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestEvent::Complete(_) | RequestEvent::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker ceiling.
    pub max_concurrent: usize,
    /// Added to a job's priority every time it is retried.
    pub retry_boost: u32,
    pub timeouts: Timeouts,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            retry_boost: 10,
            timeouts: Timeouts::default(),
        }
    }
}

/// Per-job bookkeeping shared between the table and the worker.
struct JobSlot {
    id: JobId,
    gate: EventGate<RequestEvent>,
    cancel: CancelToken,
    state: Mutex<LoadState>,
    high_water: AtomicU64,
    submitted: Instant,
}

impl JobSlot {
    fn new(id: JobId, sink: EventSink<RequestEvent>, state: LoadState) -> Arc<Self> {
        Arc::new(Self {
            id,
            gate: EventGate::new(sink),
            cancel: CancelToken::new(),
            state: Mutex::new(state),
            high_water: AtomicU64::new(0),
            submitted: Instant::now(),
        })
    }

    fn set_state(&self, state: LoadState) {
        *lock(&self.state) = state;
    }

    /// Forward progress only when it moves past everything reported before,
    /// including earlier attempts.
    fn report_progress(&self, transferred: u64, total: u64) {
        let previous = self.high_water.fetch_max(transferred, Ordering::AcqRel);
        if transferred > previous {
            self.gate
                .emit(RequestEvent::Progress(Progress::new(transferred, total)));
        }
    }
}

/// A job waiting for a worker.
struct QueuedJob {
    priority: u32,
    seq: u64,
    /// Attempts already made.
    attempts: u32,
    descriptor: RequestDescriptor,
    slot: Arc<JobSlot>,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, earlier submissions first within a priority
        match self.priority.cmp(&other.priority) {
            CmpOrdering::Equal => other.seq.cmp(&self.seq),
            other => other,
        }
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    active: usize,
    next_seq: u64,
}

struct Shared {
    transport: Arc<dyn Transport>,
    interceptors: InterceptorChain,
    config: SchedulerConfig,
    queue: Mutex<QueueState>,
    jobs: DashMap<JobId, Arc<JobSlot>>,
}

/// Runs requests with priority ordering, a concurrency ceiling and retries.
///
/// Cloning is cheap; clones share the same queue and job table.
#[derive(Clone)]
pub struct RequestScheduler {
    shared: Arc<Shared>,
}

impl RequestScheduler {
    pub fn new(
        transport: Arc<dyn Transport>,
        interceptors: InterceptorChain,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                interceptors,
                config: SchedulerConfig {
                    max_concurrent: config.max_concurrent.max(1),
                    ..config
                },
                queue: Mutex::new(QueueState::default()),
                jobs: DashMap::new(),
            }),
        }
    }

    /// Queue `descriptor` under a generated id.
    pub fn submit(
        &self,
        descriptor: RequestDescriptor,
        sink: EventSink<RequestEvent>,
    ) -> Result<JobId, NetError> {
        self.submit_with_id(None, descriptor, sink)
    }

    /// Queue `descriptor`. Only a bad URL, a duplicate live id or a missing
    /// runtime fail here; everything else arrives through `sink`.
    pub fn submit_with_id(
        &self,
        id: Option<JobId>,
        descriptor: RequestDescriptor,
        sink: EventSink<RequestEvent>,
    ) -> Result<JobId, NetError> {
        tokio::runtime::Handle::try_current().map_err(|_| NetError::InvalidState)?;

        let descriptor = self.shared.interceptors.apply_request(descriptor);
        validate_http_url(descriptor.url())?;

        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let slot = JobSlot::new(id.clone(), sink, LoadState::Queued);

        match self.shared.jobs.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(NetError::InvalidState),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(slot.clone());
            }
        }

        let priority = descriptor.request_priority().value();
        tracing::debug!(job_id = %id, priority, url = %descriptor.url(), "job queued");
        self.shared.enqueue(priority, None, 0, descriptor, slot);
        Shared::pump(&self.shared);
        Ok(id)
    }

    /// Hand `response` to `sink` as a job that skips the queue, the transport
    /// and response interceptors. The job stays cancellable until the
    /// spawned delivery runs.
    pub fn deliver(
        &self,
        response: HttpResponse,
        sink: EventSink<RequestEvent>,
    ) -> Result<JobId, NetError> {
        tokio::runtime::Handle::try_current().map_err(|_| NetError::InvalidState)?;

        let id = uuid::Uuid::new_v4().to_string();
        let slot = JobSlot::new(id.clone(), sink, LoadState::Executing);
        self.shared.jobs.insert(id.clone(), Arc::clone(&slot));

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if shared.jobs.remove(&slot.id).is_some() {
                tracing::debug!(job_id = %slot.id, "delivered without network");
                slot.gate.finish(RequestEvent::Complete(response));
            }
        });
        Ok(id)
    }

    /// Cancel a job wherever it is. Returns false for unknown or finished
    /// ids. No callback fires for the job afterwards.
    pub fn cancel(&self, id: &str) -> bool {
        let Some((_, slot)) = self.shared.jobs.remove(id) else {
            return false;
        };
        slot.gate.close();
        slot.cancel.cancel();
        lock(&self.shared.queue)
            .heap
            .retain(|job| !Arc::ptr_eq(&job.slot, &slot));
        tracing::debug!(job_id = %id, "job cancelled");
        true
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.shared.jobs.contains_key(id)
    }

    /// Jobs submitted and not yet terminal.
    pub fn active_count(&self) -> usize {
        self.shared.jobs.len()
    }

    /// Ids of all jobs not yet terminal.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.shared.jobs.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Attempts currently holding a worker.
    pub fn running_count(&self) -> usize {
        lock(&self.shared.queue).active
    }

    pub fn job_state(&self, id: &str) -> Option<LoadState> {
        self.shared.jobs.get(id).map(|slot| *lock(&slot.state))
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.shared.interceptors
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }
}

impl Shared {
    fn enqueue(
        &self,
        priority: u32,
        seq: Option<u64>,
        attempts: u32,
        descriptor: RequestDescriptor,
        slot: Arc<JobSlot>,
    ) {
        slot.set_state(LoadState::Queued);
        let mut queue = lock(&self.queue);
        let seq = seq.unwrap_or_else(|| {
            let seq = queue.next_seq;
            queue.next_seq += 1;
            seq
        });
        queue.heap.push(QueuedJob {
            priority,
            seq,
            attempts,
            descriptor,
            slot,
        });
    }

    /// Start queued jobs until the ceiling is reached or the heap is empty.
    fn pump(this: &Arc<Self>) {
        loop {
            let job = {
                let mut queue = lock(&this.queue);
                if queue.active >= this.config.max_concurrent {
                    return;
                }
                let Some(job) = queue.heap.pop() else {
                    return;
                };
                if job.slot.cancel.is_cancelled() {
                    continue;
                }
                queue.active += 1;
                job
            };
            job.slot.set_state(LoadState::Executing);
            let shared = Arc::clone(this);
            tokio::spawn(async move { shared.run(job).await });
        }
    }

    fn release(&self) {
        let mut queue = lock(&self.queue);
        queue.active = queue.active.saturating_sub(1);
    }

    async fn run(self: Arc<Self>, job: QueuedJob) {
        let slot = Arc::clone(&job.slot);
        let attempt = job.attempts + 1;
        tracing::debug!(job_id = %slot.id, attempt, "attempt started");

        let result = tokio::select! {
            biased;
            _ = slot.cancel.cancelled() => None,
            result = self.execute(&job.descriptor, &slot) => Some(result),
        };
        self.release();

        let Some(result) = result else {
            Shared::pump(&self);
            return;
        };

        let outcome = match &result {
            Ok(response) => AttemptOutcome::Status(response.status().as_u16()),
            Err(error) => AttemptOutcome::Error(*error),
        };
        match (evaluate(attempt, outcome, job.descriptor.retry_directive()), result) {
            (RetryDecision::Complete, Ok(response)) => {
                self.complete(&slot, response);
                Shared::pump(&self);
            }
            (RetryDecision::Complete, Err(error)) => {
                self.fail(&slot, error, attempt, false);
                Shared::pump(&self);
            }
            (RetryDecision::Fail { error, exhausted }, _) => {
                self.fail(&slot, error, attempt, exhausted);
                Shared::pump(&self);
            }
            (RetryDecision::Retry { delay, reason }, result) => {
                let error = match result {
                    Ok(response) => NetError::HttpStatus(response.status().as_u16()),
                    Err(error) => error,
                };
                slot.set_state(LoadState::WaitingForRetry);
                tracing::warn!(
                    job_id = %slot.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    ?reason,
                    "attempt failed, will retry"
                );
                slot.gate.emit(RequestEvent::WillRetry {
                    attempt,
                    delay,
                    error,
                });
                Shared::pump(&self);

                tokio::select! {
                    biased;
                    _ = slot.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let priority = job.priority.saturating_add(self.config.retry_boost);
                self.enqueue(priority, Some(job.seq), attempt, job.descriptor, slot);
                Shared::pump(&self);
            }
        }
    }

    /// One attempt: open, then buffer the body while reporting progress.
    async fn execute(
        &self,
        descriptor: &RequestDescriptor,
        slot: &JobSlot,
    ) -> Result<HttpResponse, NetError> {
        let request = TransportRequest::from_descriptor(descriptor, self.config.timeouts);
        let response = self.transport.open(request).await?;
        let total = response.content_length().unwrap_or(0);

        let mut body = BytesMut::new();
        let mut chunks = response.body;
        while let Some(chunk) = chunks.next().await {
            body.extend_from_slice(&chunk?);
            slot.report_progress(body.len() as u64, total);
        }
        Ok(HttpResponse::new(response.status, response.headers, body.freeze()))
    }

    fn complete(&self, slot: &JobSlot, response: HttpResponse) {
        let response = self
            .interceptors
            .apply_response(response.with_duration(slot.submitted.elapsed()));
        if self.jobs.remove(&slot.id).is_some() {
            tracing::info!(
                job_id = %slot.id,
                status = response.status().as_u16(),
                "request complete"
            );
            slot.gate.finish(RequestEvent::Complete(response));
        }
    }

    fn fail(&self, slot: &JobSlot, error: NetError, attempts: u32, exhausted: bool) {
        if self.jobs.remove(&slot.id).is_some() {
            tracing::error!(job_id = %slot.id, %error, attempts, exhausted, "request failed");
            slot.gate.finish(RequestEvent::Failed {
                error,
                attempts,
                exhausted,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::events::channel;
    use crate::http::transport::{Opening, TransportResponse};
    use http::{HeaderMap, StatusCode};

    struct Fixed(u16);

    impl Transport for Fixed {
        fn open(&self, _request: TransportRequest) -> Opening {
            let status = StatusCode::from_u16(self.0).unwrap();
            Box::pin(async move {
                let body = futures::stream::iter(vec![Ok(bytes::Bytes::from_static(b"ok"))]);
                Ok(TransportResponse {
                    status,
                    headers: HeaderMap::new(),
                    body: Box::pin(body),
                })
            })
        }
    }

    fn scheduler(transport: impl Transport + 'static) -> RequestScheduler {
        RequestScheduler::new(
            Arc::new(transport),
            InterceptorChain::new(),
            SchedulerConfig::default(),
        )
    }

    #[test]
    fn test_queue_order() {
        let slot = |id: &str| {
            Arc::new(JobSlot {
                id: id.into(),
                gate: EventGate::new(Arc::new(|_| {})),
                cancel: CancelToken::new(),
                state: Mutex::new(LoadState::Queued),
                high_water: AtomicU64::new(0),
                submitted: Instant::now(),
            })
        };
        let descriptor = RequestDescriptor::new("http://example.com").unwrap();
        let mut heap = BinaryHeap::new();
        for (priority, seq, id) in [(50, 0, "a"), (75, 1, "b"), (50, 2, "c"), (25, 3, "d")] {
            heap.push(QueuedJob {
                priority,
                seq,
                attempts: 0,
                descriptor: descriptor.clone(),
                slot: slot(id),
            });
        }
        let order: Vec<_> = std::iter::from_fn(|| heap.pop())
            .map(|job| job.slot.id.clone())
            .collect();
        assert_eq!(order, ["b", "a", "c", "d"]);
    }

    #[tokio::test]
    async fn test_complete_removes_job() {
        let scheduler = scheduler(Fixed(200));
        let (sink, mut rx) = channel();
        let id = scheduler
            .submit(RequestDescriptor::new("http://example.com").unwrap(), sink)
            .unwrap();

        loop {
            match rx.recv().await.unwrap() {
                RequestEvent::Complete(response) => {
                    assert_eq!(response.status(), StatusCode::OK);
                    assert_eq!(response.body().as_ref(), b"ok");
                    assert!(!response.is_cached());
                    break;
                }
                RequestEvent::Progress(_) => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(!scheduler.is_active(&id));
        assert!(scheduler.job_state(&id).is_none());
        assert!(!scheduler.cancel(&id));
    }

    #[tokio::test]
    async fn test_unlisted_error_status_completes() {
        let scheduler = scheduler(Fixed(500));
        let (sink, mut rx) = channel();
        scheduler
            .submit(RequestDescriptor::new("http://example.com").unwrap(), sink)
            .unwrap();
        loop {
            if let RequestEvent::Complete(response) = rx.recv().await.unwrap() {
                assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
                assert!(!response.is_success());
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let scheduler = scheduler(Fixed(200));
        let descriptor = RequestDescriptor::new("http://example.com").unwrap();
        let (sink, _rx) = channel();
        let id = Some("job-1".to_string());
        scheduler
            .submit_with_id(id.clone(), descriptor.clone(), sink.clone())
            .unwrap();
        // Current-thread runtime: the attempt has not run yet.
        assert!(scheduler.is_active("job-1"));
        assert_eq!(
            scheduler.submit_with_id(id, descriptor, sink).unwrap_err(),
            NetError::InvalidState
        );
    }

    #[test]
    fn test_submit_requires_runtime() {
        let scheduler = scheduler(Fixed(200));
        let (sink, _rx) = channel();
        let err = scheduler
            .submit(RequestDescriptor::new("http://example.com").unwrap(), sink)
            .unwrap_err();
        assert_eq!(err, NetError::InvalidState);
    }
}
