//! Scheduler behaviour against a scripted in-memory transport.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use netmanager::base::events::channel;
use netmanager::base::LoadState;
use netmanager::http::transport::Opening;
use netmanager::http::{
    Backoff, InterceptorChain, Priority, RequestDescriptor, RequestEvent, RequestScheduler,
    RetryDirective, SchedulerConfig, Transport, TransportRequest, TransportResponse,
};
use netmanager::NetError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Answers from a queue of canned outcomes; repeats the last one when the
/// queue runs dry. Records every path it is asked for.
#[derive(Default)]
struct Script {
    outcomes: Mutex<VecDeque<Result<u16, NetError>>>,
    seen: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    traced: AtomicUsize,
    hold: Option<Duration>,
    gate: Option<Arc<Notify>>,
}

#[derive(Clone)]
struct Scripted(Arc<Script>);

impl Script {
    fn new(outcomes: impl IntoIterator<Item = Result<u16, NetError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            ..Default::default()
        }
    }

    fn next(&self) -> Result<u16, NetError> {
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.len() > 1 {
            outcomes.pop_front().unwrap()
        } else {
            outcomes.front().cloned().unwrap_or(Ok(200))
        }
    }
}

impl Scripted {
    fn new(outcomes: impl IntoIterator<Item = Result<u16, NetError>>) -> Self {
        Self(Arc::new(Script::new(outcomes)))
    }

    fn with(script: Script) -> Self {
        Self(Arc::new(script))
    }

    fn calls(&self) -> usize {
        self.0.seen.lock().unwrap().len()
    }

    fn seen(&self) -> Vec<String> {
        self.0.seen.lock().unwrap().clone()
    }

    fn peak(&self) -> usize {
        self.0.peak.load(Ordering::SeqCst)
    }
}

impl Transport for Scripted {
    fn open(&self, request: TransportRequest) -> Opening {
        let script = Arc::clone(&self.0);
        Box::pin(async move {
            script.seen.lock().unwrap().push(request.url.path().to_string());
            if request.headers.contains_key("x-trace") {
                script.traced.fetch_add(1, Ordering::SeqCst);
            }
            let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            script.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(gate) = &script.gate {
                gate.notified().await;
            }
            if let Some(hold) = script.hold {
                tokio::time::sleep(hold).await;
            }
            script.in_flight.fetch_sub(1, Ordering::SeqCst);

            let status = script.next()?;
            let body = Bytes::from(request.url.path().to_string());
            Ok(TransportResponse {
                status: StatusCode::from_u16(status).unwrap(),
                headers: HeaderMap::new(),
                body: Box::pin(futures::stream::iter(vec![Ok(body)])),
            })
        })
    }
}

fn scheduler(transport: Scripted, max_concurrent: usize) -> RequestScheduler {
    RequestScheduler::new(
        Arc::new(transport),
        InterceptorChain::new(),
        SchedulerConfig {
            max_concurrent,
            ..SchedulerConfig::default()
        },
    )
}

fn request(path: &str) -> RequestDescriptor {
    RequestDescriptor::new(&format!("http://scripted.test{}", path)).unwrap()
}

fn fast_retry(max: u32) -> RetryDirective {
    RetryDirective::new(max)
        .backoff(Backoff::Constant)
        .base_delay(Duration::from_millis(5))
}

async fn terminal(
    rx: &mut mpsc::UnboundedReceiver<RequestEvent>,
) -> (Vec<RequestEvent>, RequestEvent) {
    let mut before = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no terminal event")
            .expect("sink dropped");
        if event.is_terminal() {
            return (before, event);
        }
        before.push(event);
    }
}

#[tokio::test]
async fn test_concurrency_ceiling() {
    let transport = Scripted::with(Script {
        hold: Some(Duration::from_millis(20)),
        ..Script::new([Ok(200)])
    });
    let scheduler = scheduler(transport.clone(), 2);

    let (sink, mut rx) = channel();
    for i in 0..8 {
        scheduler.submit(request(&format!("/{}", i)), sink.clone()).unwrap();
    }
    assert!(scheduler.running_count() <= 2);

    let mut done = 0;
    while done < 8 {
        if rx.recv().await.unwrap().is_terminal() {
            done += 1;
        }
    }
    assert_eq!(transport.peak(), 2);
    assert_eq!(transport.calls(), 8);
    assert_eq!(scheduler.active_count(), 0);
}

#[tokio::test]
async fn test_priority_order_behind_busy_worker() {
    let gate = Arc::new(Notify::new());
    let transport = Scripted::with(Script {
        gate: Some(gate.clone()),
        ..Script::new([Ok(200)])
    });
    let scheduler = scheduler(transport.clone(), 1);
    let (sink, mut rx) = channel();

    scheduler.submit(request("/first"), sink.clone()).unwrap();
    while transport.calls() == 0 {
        tokio::task::yield_now().await;
    }

    scheduler
        .submit(request("/low").priority(Priority::Low), sink.clone())
        .unwrap();
    scheduler.submit(request("/normal-a"), sink.clone()).unwrap();
    scheduler
        .submit(request("/high").priority(Priority::High), sink.clone())
        .unwrap();
    scheduler.submit(request("/normal-b"), sink.clone()).unwrap();

    for _ in 0..5 {
        gate.notify_one();
        terminal(&mut rx).await;
    }
    assert_eq!(
        transport.seen(),
        ["/first", "/high", "/normal-a", "/normal-b", "/low"]
    );
}

#[tokio::test]
async fn test_exhausted_retries_report_each_attempt() {
    let transport = Scripted::new([Err(NetError::ConnectionReset)]);
    let scheduler = scheduler(transport.clone(), 4);
    let (sink, mut rx) = channel();

    let id = scheduler
        .submit(request("/flaky").retry(fast_retry(3)), sink)
        .unwrap();
    let (before, last) = terminal(&mut rx).await;

    let retries: Vec<u32> = before
        .iter()
        .filter_map(|e| match e {
            RequestEvent::WillRetry { attempt, error, .. } => {
                assert_eq!(*error, NetError::ConnectionReset);
                Some(*attempt)
            }
            _ => None,
        })
        .collect();
    assert_eq!(retries, [1, 2]);
    match last {
        RequestEvent::Failed {
            error,
            attempts,
            exhausted,
        } => {
            assert_eq!(error, NetError::ConnectionReset);
            assert_eq!(attempts, 3);
            assert!(exhausted);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(transport.calls(), 3);
    assert!(!scheduler.is_active(&id));
    assert!(scheduler.job_state(&id).is_none());
}

#[tokio::test]
async fn test_listed_status_retried_then_succeeds() {
    let transport = Scripted::new([Ok(503), Ok(200)]);
    let scheduler = scheduler(transport.clone(), 4);
    let (sink, mut rx) = channel();

    scheduler
        .submit(request("/busy").retry(fast_retry(3).retry_on([503])), sink)
        .unwrap();
    let (before, last) = terminal(&mut rx).await;

    assert_eq!(
        before
            .iter()
            .filter(|e| matches!(e, RequestEvent::WillRetry { .. }))
            .count(),
        1
    );
    match last {
        RequestEvent::Complete(response) => assert_eq!(response.status(), StatusCode::OK),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_security_errors_skip_retry() {
    let transport = Scripted::new([Err(NetError::SslPinnedKeyNotInCertChain)]);
    let scheduler = scheduler(transport.clone(), 4);
    let (sink, mut rx) = channel();

    scheduler
        .submit(request("/pinned").retry(fast_retry(5)), sink)
        .unwrap();
    let (before, last) = terminal(&mut rx).await;

    assert!(before.iter().all(|e| !matches!(e, RequestEvent::WillRetry { .. })));
    match last {
        RequestEvent::Failed {
            error, exhausted, ..
        } => {
            assert_eq!(error, NetError::SslPinnedKeyNotInCertChain);
            assert!(!exhausted);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_cancel_queued_job_is_silent() {
    let gate = Arc::new(Notify::new());
    let transport = Scripted::with(Script {
        gate: Some(gate.clone()),
        ..Script::new([Ok(200)])
    });
    let scheduler = scheduler(transport.clone(), 1);

    let (busy_sink, mut busy_rx) = channel();
    scheduler.submit(request("/busy"), busy_sink).unwrap();
    let (sink, mut rx) = channel();
    let queued = scheduler.submit(request("/queued"), sink).unwrap();
    assert_eq!(scheduler.job_state(&queued), Some(LoadState::Queued));

    assert!(scheduler.cancel(&queued));
    assert!(!scheduler.cancel(&queued));
    assert_eq!(scheduler.active_count(), 1);

    gate.notify_one();
    terminal(&mut busy_rx).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(transport.seen(), ["/busy"]);
    assert_eq!(scheduler.active_count(), 0);
}

#[tokio::test]
async fn test_cancel_during_retry_wait() {
    let transport = Scripted::new([Err(NetError::ConnectionReset)]);
    let scheduler = scheduler(transport.clone(), 4);
    let (sink, mut rx) = channel();

    let id = scheduler
        .submit(
            request("/slow-retry").retry(
                RetryDirective::new(5)
                    .backoff(Backoff::Constant)
                    .base_delay(Duration::from_secs(60)),
            ),
            sink,
        )
        .unwrap();

    match rx.recv().await.unwrap() {
        RequestEvent::WillRetry { attempt: 1, .. } => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(scheduler.job_state(&id), Some(LoadState::WaitingForRetry));
    assert!(scheduler.cancel(&id));
    assert!(scheduler.job_state(&id).is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn test_request_interceptor_rewrites_before_send() {
    let transport = Scripted::new([Ok(200)]);
    let interceptors = InterceptorChain::new();
    interceptors.add_request(|d: RequestDescriptor| d.header("X-Trace", "1").unwrap());
    interceptors.add_response(|r| r.with_cached(false));
    let scheduler = RequestScheduler::new(
        Arc::new(transport.clone()),
        interceptors,
        SchedulerConfig::default(),
    );
    let (sink, mut rx) = channel();
    scheduler.submit(request("/traced"), sink).unwrap();
    match terminal(&mut rx).await.1 {
        RequestEvent::Complete(response) => assert_eq!(response.text(), "/traced"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(transport.0.traced.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancel_executing_job_drops_attempt() {
    let gate = Arc::new(Notify::new());
    let transport = Scripted::with(Script {
        gate: Some(gate.clone()),
        ..Script::new([Ok(200)])
    });
    let scheduler = scheduler(transport.clone(), 1);

    let (sink, mut rx) = channel();
    let id = scheduler.submit(request("/in-flight"), sink).unwrap();
    while transport.calls() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(scheduler.job_state(&id), Some(LoadState::Executing));

    assert!(scheduler.cancel(&id));
    assert!(scheduler.job_state(&id).is_none());
    tokio::time::sleep(Duration::from_millis(20)).await;

    // the open future was dropped while parked on the gate
    assert_eq!(transport.0.in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.running_count(), 0);
    assert!(rx.try_recv().is_err());

    // the worker slot is free for the next job
    let (next_sink, mut next_rx) = channel();
    scheduler.submit(request("/after"), next_sink).unwrap();
    while transport.calls() < 2 {
        tokio::task::yield_now().await;
    }
    gate.notify_one();
    assert!(matches!(
        terminal(&mut next_rx).await.1,
        RequestEvent::Complete(_)
    ));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_retried_job_is_boosted_in_queue() {
    let gate = Arc::new(Notify::new());
    let transport = Scripted::with(Script {
        gate: Some(gate.clone()),
        ..Script::new([Err(NetError::ConnectionReset), Ok(200)])
    });
    let scheduler = RequestScheduler::new(
        Arc::new(transport.clone()),
        InterceptorChain::new(),
        SchedulerConfig {
            max_concurrent: 1,
            retry_boost: 30,
            ..SchedulerConfig::default()
        },
    );
    let (sink, mut rx) = channel();

    scheduler
        .submit(
            request("/retried").priority(Priority::Low).retry(fast_retry(3)),
            sink.clone(),
        )
        .unwrap();
    while transport.calls() == 0 {
        tokio::task::yield_now().await;
    }
    gate.notify_one();
    assert!(matches!(
        rx.recv().await.unwrap(),
        RequestEvent::WillRetry { attempt: 1, .. }
    ));

    // occupy the worker, then queue newer jobs behind it
    scheduler.submit(request("/busy"), sink.clone()).unwrap();
    scheduler
        .submit(request("/low-newer").priority(Priority::Low), sink.clone())
        .unwrap();
    scheduler.submit(request("/normal-newer"), sink.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    for _ in 0..4 {
        gate.notify_one();
        terminal(&mut rx).await;
    }
    // Low + boost (55) outranks Normal (50) and the newer Low (25)
    assert_eq!(
        transport.seen(),
        ["/retried", "/busy", "/retried", "/normal-newer", "/low-newer"]
    );
}
