//! Callback delivery for jobs and sessions.
//!
//! Every job and session reports through an [`EventSink`]. The sink is wrapped
//! in an [`EventGate`], which owns the delivery rules:
//! - non-terminal events pass through while the gate is open
//! - exactly one terminal event passes, then the gate closes
//! - cancellation closes the gate without delivering anything
//!
//! Delivery happens while the gate lock is held, so once `close()` returns no
//! callback for that job is running or will run. A sink must therefore not call
//! `cancel` on its own job synchronously.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Callback target for events of type `E`.
pub type EventSink<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Build a sink that forwards into an unbounded channel.
///
/// Events emitted after the receiver is dropped are discarded.
pub fn channel<E: Send + 'static>() -> (EventSink<E>, mpsc::UnboundedReceiver<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: EventSink<E> = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (sink, rx)
}

/// Bytes moved so far against an expected total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub transferred: u64,
    /// Zero when the total is unknown.
    pub total: u64,
}

impl Progress {
    pub fn new(transferred: u64, total: u64) -> Self {
        Self { transferred, total }
    }

    /// Completed fraction in `[0, 1]`; zero when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.transferred as f64 / self.total as f64).min(1.0)
        }
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Terminal-once wrapper around an [`EventSink`].
pub struct EventGate<E> {
    sink: Mutex<Option<EventSink<E>>>,
}

impl<E> EventGate<E> {
    pub fn new(sink: EventSink<E>) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
        }
    }

    /// Deliver a non-terminal event. Returns false if the gate is closed.
    pub fn emit(&self, event: E) -> bool {
        let guard = lock(&self.sink);
        match guard.as_ref() {
            Some(sink) => {
                sink(event);
                true
            }
            None => false,
        }
    }

    /// Deliver the terminal event and close. Only the first call delivers.
    pub fn finish(&self, event: E) -> bool {
        let mut guard = lock(&self.sink);
        match guard.take() {
            Some(sink) => {
                sink(event);
                true
            }
            None => false,
        }
    }

    /// Close without delivering. Returns true if the gate was still open.
    pub fn close(&self) -> bool {
        lock(&self.sink).take().is_some()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.sink).is_some()
    }
}

/// Cleanup hook run once when a session reaches a terminal state.
///
/// The owner of a session table installs one before starting the session so
/// every exit path (completion, failure, close, cancel) deregisters it.
#[derive(Default)]
pub struct Finalizer {
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Finalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the hook, replacing any earlier one.
    pub fn set<F: FnOnce() + Send + 'static>(&self, f: F) {
        *lock(&self.hook) = Some(Box::new(f));
    }

    /// Run the hook if it has not run yet.
    pub fn run(&self) -> bool {
        let hook = lock(&self.hook).take();
        match hook {
            Some(f) => {
                f();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Finalizer")
            .field("pending", &lock(&self.hook).is_some())
            .finish()
    }
}

impl<E> std::fmt::Debug for EventGate<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventGate")
            .field("open", &self.is_open())
            .finish()
    }
}
