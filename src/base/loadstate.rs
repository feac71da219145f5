/// Where a scheduled job currently sits in its lifecycle.
///
/// A job that has reached a terminal outcome (or was cancelled) has no
/// load state; it is no longer tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// Waiting in the priority queue for a free worker.
    #[default]
    Queued,

    /// A worker is running the current attempt.
    Executing,

    /// The previous attempt failed; sleeping out the backoff delay.
    WaitingForRetry,
}
