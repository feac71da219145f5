//! Retry decisions and backoff.
//!
//! Pure functions: given the attempt that just finished and how it ended,
//! decide whether to retry and how long to wait. The scheduler owns the
//! sleeping and re-queueing.

use crate::base::neterror::NetError;
use crate::http::descriptor::{Backoff, RetryDirective};
use std::time::Duration;

/// Why an attempt is being retried. Used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    ConnectionReset,
    ConnectionClosed,
    ConnectionRefused,
    NotConnected,
    Timeout,
    NameNotResolved,
    OtherTransport,
    /// The response status is listed in the directive's retry set.
    Status(u16),
}

impl RetryReason {
    /// Map a NetError to a RetryReason, if the error is retryable.
    pub fn from_error(error: &NetError) -> Option<Self> {
        if !error.is_retryable() {
            return None;
        }
        Some(match error {
            NetError::ConnectionReset | NetError::ConnectionAborted => Self::ConnectionReset,
            NetError::ConnectionClosed | NetError::EmptyResponse => Self::ConnectionClosed,
            NetError::ConnectionRefused => Self::ConnectionRefused,
            NetError::InternetDisconnected => Self::NotConnected,
            NetError::ConnectionTimedOut => Self::Timeout,
            NetError::NameNotResolved => Self::NameNotResolved,
            _ => Self::OtherTransport,
        })
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// A response arrived with this status.
    Status(u16),
    /// No response: the attempt failed with this error.
    Error(NetError),
}

/// What the scheduler does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Deliver the response as the final result.
    Complete,
    /// Wait `delay`, then run the next attempt.
    Retry { delay: Duration, reason: RetryReason },
    /// Stop with an error. `exhausted` marks a retry budget that ran out.
    Fail { error: NetError, exhausted: bool },
}

/// Delay before attempt `attempt + 1`, where `attempt` is the 1-based number
/// of the attempt that just failed.
pub fn backoff_delay(attempt: u32, backoff: Backoff, base: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    match backoff {
        Backoff::Exponential => base.saturating_mul(1u32 << (attempt - 1).min(31)),
        Backoff::Linear => base.saturating_mul(attempt),
        Backoff::Constant => base,
    }
}

/// Decide what follows attempt number `attempt` (1-based).
pub fn evaluate(
    attempt: u32,
    outcome: AttemptOutcome,
    directive: Option<&RetryDirective>,
) -> RetryDecision {
    let (reason, error) = match outcome {
        AttemptOutcome::Status(status) => {
            let listed = directive.map_or(false, |d| d.retry_on.contains(&status));
            if !listed {
                return RetryDecision::Complete;
            }
            (RetryReason::Status(status), NetError::HttpStatus(status))
        }
        AttemptOutcome::Error(error) => match RetryReason::from_error(&error) {
            Some(reason) => (reason, error),
            None => return RetryDecision::Fail { error, exhausted: false },
        },
    };

    let Some(directive) = directive.filter(|d| d.max_attempts > 0) else {
        return RetryDecision::Fail { error, exhausted: false };
    };

    if should_retry(attempt, directive) {
        RetryDecision::Retry {
            delay: backoff_delay(attempt, directive.backoff, directive.base_delay),
            reason,
        }
    } else {
        RetryDecision::Fail { error, exhausted: true }
    }
}

/// Check if we should retry based on attempt count.
pub fn should_retry(attempt: u32, directive: &RetryDirective) -> bool {
    attempt < directive.max_attempts
}
