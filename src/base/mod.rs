//! Base types and error handling.
//!
//! Provides foundational types shared by every layer:
//! - [`NetError`]: Network error codes, Chromium numbering where one exists
//! - [`LoadState`]: Lifecycle state of a scheduled job
//! - [`CancelToken`]: Cooperative cancellation for jobs and sessions
//! - [`EventGate`]: Terminal-once callback delivery

pub mod cancel;
pub mod context;
pub mod events;
pub mod loadstate;
pub mod neterror;

pub use cancel::CancelToken;
pub use events::{EventGate, EventSink, Finalizer, Progress};
pub use loadstate::LoadState;
pub use neterror::{ErrorKind, NetError};

#[cfg(test)]
mod tests;
