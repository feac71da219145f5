//! Server-Sent Events.
//!
//! - [`decoder`]: byte-level record framing, no I/O
//! - [`session`]: connection lifecycle and callback delivery

pub mod decoder;
pub mod session;

pub use decoder::{SseDecoder, SseEvent};
pub use session::{StreamEvent, StreamSession, StreamState};
