//! # netmanager
//!
//! A mobile-oriented HTTP client engine.
//!
//! `netmanager` adds the pieces a stock HTTP client leaves to the app:
//! prioritized request scheduling, retry with backoff, a two-tier response
//! cache, certificate pinning, Server-Sent Events, WebSocket sessions and
//! progress-tracked uploads and downloads.
//!
//! ## Features
//!
//! - **Scheduling**: bounded worker pool, highest priority first, FIFO within
//!   a priority; retried jobs are boosted
//! - **Retry**: linear or exponential backoff on transport errors and listed
//!   status codes
//! - **Caching**: memory tier with size and count eviction, optional disk tier
//! - **Pinning**: `sha256/` SPKI pins per domain, wildcard subdomains
//! - **Streaming**: SSE framing, WebSockets with close-code handling
//! - **Transfers**: pausable, resumable downloads; file and multipart uploads
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use netmanager::base::events::channel;
//! use netmanager::http::{RequestDescriptor, RequestEvent};
//! use netmanager::NetworkManager;
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = NetworkManager::new();
//!     let (sink, mut events) = channel();
//!     manager
//!         .send(RequestDescriptor::new("https://example.com").unwrap(), sink)
//!         .unwrap();
//!     while let Some(event) = events.recv().await {
//!         if let RequestEvent::Complete(response) = event {
//!             println!("Status: {}", response.status());
//!             break;
//!         }
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Errors, cancellation and callback delivery
//! - [`http`] - Requests, retry, caching, interceptors and the scheduler
//! - [`socket`] - TCP/TLS connection setup
//! - [`tls`] - Certificate pinning
//! - [`sse`] - Server-Sent Events
//! - [`ws`] - WebSocket sessions
//! - [`transfer`] - Downloads, uploads and multipart uploads
//!
//! Callbacks are never delivered after a job or session is cancelled, and
//! every job or session ends with exactly one terminal event.

pub mod base;
pub mod client;
pub mod context;
pub mod http;
pub mod registry;
pub mod socket;
pub mod sse;
pub mod tls;
pub mod transfer;
pub mod ws;

pub use base::neterror::NetError;
pub use client::{NetworkManager, NetworkManagerBuilder};
pub use context::{ManagerConfig, NetContext};
