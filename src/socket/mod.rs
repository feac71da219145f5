//! Socket and connection setup.
//!
//! Mirrors the shape of Chromium's `net/socket/`, reduced to what a
//! one-connection-per-request client needs:
//! - [`connectjob`]: DNS → TCP → TLS → pin check
//! - [`client`]: the plain or TLS stream handed to protocol layers
//! - [`tls`]: TLS configuration with BoringSSL

pub mod client;
pub mod connectjob;
pub mod tls;

pub use client::SocketType;
pub use connectjob::{ConnectJob, Endpoint};
pub use tls::TlsConfig;
