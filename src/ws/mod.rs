//! WebSocket client sessions.
//!
//! Connections use tokio-tungstenite for framing over a [`ConnectJob`]
//! socket, so certificate pins apply to `wss://` as they do to HTTPS.
//!
//! # Example
//! ```ignore
//! use netmanager::ws::{WebSocketSession, WsEvent};
//!
//! let session = WebSocketSession::new("chat", "wss://example.com/chat", headers, sink)?;
//! session.connect(&tls, &pins, Duration::from_secs(30))?;
//! // after WsEvent::Open
//! session.send("hello").await?;
//! session.close(1000, "bye").await?;
//! ```
//!
//! [`ConnectJob`]: crate::socket::connectjob::ConnectJob

mod connection;
mod message;

pub use connection::{WebSocketSession, WsEvent, WsState};
pub use message::{CloseCode, CloseFrame, Message};
