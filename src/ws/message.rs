//! WebSocket frames and close codes.

use bytes::Bytes;
use tokio_tungstenite::tungstenite;
use tungstenite::protocol::frame::coding::CloseCode as WireCloseCode;

/// Outbound data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
}

impl Message {
    pub(crate) fn into_wire(self) -> tungstenite::Message {
        match self {
            Message::Text(s) => tungstenite::Message::Text(s),
            Message::Binary(b) => tungstenite::Message::Binary(b.to_vec()),
            Message::Ping(b) => tungstenite::Message::Ping(b.to_vec()),
        }
    }
}

/// Close code and reason, as sent or as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    /// A frame for `code`, falling back to [`CloseCode::NORMAL`] when the
    /// code may not be sent by an endpoint.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: CloseCode::sendable_or_normal(code),
            reason: reason.into(),
        }
    }

    pub(crate) fn into_wire(self) -> tungstenite::Message {
        tungstenite::Message::Close(Some(tungstenite::protocol::CloseFrame {
            code: WireCloseCode::from(self.code.0),
            reason: self.reason.into(),
        }))
    }

    pub(crate) fn from_wire(frame: Option<&tungstenite::protocol::CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => Self {
                code: CloseCode(u16::from(frame.code)),
                reason: frame.reason.to_string(),
            },
            None => Self {
                code: CloseCode::NO_STATUS,
                reason: String::new(),
            },
        }
    }
}

/// WebSocket close codes (RFC 6455).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Normal closure
    pub const NORMAL: Self = Self(1000);
    /// Endpoint going away
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    /// No status received. Never sent on the wire.
    pub const NO_STATUS: Self = Self(1005);
    /// Connection dropped without a close frame. Never sent on the wire.
    pub const ABNORMAL: Self = Self(1006);
    pub const POLICY_VIOLATION: Self = Self(1008);
    pub const INTERNAL_ERROR: Self = Self(1011);

    /// Whether an endpoint may put this code in a close frame: the defined
    /// protocol codes minus the reserved ones, plus the registered and
    /// private ranges.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    pub fn sendable_or_normal(code: u16) -> Self {
        if Self::is_sendable(code) {
            Self(code)
        } else {
            Self::NORMAL
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.0
    }
}
