use thiserror::Error;

/// Coarse classification of a [`NetError`].
///
/// Retry decisions and callback shapes depend only on the kind, never on the
/// individual variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request: bad URL, bad option value, bad pin string.
    InvalidInput,
    /// Connection-level failure. The only retryable kind.
    Transport,
    /// Malformed response or a status listed in the retry set.
    Protocol,
    /// Certificate pin mismatch or TLS trust failure.
    Security,
    /// Operation attempted in the wrong session state.
    State,
    /// Local filesystem failure during a transfer or cache write.
    File,
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum NetError {
    // Generic
    #[error("Operation failed")]
    Failed,
    #[error("Invalid argument")]
    InvalidArgument,

    // File
    #[error("File not found")]
    FileNotFound,
    #[error("Access denied")]
    AccessDenied,
    #[error("Not enough space on disk")]
    FileNoSpace,

    // Connection
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Internet disconnected")]
    InternetDisconnected,
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Not connected")]
    SocketNotConnected,
    #[error("Connection timed out")]
    ConnectionTimedOut,

    // Certificate
    #[error("SSL pinned key not in cert chain")]
    SslPinnedKeyNotInCertChain,
    #[error("Server certificate is not trusted")]
    CertAuthorityInvalid,

    // WebSocket
    #[error("WebSocket protocol error")]
    WsProtocolError,

    // HTTP
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Disallowed URL scheme")]
    DisallowedUrlScheme,
    #[error("Invalid response")]
    InvalidResponse,
    #[error("Empty response")]
    EmptyResponse,
    #[error("Request range not satisfiable")]
    RequestRangeNotSatisfiable,

    // Custom codes (-900 range is reserved upstream, so these start at -10000)
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("Operation not valid in the current state")]
    InvalidState,

    #[error("Unknown error {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Failed => -2,
            NetError::InvalidArgument => -4,
            NetError::FileNotFound => -6,
            NetError::AccessDenied => -10,
            NetError::FileNoSpace => -18,

            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed => -104,
            NetError::NameNotResolved => -105,
            NetError::InternetDisconnected => -106,
            NetError::SslProtocolError => -107,
            NetError::AddressUnreachable => -109,
            NetError::SocketNotConnected => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::WsProtocolError => -145,
            NetError::SslPinnedKeyNotInCertChain => -150,

            NetError::CertAuthorityInvalid => -202,

            NetError::InvalidUrl => -300,
            NetError::DisallowedUrlScheme => -301,
            NetError::InvalidResponse => -320,
            NetError::EmptyResponse => -324,
            NetError::RequestRangeNotSatisfiable => -328,

            // Status codes are folded into a single custom range.
            NetError::HttpStatus(status) => -20000 - i32::from(*status),
            NetError::InvalidState => -10001,
            NetError::Unknown(code) => *code,
        }
    }

    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::InvalidArgument
            | NetError::InvalidUrl
            | NetError::DisallowedUrlScheme => ErrorKind::InvalidInput,

            NetError::Failed
            | NetError::ConnectionClosed
            | NetError::ConnectionReset
            | NetError::ConnectionRefused
            | NetError::ConnectionAborted
            | NetError::ConnectionFailed
            | NetError::NameNotResolved
            | NetError::InternetDisconnected
            | NetError::SslProtocolError
            | NetError::AddressUnreachable
            | NetError::ConnectionTimedOut
            | NetError::EmptyResponse
            | NetError::Unknown(_) => ErrorKind::Transport,

            NetError::WsProtocolError
            | NetError::InvalidResponse
            | NetError::RequestRangeNotSatisfiable
            | NetError::HttpStatus(_) => ErrorKind::Protocol,

            NetError::SslPinnedKeyNotInCertChain | NetError::CertAuthorityInvalid => {
                ErrorKind::Security
            }

            NetError::SocketNotConnected | NetError::InvalidState => ErrorKind::State,

            NetError::FileNotFound | NetError::AccessDenied | NetError::FileNoSpace => {
                ErrorKind::File
            }
        }
    }

    /// Transport failures are the only errors a retry directive may retry.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -2 => NetError::Failed,
            -4 => NetError::InvalidArgument,
            -6 => NetError::FileNotFound,
            -10 => NetError::AccessDenied,
            -18 => NetError::FileNoSpace,

            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -106 => NetError::InternetDisconnected,
            -107 => NetError::SslProtocolError,
            -109 => NetError::AddressUnreachable,
            -112 => NetError::SocketNotConnected,
            -118 => NetError::ConnectionTimedOut,
            -145 => NetError::WsProtocolError,
            -150 => NetError::SslPinnedKeyNotInCertChain,

            -202 => NetError::CertAuthorityInvalid,

            -300 => NetError::InvalidUrl,
            -301 => NetError::DisallowedUrlScheme,
            -320 => NetError::InvalidResponse,
            -324 => NetError::EmptyResponse,
            -328 => NetError::RequestRangeNotSatisfiable,

            -10001 => NetError::InvalidState,
            c if (-20999..=-20000).contains(&c) => NetError::HttpStatus((-20000 - c) as u16),
            c => NetError::Unknown(c),
        }
    }
}
