//! Ergonomic error context helpers.
//!
//! Converts `std::io::Error` into the matching [`NetError`] and logs the
//! context (host, port or path) that the numeric code alone cannot carry.

use crate::base::neterror::NetError;
use std::io;
use std::path::Path;

/// Map an IO error raised on a socket onto the transport taxonomy.
pub fn classify_socket_error(err: &io::Error) -> NetError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
        io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
        io::ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
        io::ErrorKind::NotConnected => NetError::InternetDisconnected,
        io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => NetError::ConnectionClosed,
        io::ErrorKind::AddrNotAvailable => NetError::AddressUnreachable,
        _ => NetError::ConnectionFailed,
    }
}

/// Map an IO error raised on a local file.
pub fn classify_file_error(err: &io::Error) -> NetError {
    match err.kind() {
        io::ErrorKind::NotFound => NetError::FileNotFound,
        io::ErrorKind::PermissionDenied => NetError::AccessDenied,
        io::ErrorKind::WriteZero => NetError::FileNoSpace,
        _ => NetError::Failed,
    }
}

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add connection context to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use netmanager::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("example.com", 443)?;
    /// ```
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Add file context to an IO error.
    fn file_context(self, path: &Path) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| {
            let mapped = classify_socket_error(&e);
            tracing::debug!(host, port, error = %e, code = mapped.as_i32(), "connection error");
            mapped
        })
    }

    fn file_context(self, path: &Path) -> Result<T, NetError> {
        self.map_err(|e| {
            let mapped = classify_file_error(&e);
            tracing::debug!(
                path = %path.display(),
                error = %e,
                code = mapped.as_i32(),
                "file error"
            );
            mapped
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_connection_context() {
        let result: Result<(), io::Error> =
            Err(Error::new(ErrorKind::ConnectionRefused, "refused"));
        let err = result.connection_context("example.com", 443).unwrap_err();
        assert_eq!(err, NetError::ConnectionRefused);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_timeout_maps_to_transport() {
        let result: Result<(), io::Error> = Err(Error::new(ErrorKind::TimedOut, "slow"));
        let err = result.connection_context("example.com", 80).unwrap_err();
        assert_eq!(err, NetError::ConnectionTimedOut);
    }

    #[test]
    fn test_not_connected_is_transport() {
        let result: Result<(), io::Error> = Err(Error::from(ErrorKind::NotConnected));
        let err = result.connection_context("example.com", 443).unwrap_err();
        assert_eq!(err, NetError::InternetDisconnected);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_file_context() {
        let result: Result<(), io::Error> = Err(Error::new(ErrorKind::NotFound, "missing"));
        let err = result.file_context(Path::new("/tmp/missing.bin")).unwrap_err();
        assert_eq!(err, NetError::FileNotFound);
        assert!(!err.is_retryable());
    }
}
