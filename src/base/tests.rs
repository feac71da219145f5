use crate::base::neterror::{ErrorKind, NetError};

#[test]
fn test_net_error_roundtrip() {
    let original = NetError::ConnectionRefused;
    let code = original.as_i32();
    assert_eq!(code, -102);
    assert!(matches!(NetError::from(code), NetError::ConnectionRefused));

    let custom = NetError::InvalidState;
    assert_eq!(NetError::from(custom.as_i32()), NetError::InvalidState);
}

#[test]
fn test_http_status_code_range() {
    let err = NetError::HttpStatus(503);
    assert_eq!(err.as_i32(), -20503);
    assert_eq!(NetError::from(-20503), NetError::HttpStatus(503));
}

#[test]
fn test_unknown_error() {
    let err = NetError::from(-9999);
    assert!(matches!(err, NetError::Unknown(-9999)));
}

#[test]
fn test_collision_avoidance() {
    // Chromium reserves -900..=-906 for blob errors.
    let blob_range = -906..=-900;
    assert!(!blob_range.contains(&NetError::InvalidState.as_i32()));
    assert!(!blob_range.contains(&NetError::HttpStatus(100).as_i32()));
}

#[test]
fn test_only_transport_errors_retry() {
    assert!(NetError::ConnectionReset.is_retryable());
    assert!(NetError::ConnectionTimedOut.is_retryable());
    assert!(!NetError::SslPinnedKeyNotInCertChain.is_retryable());
    assert!(!NetError::InvalidUrl.is_retryable());
    assert!(!NetError::HttpStatus(503).is_retryable());
    assert!(NetError::InternetDisconnected.is_retryable());
}

#[test]
fn test_error_kinds() {
    assert_eq!(NetError::InvalidUrl.kind(), ErrorKind::InvalidInput);
    assert_eq!(NetError::SocketNotConnected.kind(), ErrorKind::State);
    assert_eq!(NetError::CertAuthorityInvalid.kind(), ErrorKind::Security);
    assert_eq!(NetError::FileNotFound.kind(), ErrorKind::File);
    assert_eq!(NetError::HttpStatus(500).kind(), ErrorKind::Protocol);
}
