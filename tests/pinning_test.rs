//! Certificate pinning integration tests.

use netmanager::tls::pinning::{format_pin, PinStore, PinVerdict};
use netmanager::NetworkManager;

#[test]
fn test_pin_store_empty_allows_all() {
    let store = PinStore::new();
    assert!(store.check("example.com", &[[0u8; 32]]).is_ok());
}

#[test]
fn test_pin_strings_roundtrip_through_store() {
    let store = PinStore::new();
    let leaf = [42u8; 32];
    let backup = [43u8; 32];
    store
        .set_pins("example.com", [format_pin(&leaf), format_pin(&backup)])
        .unwrap();

    assert_eq!(store.validate(&[backup], "example.com"), PinVerdict::Accepted);
    assert_eq!(store.validate(&[[99u8; 32]], "example.com"), PinVerdict::Rejected);
}

#[test]
fn test_subdomain_pinning() {
    let store = PinStore::new();
    let hash = [77u8; 32];
    store.set_pins("*.example.com", [format_pin(&hash)]).unwrap();

    assert!(store.check("sub.example.com", &[hash]).is_ok());
    assert!(store.check("deep.sub.example.com", &[hash]).is_ok());
    assert!(store.check("deep.sub.example.com", &[[0u8; 32]]).is_err());
}

#[test]
fn test_manager_shares_one_store() {
    let manager = NetworkManager::new();
    let hash = [8u8; 32];
    manager
        .set_certificate_pins("pinned.example", [format_pin(&hash)])
        .unwrap();

    let store = manager.pin_store();
    assert!(store.has_pins("pinned.example"));

    manager.clear_certificate_pins("pinned.example");
    assert!(!store.has_pins("pinned.example"));

    manager
        .set_certificate_pins("pinned.example", [format_pin(&hash)])
        .unwrap();
    manager.clear_all_certificate_pins();
    assert!(store.is_empty());
}
