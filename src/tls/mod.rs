//! Certificate pinning.

pub mod pinning;

pub use pinning::{
    format_pin, parse_pin, spki_hash, spki_hash_x509, PinSet, PinStore, PinVerdict, SpkiHash,
};
