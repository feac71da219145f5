//! Certificate pinning for MITM prevention.
//!
//! Validates server certificates against expected SPKI (Subject Public Key Info)
//! SHA-256 hashes. Pins are written `sha256/<base64>`; a domain written
//! `*.example.com` pins every subdomain of `example.com`.
//!
//! The store is read on every TLS handshake and written rarely, so it lives in
//! a `DashMap` shared by clone.

use crate::base::neterror::NetError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use boring::x509::X509Ref;
use dashmap::DashMap;
use std::sync::Arc;

/// SHA-256 hash of a certificate's SPKI (Subject Public Key Info).
pub type SpkiHash = [u8; 32];

const PIN_PREFIX: &str = "sha256/";

/// Outcome of checking a presented chain against the pin store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinVerdict {
    /// No pins for this host; the platform trust decision stands.
    NotPinned,
    /// Some certificate in the chain matched a pin.
    Accepted,
    /// Pins exist and nothing in the chain matched. The handshake must abort.
    Rejected,
}

/// A set of pins for a domain.
#[derive(Debug, Clone)]
pub struct PinSet {
    /// The domain this pin set applies to.
    pub domain: String,
    /// Whether to apply to subdomains.
    pub include_subdomains: bool,
    /// List of allowed SPKI SHA-256 hashes.
    pub pins: Vec<SpkiHash>,
}

impl PinSet {
    /// Create a new pin set. A leading `*.` turns on subdomain matching.
    pub fn new(domain: impl Into<String>) -> Self {
        let domain = domain.into().to_lowercase();
        match domain.strip_prefix("*.") {
            Some(base) => Self {
                domain: base.to_string(),
                include_subdomains: true,
                pins: Vec::new(),
            },
            None => Self {
                domain,
                include_subdomains: false,
                pins: Vec::new(),
            },
        }
    }

    /// Add a pin written as `sha256/<base64>`.
    pub fn add_pin_str(&mut self, pin: &str) -> Result<(), NetError> {
        self.pins.push(parse_pin(pin)?);
        Ok(())
    }

    /// Add a pin from raw bytes.
    pub fn add_pin(&mut self, hash: SpkiHash) {
        self.pins.push(hash);
    }

    /// Set include_subdomains flag.
    pub fn include_subdomains(mut self, include: bool) -> Self {
        self.include_subdomains = include;
        self
    }

    /// Check if any of the provided hashes match the pins.
    pub fn matches(&self, cert_hashes: &[SpkiHash]) -> bool {
        cert_hashes.iter().any(|hash| self.pins.contains(hash))
    }
}

/// Thread-safe store for certificate pins.
#[derive(Clone)]
pub struct PinStore {
    pins: Arc<DashMap<String, PinSet>>,
}

impl Default for PinStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PinStore {
    /// Create a new empty pin store.
    pub fn new() -> Self {
        Self {
            pins: Arc::new(DashMap::new()),
        }
    }

    /// Replace the pins for `domain`.
    ///
    /// The whole list is parsed before anything is stored, so a bad pin leaves
    /// the previous set untouched.
    pub fn set_pins<I, S>(&self, domain: &str, pins: I) -> Result<(), NetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pin_set = PinSet::new(domain);
        if pin_set.domain.is_empty() {
            return Err(NetError::InvalidArgument);
        }
        for pin in pins {
            pin_set.add_pin_str(pin.as_ref())?;
        }
        tracing::debug!(domain = %pin_set.domain, count = pin_set.pins.len(), "pins set");
        self.add(pin_set);
        Ok(())
    }

    /// Add or replace a pin set.
    pub fn add(&self, pin_set: PinSet) {
        self.pins.insert(pin_set.domain.clone(), pin_set);
    }

    /// Remove pins for a domain.
    pub fn clear_pins(&self, domain: &str) {
        let key = PinSet::new(domain).domain;
        self.pins.remove(&key);
    }

    /// Remove every pin.
    pub fn clear_all(&self) {
        self.pins.clear();
    }

    /// Whether `host` is covered by a pin set.
    pub fn has_pins(&self, host: &str) -> bool {
        self.lookup(host, |_| ()).is_some()
    }

    /// Check a presented chain for `host`.
    pub fn validate(&self, cert_hashes: &[SpkiHash], host: &str) -> PinVerdict {
        self.lookup(host, |pin_set| {
            if pin_set.matches(cert_hashes) {
                PinVerdict::Accepted
            } else {
                PinVerdict::Rejected
            }
        })
        .unwrap_or(PinVerdict::NotPinned)
    }

    /// Check if the connection to `host` with given certificate hashes is allowed.
    /// Returns Ok(()) if pins match or no pins exist for this domain.
    pub fn check(&self, host: &str, cert_hashes: &[SpkiHash]) -> Result<(), NetError> {
        match self.validate(cert_hashes, host) {
            PinVerdict::Rejected => {
                tracing::warn!(host, "certificate chain does not match pinned keys");
                Err(NetError::SslPinnedKeyNotInCertChain)
            }
            PinVerdict::NotPinned | PinVerdict::Accepted => Ok(()),
        }
    }

    fn lookup<R>(&self, host: &str, f: impl FnOnce(&PinSet) -> R) -> Option<R> {
        let host_lower = host.to_lowercase();

        // Exact domain match
        if let Some(pin_set) = self.pins.get(&host_lower) {
            return Some(f(&pin_set));
        }

        // Parent domains carrying subdomain pins
        let parts: Vec<&str> = host_lower.split('.').collect();
        for i in 1..parts.len() {
            let parent = parts[i..].join(".");
            if let Some(pin_set) = self.pins.get(&parent) {
                if pin_set.include_subdomains {
                    return Some(f(&pin_set));
                }
            }
        }
        None
    }

    /// Get the number of pinned domains.
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    /// Check if store is empty.
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

/// Parse `sha256/<base64>` into a hash.
pub fn parse_pin(pin: &str) -> Result<SpkiHash, NetError> {
    let encoded = pin
        .trim()
        .strip_prefix(PIN_PREFIX)
        .ok_or(NetError::InvalidArgument)?;
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|_| NetError::InvalidArgument)?;
    if decoded.len() != 32 {
        return Err(NetError::InvalidArgument);
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&decoded);
    Ok(hash)
}

/// Render a hash in pin notation.
pub fn format_pin(hash: &SpkiHash) -> String {
    format!("{}{}", PIN_PREFIX, STANDARD.encode(hash))
}

/// Compute SPKI hash from a DER-encoded certificate.
pub fn spki_hash(cert_der: &[u8]) -> Result<SpkiHash, NetError> {
    let cert = boring::x509::X509::from_der(cert_der).map_err(|_| NetError::CertAuthorityInvalid)?;
    spki_hash_x509(&cert)
}

/// Compute SPKI hash of a parsed certificate.
pub fn spki_hash_x509(cert: &X509Ref) -> Result<SpkiHash, NetError> {
    use boring::hash::{hash, MessageDigest};

    let pubkey = cert.public_key().map_err(|_| NetError::CertAuthorityInvalid)?;
    let spki_der = pubkey
        .public_key_to_der()
        .map_err(|_| NetError::CertAuthorityInvalid)?;
    let digest =
        hash(MessageDigest::sha256(), &spki_der).map_err(|_| NetError::CertAuthorityInvalid)?;

    let mut result = [0u8; 32];
    result.copy_from_slice(&digest);
    Ok(result)
}
