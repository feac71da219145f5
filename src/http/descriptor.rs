//! Immutable request descriptors.
//!
//! A [`RequestDescriptor`] is built once, then passed by value through the
//! interceptor chain. Each interceptor receives an owned descriptor and
//! returns the one to use next, so no stage ever observes a half-edited
//! request.

use crate::base::neterror::NetError;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Scheduling priority. Higher values dequeue first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn value(self) -> u32 {
        match self {
            Priority::High => 75,
            Priority::Normal => 50,
            Priority::Low => 25,
        }
    }
}

/// How a request uses the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CachePolicy {
    /// Serve a fresh cached entry if present, otherwise go to the network.
    #[serde(rename = "cache-first")]
    CacheFirst,
    /// Go to the network; fall back to any cached entry if it fails.
    #[serde(rename = "network-first")]
    NetworkFirst,
    /// Never read or write the cache.
    #[serde(rename = "network-only")]
    NetworkOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDirective {
    pub policy: CachePolicy,
    /// Maximum age of an entry served from cache. `None` accepts any age.
    pub ttl: Option<Duration>,
}

impl CacheDirective {
    pub fn new(policy: CachePolicy) -> Self {
        Self { policy, ttl: None }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Growth curve for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    #[default]
    Exponential,
    Linear,
    /// Every retry waits the base delay.
    Constant,
}

impl Backoff {
    /// Parse an option-map name. Unrecognised names select [`Backoff::Constant`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "exponential" => Backoff::Exponential,
            "linear" => Backoff::Linear,
            _ => Backoff::Constant,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryDirective {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay: Duration,
    /// Response statuses that count as retryable failures.
    pub retry_on: Vec<u16>,
}

impl RetryDirective {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential,
            base_delay: Duration::from_secs(1),
            retry_on: Vec::new(),
        }
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn retry_on(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retry_on = statuses.into_iter().collect();
        self
    }
}

/// Everything needed to perform one logical request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    url: Url,
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
    priority: Priority,
    cache: Option<CacheDirective>,
    retry: Option<RetryDirective>,
}

impl RequestDescriptor {
    /// A GET request for `url`. Only `http` and `https` are accepted.
    pub fn new(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|_| NetError::InvalidUrl)?;
        Self::from_url(url)
    }

    pub fn from_url(url: Url) -> Result<Self, NetError> {
        validate_http_url(&url)?;
        Ok(Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            priority: Priority::Normal,
            cache: None,
            retry: None,
        })
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set a header, replacing any earlier value under the same
    /// (case-insensitive) name.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, NetError> {
        self.set_header(name, value)?;
        Ok(self)
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), NetError> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| NetError::InvalidArgument)?;
        let value = HeaderValue::from_str(value).map_err(|_| NetError::InvalidArgument)?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn cache(mut self, directive: CacheDirective) -> Self {
        self.cache = Some(directive);
        self
    }

    pub fn retry(mut self, directive: RetryDirective) -> Self {
        self.retry = Some(directive);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn http_method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn request_priority(&self) -> Priority {
        self.priority
    }

    pub fn cache_directive(&self) -> Option<&CacheDirective> {
        self.cache.as_ref()
    }

    pub fn retry_directive(&self) -> Option<&RetryDirective> {
        self.retry.as_ref()
    }
}

pub(crate) fn validate_http_url(url: &Url) -> Result<(), NetError> {
    match url.scheme() {
        "http" | "https" => {}
        _ => return Err(NetError::DisallowedUrlScheme),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(NetError::InvalidUrl);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_url_fails_fast() {
        assert_eq!(
            RequestDescriptor::new("not a url").unwrap_err(),
            NetError::InvalidUrl
        );
        assert_eq!(
            RequestDescriptor::new("ftp://example.com/file").unwrap_err(),
            NetError::DisallowedUrlScheme
        );
    }

    #[test]
    fn test_headers_case_insensitive_last_write_wins() {
        let request = RequestDescriptor::new("https://example.com")
            .unwrap()
            .header("X-Token", "a")
            .unwrap()
            .header("x-token", "b")
            .unwrap();

        assert_eq!(request.headers().len(), 1);
        assert_eq!(request.headers()["X-TOKEN"], "b");
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let result = RequestDescriptor::new("https://example.com")
            .unwrap()
            .header("bad header", "v");
        assert_eq!(result.unwrap_err(), NetError::InvalidArgument);
    }

    #[test]
    fn test_priority_values_ordered() {
        assert!(Priority::High.value() > Priority::Normal.value());
        assert!(Priority::Normal.value() > Priority::Low.value());
    }

    #[test]
    fn test_defaults() {
        let request = RequestDescriptor::new("http://example.com/a?b=c").unwrap();
        assert_eq!(*request.http_method(), Method::GET);
        assert_eq!(request.request_priority(), Priority::Normal);
        assert!(request.cache_directive().is_none());
        assert!(request.retry_directive().is_none());
    }
}
