//! Option-map translation.
//!
//! Bindings hand requests over as loosely typed maps. [`RequestOptions`]
//! deserializes that shape and turns it into a [`RequestDescriptor`]:
//!
//! ```json
//! {
//!   "url": "https://api.example.com/items",
//!   "method": "POST",
//!   "headers": { "Content-Type": "application/json" },
//!   "body": "{\"name\":\"x\"}",
//!   "priority": "high",
//!   "cache": { "policy": "cache-first", "ttl": 60 },
//!   "retry": { "max": 3, "backoff": "linear", "baseDelay": 0.5, "retryOn": [503] }
//! }
//! ```

use crate::base::neterror::NetError;
use crate::http::descriptor::{
    Backoff, CacheDirective, CachePolicy, Priority, RequestDescriptor, RetryDirective,
};
use http::Method;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct RequestOptions {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub cache: Option<CacheOptions>,
    #[serde(default)]
    pub retry: Option<RetryOptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheOptions {
    pub policy: CachePolicy,
    /// Seconds.
    #[serde(default)]
    pub ttl: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOptions {
    #[serde(default)]
    pub max: u32,
    #[serde(default)]
    pub backoff: Option<String>,
    /// Seconds.
    #[serde(default = "default_base_delay")]
    pub base_delay: f64,
    #[serde(default)]
    pub retry_on: Vec<u16>,
}

fn default_base_delay() -> f64 {
    1.0
}

impl RequestOptions {
    /// Parse an option map from JSON. Missing or mistyped fields are
    /// `InvalidArgument`.
    pub fn from_json(json: &str) -> Result<Self, NetError> {
        serde_json::from_str(json).map_err(|e| {
            tracing::debug!(error = %e, "rejected request options");
            NetError::InvalidArgument
        })
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, NetError> {
        serde_json::from_value(value).map_err(|e| {
            tracing::debug!(error = %e, "rejected request options");
            NetError::InvalidArgument
        })
    }

    /// Build the descriptor. URL problems surface as `InvalidUrl` or
    /// `DisallowedUrlScheme`; every other bad value is `InvalidArgument`.
    pub fn into_descriptor(self) -> Result<RequestDescriptor, NetError> {
        let method = match self.method.as_deref() {
            Some(name) => Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes())
                .map_err(|_| NetError::InvalidArgument)?,
            None => Method::GET,
        };

        let mut descriptor = RequestDescriptor::new(&self.url)?
            .method(method)
            .priority(self.priority);

        for (name, value) in &self.headers {
            descriptor.set_header(name, value)?;
        }
        if let Some(body) = self.body {
            descriptor = descriptor.body(body);
        }

        if let Some(cache) = self.cache {
            let mut directive = CacheDirective::new(cache.policy);
            if let Some(ttl) = cache.ttl {
                directive = directive.ttl(seconds(ttl)?);
            }
            descriptor = descriptor.cache(directive);
        }

        if let Some(retry) = self.retry {
            if retry.base_delay.is_nan() || retry.base_delay <= 0.0 {
                return Err(NetError::InvalidArgument);
            }
            let backoff = retry
                .backoff
                .as_deref()
                .map_or(Backoff::Exponential, Backoff::from_name);
            descriptor = descriptor.retry(
                RetryDirective::new(retry.max)
                    .backoff(backoff)
                    .base_delay(seconds(retry.base_delay)?)
                    .retry_on(retry.retry_on),
            );
        }

        Ok(descriptor)
    }
}

fn seconds(value: f64) -> Result<Duration, NetError> {
    Duration::try_from_secs_f64(value).map_err(|_| NetError::InvalidArgument)
}
