//! Manager configuration and the shared network context.
//!
//! A [`NetContext`] bundles everything jobs and sessions share: certificate
//! pins, TLS settings, interceptors, the response cache and the transport.
//! It is built explicitly and handed to whoever needs it; there is no
//! process-wide instance.

use crate::base::neterror::NetError;
use crate::http::httpcache::{CacheConfig, CacheStore};
use crate::http::interceptor::InterceptorChain;
use crate::http::scheduler::SchedulerConfig;
use crate::http::transport::{HttpTransport, Timeouts, Transport};
use crate::socket::tls::TlsConfig;
use crate::tls::pinning::PinStore;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Manager settings. Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Requests executing at once.
    pub max_concurrent_requests: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Priority added to a request each time it is retried.
    pub retry_priority_boost: u32,
    pub cache: CacheConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 4,
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            retry_priority_boost: 10,
            cache: CacheConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_json(json: &str) -> Result<Self, NetError> {
        serde_json::from_str(json).map_err(|e| {
            tracing::debug!(error = %e, "rejected manager config");
            NetError::InvalidArgument
        })
    }

    /// Timeouts for ordinary requests.
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            read: Some(Duration::from_secs(self.read_timeout_secs)),
            write: Some(Duration::from_secs(self.write_timeout_secs)),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent_requests,
            retry_boost: self.retry_priority_boost,
            timeouts: self.timeouts(),
        }
    }
}

/// Shared state for one manager.
#[derive(Clone)]
pub struct NetContext {
    config: ManagerConfig,
    tls: TlsConfig,
    pins: PinStore,
    interceptors: InterceptorChain,
    cache: Arc<CacheStore>,
    transport: Arc<dyn Transport>,
}

impl NetContext {
    /// Context using the built-in hyper transport.
    pub fn new(config: ManagerConfig) -> Self {
        let tls = TlsConfig::default();
        let pins = PinStore::new();
        let transport = Arc::new(HttpTransport::new(tls.clone(), pins.clone()));
        Self::with_transport(config, tls, pins, transport)
    }

    /// Context with a caller-supplied transport. `pins` should be the store
    /// the transport validates against, so pin changes reach it.
    pub fn with_transport(
        config: ManagerConfig,
        tls: TlsConfig,
        pins: PinStore,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let cache = Arc::new(CacheStore::new(config.cache.clone()));
        Self {
            config,
            tls,
            pins,
            interceptors: InterceptorChain::new(),
            cache,
            transport,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    pub fn pins(&self) -> &PinStore {
        &self.pins
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl Default for NetContext {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl std::fmt::Debug for NetContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetContext")
            .field("config", &self.config)
            .field("pinned_domains", &self.pins.len())
            .field("interceptors", &self.interceptors.len())
            .field("cached_entries", &self.cache.len())
            .finish()
    }
}
