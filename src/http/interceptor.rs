//! Request and response interceptors.
//!
//! Request interceptors fold over the descriptor in registration order: each
//! receives the previous stage's output and returns the next descriptor.
//! Response interceptors either transform the response or only observe it.

use crate::base::events::lock;
use crate::http::descriptor::RequestDescriptor;
use crate::http::response::HttpResponse;
use std::sync::{Arc, Mutex};

pub type RequestInterceptor = Arc<dyn Fn(RequestDescriptor) -> RequestDescriptor + Send + Sync>;

#[derive(Clone)]
pub enum ResponseInterceptor {
    Transform(Arc<dyn Fn(HttpResponse) -> HttpResponse + Send + Sync>),
    Observe(Arc<dyn Fn(&HttpResponse) + Send + Sync>),
}

#[derive(Default)]
struct Chains {
    request: Vec<RequestInterceptor>,
    response: Vec<ResponseInterceptor>,
}

/// Ordered interceptor lists shared by every job of one context.
///
/// Registration may happen while requests are in flight; each application
/// works on a snapshot taken when it starts.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    chains: Arc<Mutex<Chains>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request<F>(&self, f: F)
    where
        F: Fn(RequestDescriptor) -> RequestDescriptor + Send + Sync + 'static,
    {
        lock(&self.chains).request.push(Arc::new(f));
    }

    pub fn add_response<F>(&self, f: F)
    where
        F: Fn(HttpResponse) -> HttpResponse + Send + Sync + 'static,
    {
        lock(&self.chains)
            .response
            .push(ResponseInterceptor::Transform(Arc::new(f)));
    }

    pub fn add_response_observer<F>(&self, f: F)
    where
        F: Fn(&HttpResponse) + Send + Sync + 'static,
    {
        lock(&self.chains)
            .response
            .push(ResponseInterceptor::Observe(Arc::new(f)));
    }

    /// Remove every interceptor.
    pub fn clear(&self) {
        let mut chains = lock(&self.chains);
        chains.request.clear();
        chains.response.clear();
    }

    pub fn len(&self) -> usize {
        let chains = lock(&self.chains);
        chains.request.len() + chains.response.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn apply_request(&self, descriptor: RequestDescriptor) -> RequestDescriptor {
        let snapshot = lock(&self.chains).request.clone();
        snapshot
            .iter()
            .fold(descriptor, |current, interceptor| interceptor(current))
    }

    pub fn apply_response(&self, response: HttpResponse) -> HttpResponse {
        let snapshot = lock(&self.chains).response.clone();
        snapshot
            .iter()
            .fold(response, |current, interceptor| match interceptor {
                ResponseInterceptor::Transform(f) => f(current),
                ResponseInterceptor::Observe(f) => {
                    f(&current);
                    current
                }
            })
    }
}
