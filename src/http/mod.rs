pub mod descriptor;
pub mod diskcache;
pub mod httpcache;
pub mod interceptor;
pub mod multipart;
pub mod options;
pub mod requestbody;
pub mod response;
pub mod retry;
pub mod scheduler;
pub mod transport;

// Re-exports for convenience
pub use descriptor::{
    Backoff, CacheDirective, CachePolicy, Priority, RequestDescriptor, RetryDirective,
};
pub use httpcache::{CacheConfig, CacheEntry, CacheStore};
pub use interceptor::InterceptorChain;
pub use multipart::{MultipartForm, UploadProgress, UploadTracker};
pub use options::RequestOptions;
pub use requestbody::RequestBody;
pub use response::HttpResponse;
pub use scheduler::{JobId, RequestEvent, RequestScheduler, SchedulerConfig};
pub use transport::{HttpTransport, Timeouts, Transport, TransportRequest, TransportResponse};
