//! Request body for POST/PUT operations.

use crate::base::neterror::NetError;
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use http_body::Frame;
use std::pin::Pin;

/// Stream of body chunks, used for both directions.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, NetError>> + Send>>;

/// Chunk size used when slicing an in-memory body for progress reporting.
pub const UPLOAD_CHUNK_SIZE: usize = 16 * 1024;

/// Request body for HTTP methods that send data.
#[derive(Default)]
pub enum RequestBody {
    /// No body (GET, HEAD, DELETE).
    #[default]
    Empty,
    /// Body with raw bytes.
    Bytes(Bytes),
    /// Body produced incrementally. `length` is sent as Content-Length when known.
    Stream {
        stream: BodyStream,
        length: Option<u64>,
    },
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            RequestBody::Stream { length, .. } => {
                f.debug_struct("Stream").field("length", length).finish()
            }
        }
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        RequestBody::Bytes(Bytes::from(s))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(v: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(v))
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        RequestBody::Bytes(Bytes::from(s.to_owned()))
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        RequestBody::Bytes(b)
    }
}

impl From<Option<Bytes>> for RequestBody {
    fn from(b: Option<Bytes>) -> Self {
        b.map_or(RequestBody::Empty, RequestBody::Bytes)
    }
}

impl RequestBody {
    /// Serve `data` in fixed-size slices, calling `on_chunk` with each slice
    /// length as the transport pulls it off the stream.
    pub fn chunked<F>(data: Bytes, on_chunk: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let length = data.len() as u64;
        let mut offset = 0;
        let mut slices = Vec::with_capacity(data.len() / UPLOAD_CHUNK_SIZE + 1);
        while offset < data.len() {
            let end = (offset + UPLOAD_CHUNK_SIZE).min(data.len());
            slices.push(data.slice(offset..end));
            offset = end;
        }
        let stream = stream::iter(slices).map(move |chunk| {
            on_chunk(chunk.len());
            Ok(chunk)
        });
        RequestBody::Stream {
            stream: Box::pin(stream),
            length: Some(length),
        }
    }

    /// Check if the body is empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }

    /// Length in bytes, if known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Bytes(b) => Some(b.len() as u64),
            RequestBody::Stream { length, .. } => *length,
        }
    }

    /// Convert into a body hyper can send.
    pub fn into_http_body(self) -> UnsyncBoxBody<Bytes, NetError> {
        match self {
            RequestBody::Empty => Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed_unsync(),
            RequestBody::Bytes(b) => Full::new(b).map_err(|never| match never {}).boxed_unsync(),
            RequestBody::Stream { stream, .. } => {
                StreamBody::new(stream.map(|chunk| chunk.map(Frame::data))).boxed_unsync()
            }
        }
    }
}
