//! Multipart form data support.
//!
//! Provides RFC 2046 multipart/form-data encoding for uploads, plus the
//! byte-offset layout needed to attribute upload progress to individual files.
//!
//! # Example
//! ```ignore
//! use netmanager::http::multipart::MultipartForm;
//!
//! let form = MultipartForm::new()
//!     .text("username", "user123")
//!     .file("avatar", "me.png", "image/png", png_bytes);
//! let encoded = form.encode();
//! ```

use crate::base::events::Progress;
use bytes::{BufMut, Bytes, BytesMut};
use std::borrow::Cow;

/// One form field.
#[derive(Debug, Clone)]
pub enum MultipartField {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        filename: String,
        mime_type: String,
        data: Bytes,
    },
}

/// A multipart form for uploads.
#[derive(Debug, Clone)]
pub struct MultipartForm {
    boundary: String,
    fields: Vec<MultipartField>,
}

impl Default for MultipartForm {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartForm {
    /// Create a new empty form.
    pub fn new() -> Self {
        Self {
            boundary: generate_boundary(),
            fields: Vec::new(),
        }
    }

    /// Get the boundary string.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Add a text field.
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(MultipartField::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// Add a file field.
    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.fields.push(MultipartField::File {
            name: name.into(),
            filename: filename.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        });
        self
    }

    pub fn fields(&self) -> &[MultipartField] {
        &self.fields
    }

    /// Get the Content-Type header value.
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Encode the form, recording where each file's payload sits in the body.
    pub fn encode(&self) -> EncodedForm {
        let mut output = BytesMut::new();
        let mut files = Vec::new();

        for field in &self.fields {
            output.put_slice(b"--");
            output.put_slice(self.boundary.as_bytes());
            output.put_slice(b"\r\n");
            output.put_slice(format_headers(field).as_bytes());
            output.put_slice(b"\r\n\r\n");

            match field {
                MultipartField::Text { value, .. } => output.put_slice(value.as_bytes()),
                MultipartField::File { filename, data, .. } => {
                    files.push(FileSpan {
                        filename: filename.clone(),
                        offset: output.len() as u64,
                        size: data.len() as u64,
                    });
                    output.put_slice(data);
                }
            }
            output.put_slice(b"\r\n");
        }

        output.put_slice(b"--");
        output.put_slice(self.boundary.as_bytes());
        output.put_slice(b"--\r\n");

        EncodedForm {
            body: output.freeze(),
            content_type: self.content_type(),
            files,
        }
    }
}

/// Location of one file's payload inside the encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub filename: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct EncodedForm {
    pub body: Bytes,
    pub content_type: String,
    pub files: Vec<FileSpan>,
}

impl EncodedForm {
    pub fn tracker(&self) -> UploadTracker {
        UploadTracker::new(self.files.clone(), self.body.len() as u64)
    }
}

/// Per-file share of an upload progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct FileProgress {
    pub filename: String,
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadProgress {
    pub progress: Progress,
    /// The file whose payload range contains the bytes sent so far.
    pub current_file: Option<FileProgress>,
}

/// Turns raw byte counts into overall and per-file upload progress.
#[derive(Debug, Clone)]
pub struct UploadTracker {
    files: Vec<FileSpan>,
    total: u64,
    sent: u64,
}

impl UploadTracker {
    pub fn new(files: Vec<FileSpan>, total: u64) -> Self {
        Self {
            files,
            total,
            sent: 0,
        }
    }

    /// Record `bytes` more sent and report the new position.
    pub fn advance(&mut self, bytes: u64) -> UploadProgress {
        self.sent = (self.sent + bytes).min(self.total);
        let sent = self.sent;
        let current_file = self
            .files
            .iter()
            .find(|span| span.offset <= sent && sent < span.offset + span.size)
            .map(|span| FileProgress {
                filename: span.filename.clone(),
                fraction: ((sent - span.offset) as f64 / span.size as f64).clamp(0.0, 1.0),
            });
        UploadProgress {
            progress: Progress::new(sent, self.total),
            current_file,
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

fn format_headers(field: &MultipartField) -> String {
    match field {
        MultipartField::Text { name, .. } => {
            format!(
                "Content-Disposition: form-data; name=\"{}\"",
                escape_quotes(name)
            )
        }
        MultipartField::File {
            name,
            filename,
            mime_type,
            ..
        } => format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}",
            escape_quotes(name),
            escape_quotes(filename),
            mime_type
        ),
    }
}

/// Escape quotes and backslashes in a string.
fn escape_quotes(s: &str) -> Cow<'_, str> {
    if s.contains('"') || s.contains('\\') || s.contains('\r') || s.contains('\n') {
        Cow::Owned(
            s.replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\r', "\\r")
                .replace('\n', "\\n"),
        )
    } else {
        Cow::Borrowed(s)
    }
}

fn generate_boundary() -> String {
    format!("----netmanager-boundary-{}", uuid::Uuid::new_v4().simple())
}
