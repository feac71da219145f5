//! Background file transfers and multipart uploads.
//!
//! Both report through [`EventSink`](crate::base::events::EventSink)
//! callbacks and end with exactly one terminal event: complete, error or
//! cancelled.

mod multipart;
mod session;

pub use multipart::{MultipartUploadSession, UploadEvent};
pub use session::{
    part_path, ResumeData, TransferEvent, TransferOutcome, TransferSession, TransferState,
};
