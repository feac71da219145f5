//! Incremental Server-Sent Events framing.
//!
//! Bytes are appended to a buffer as they arrive. Every blank line closes a
//! record; complete records are decoded and removed, partial ones wait for
//! more input. [`SseDecoder::finish`] pushes a trailing record without its
//! blank line through the same decoding once.

use bytes::{Buf, BytesMut};

pub const DEFAULT_EVENT_TYPE: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: String,
    /// `data:` lines of the record, joined with `\n`.
    pub data: String,
}

impl SseEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
        }
    }

    pub fn is_message(&self) -> bool {
        self.event_type == DEFAULT_EVENT_TYPE
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every record it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some((end, delimiter)) = find_delimiter(&self.buffer) {
            let record = self.buffer.split_to(end);
            self.buffer.advance(delimiter);
            if let Some(event) = decode_record(&record) {
                events.push(event);
            }
        }
        events
    }

    /// End of input: decode whatever is left as a final record.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let rest = self.buffer.split();
        decode_record(&rest).into_iter().collect()
    }

    /// Bytes held back waiting for a record terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Position of the first blank line: `(record_end, delimiter_len)`.
/// Accepts `\n\n` and `\n\r\n`, so CRLF streams frame the same way.
fn find_delimiter(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' {
            if buf[i + 1] == b'\n' {
                return Some((i, 2));
            }
            if buf[i + 1] == b'\r' && buf.get(i + 2) == Some(&b'\n') {
                return Some((i, 3));
            }
        }
        i += 1;
    }
    None
}

fn decode_record(record: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(record);
    let mut event_type: Option<&str> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data.push(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim();
            if !value.is_empty() {
                event_type = Some(value);
            }
        }
    }

    let data = data.join("\n");
    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event_type: event_type.unwrap_or(DEFAULT_EVENT_TYPE).to_string(),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_records_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert_eq!(
            decoder.feed(b"data: hello\n\n"),
            vec![SseEvent::new("message", "hello")]
        );
        assert_eq!(
            decoder.feed(b"event: custom\ndata: world\n\n"),
            vec![SseEvent::new("custom", "world")]
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_record_split_mid_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"da").is_empty());
        assert!(decoder.feed(b"ta: par").is_empty());
        assert!(decoder.feed(b"tial\n").is_empty());
        assert_eq!(decoder.feed(b"\n"), vec![SseEvent::new("message", "partial")]);
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\ndata: line one\ndata: line two\nid: 7\n\n");
        assert_eq!(events, vec![SseEvent::new("message", "line one\nline two")]);
    }

    #[test]
    fn test_records_without_data_are_skipped() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": ping\n\nevent: empty\n\ndata: x\n\n");
        assert_eq!(events, vec![SseEvent::new("message", "x")]);
    }

    #[test]
    fn test_crlf_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: update\r\ndata: 42\r\n\r\n");
        assert_eq!(events, vec![SseEvent::new("update", "42")]);
    }

    #[test]
    fn test_finish_flushes_unterminated_record_once() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), vec![SseEvent::new("message", "tail")]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_several_records_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"data: a\n\ndata: b\n\ndata: c");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, "b");
        assert_eq!(decoder.finish(), vec![SseEvent::new("message", "c")]);
    }
}
