//! Incremental server-sent-events framing.
//!
//! Bytes arrive in arbitrary chunks; [`SseParser::feed`] buffers partial lines
//! and returns every frame completed by the chunk. Lines end in `\n`, `\r\n`
//! or a lone `\r`. Field handling:
//!
//! - `event:` sets the name of the pending frame
//! - `data:` appends a line to the pending data (joined with `\n`)
//! - `id:` and `retry:` are accepted and ignored
//! - a line starting with `:` is a comment, surfaced as [`PushFrame::Comment`]
//! - a blank line dispatches the pending frame

use crate::{TransportError, TransportResult};

/// Largest line the parser buffers before giving up on the stream.
pub const MAX_LINE_BYTES: usize = 256 * 1024;

/// One unit received on a push subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    /// A dispatched event. `event` is `None` for default (unnamed) messages.
    Message {
        /// Event name.
        event: Option<String>,
        /// Data lines joined with `\n`.
        data: String,
    },
    /// Keep-alive comment line.
    Comment(String),
}

/// Line-oriented SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    /// Last chunk ended in `\r`; a leading `\n` in the next one is its pair.
    pending_cr: bool,
}

impl SseParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return the frames it completes.
    ///
    /// # Errors
    /// Returns `TransportError::BufferOverflow` when a single line exceeds
    /// [`MAX_LINE_BYTES`].
    pub fn feed(&mut self, chunk: &[u8]) -> TransportResult<Vec<PushFrame>> {
        let chunk = if self.pending_cr && !chunk.is_empty() {
            self.pending_cr = false;
            chunk.strip_prefix(b"\n").unwrap_or(chunk)
        } else {
            chunk
        };
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n' || b == b'\r') {
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            if line.pop() == Some(b'\r') {
                match self.buffer.first() {
                    Some(b'\n') => {
                        self.buffer.remove(0);
                    }
                    Some(_) => {}
                    None => self.pending_cr = true,
                }
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            let size = self.buffer.len();
            self.buffer.clear();
            return Err(TransportError::BufferOverflow {
                size,
                limit: MAX_LINE_BYTES,
            });
        }

        Ok(frames)
    }

    fn process_line(&mut self, line: &str) -> Option<PushFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(comment) = line.strip_prefix(':') {
            return Some(PushFrame::Comment(comment.trim().to_string()));
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => {
                let name = value.trim();
                self.event = (!name.is_empty()).then(|| name.to_string());
            }
            "data" => self.data.push(value.to_string()),
            "id" | "retry" => {}
            other => tracing::trace!(field = other, "ignoring unknown SSE field"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<PushFrame> {
        let event = self.event.take();
        if self.data.is_empty() && event.is_none() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(PushFrame::Message { event, data })
    }
}
