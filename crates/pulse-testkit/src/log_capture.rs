//! In-memory JSON log capture for asserting on emitted tracing events.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;

/// Collects JSON-formatted log lines written while installed.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install as the thread-default subscriber until the guard drops.
    #[must_use]
    pub fn install(&self, filter: &str) -> tracing::subscriber::DefaultGuard {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(self.clone())
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .with_current_span(false)
            .flatten_event(true);

        let subscriber = tracing_subscriber::registry()
            .with(EnvFilter::new(filter))
            .with(layer);
        tracing::subscriber::set_default(subscriber)
    }

    /// Raw JSON lines.
    #[must_use]
    pub fn jsonl(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).to_string()
    }

    /// Parsed records; unparsable lines are skipped.
    #[must_use]
    pub fn records(&self) -> Vec<Value> {
        self.jsonl()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    /// Records whose `message` equals `message`.
    #[must_use]
    pub fn with_message(&self, message: &str) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter(|r| r.get("message").and_then(Value::as_str) == Some(message))
            .collect()
    }

    /// True if any record's message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.records().iter().any(|r| {
            r.get("message")
                .and_then(Value::as_str)
                .is_some_and(|m| m.contains(needle))
        })
    }
}

/// Writer half handed to the fmt layer.
#[derive(Debug)]
pub struct LogCaptureWriter {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            bytes: Arc::clone(&self.bytes),
        }
    }
}
