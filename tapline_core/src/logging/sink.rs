//! Injected message sink for tunnel events.
//!
//! The engine never reaches for global state to report what it is doing:
//! callers hand it a [`LogSink`] and every event is delivered there as one
//! human-readable line. The same event is also emitted through `tracing` at
//! the matching level, so a configured subscriber sees it too.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Receiver of single-line, human-readable event messages.
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str);
}

impl<F> LogSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn log(&self, message: &str) {
        self(message)
    }
}

/// Sink that keeps every message in memory, for UIs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all messages received so far.
    pub fn messages(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True if any message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|line| line.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, message: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }
}

/// Cheaply cloneable handle used by tunnel components to report events.
#[derive(Clone, Default)]
pub struct EventLog {
    sink: Option<Arc<dyn LogSink>>,
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("sink", &self.sink.as_ref().map(|_| "[LogSink]"))
            .finish()
    }
}

impl EventLog {
    /// Deliver events to `sink` as well as to `tracing`.
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        EventLog { sink: Some(sink) }
    }

    /// Emit events through `tracing` only.
    pub fn silent() -> Self {
        EventLog { sink: None }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!("{}", message);
        self.forward(message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!("{}", message);
        self.forward(message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!("{}", message);
        self.forward(message);
    }

    /// Debug events stay in `tracing`; the sink only sees operator-level news.
    pub fn debug(&self, message: impl AsRef<str>) {
        tracing::debug!("{}", message.as_ref());
    }

    fn forward(&self, message: &str) {
        if let Some(sink) = &self.sink {
            sink.log(message);
        }
    }
}
