//! Event and trace sink.
//!
//! Events are the operator-facing journal (a camera was added, a file was
//! transferred, a day was deleted).  Traces record failures worth looking
//! at but not acted upon.  Neither can fail or block the caller.

use tracing::{info, warn};

pub trait EventSink: Send + Sync {
    fn event(&self, category: &str, subject: &str, verb: &str, detail: &str);
    fn trace(&self, subject: &str, detail: &str);
}

/// Writes events and traces as structured `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, category: &str, subject: &str, verb: &str, detail: &str) {
        info!(target: "vigil::event", category, subject, verb, "{detail}");
    }

    fn trace(&self, subject: &str, detail: &str) {
        warn!(target: "vigil::trace", subject, "{detail}");
    }
}

#[cfg(test)]
pub use memory::MemorySink;
