//! Component-tagged diagnostics.
//!
//! Every scheduling decision (merge started/finished, stall begin/end, flush
//! triggered) is reported through an [`InfoStream`]. Components use short
//! tags: `MS` for the merge scheduler, `TP`/`LMP` for the merge policies,
//! `FP` for the flush policy, `DWFC` for flush control, `DWSC` for stall
//! control and `IW` for the writer.

use std::fmt::Debug;

use parking_lot::Mutex;

/// Sink for diagnostic messages.
pub trait InfoStream: Send + Sync + Debug {
    /// Returns true if messages for the given component should be produced.
    fn is_enabled(&self, component: &str) -> bool;

    /// Emit a message for the given component.
    fn message(&self, component: &str, message: &str);
}

/// Forwards messages to the `log` facade at debug level.
///
/// The log target is `sluice::<component>`, so `RUST_LOG=sluice::MS=debug`
/// narrows output to the merge scheduler.
#[derive(Debug, Clone, Default)]
pub struct LoggingInfoStream;

impl InfoStream for LoggingInfoStream {
    fn is_enabled(&self, component: &str) -> bool {
        log::log_enabled!(target: &format!("sluice::{component}"), log::Level::Debug)
    }

    fn message(&self, component: &str, message: &str) {
        log::debug!(target: &format!("sluice::{component}"), "{message}");
    }
}

/// Drops every message.
#[derive(Debug, Clone, Default)]
pub struct NoOutputInfoStream;

impl InfoStream for NoOutputInfoStream {
    fn is_enabled(&self, _component: &str) -> bool {
        false
    }

    fn message(&self, _component: &str, _message: &str) {}
}

/// Keeps every message in memory; used by tests to assert on decisions.
#[derive(Debug, Default)]
pub struct RecordingInfoStream {
    messages: Mutex<Vec<(String, String)>>,
}

impl RecordingInfoStream {
    /// Create an empty recording stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded `(component, message)` pairs in emission order.
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }

    /// Recorded messages of one component.
    pub fn messages_for(&self, component: &str) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(c, _)| c == component)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Returns true if any message of `component` contains `needle`.
    pub fn contains(&self, component: &str, needle: &str) -> bool {
        self.messages
            .lock()
            .iter()
            .any(|(c, m)| c == component && m.contains(needle))
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}

impl InfoStream for RecordingInfoStream {
    fn is_enabled(&self, _component: &str) -> bool {
        true
    }

    fn message(&self, component: &str, message: &str) {
        self.messages
            .lock()
            .push((component.to_string(), message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_stream_filters_by_component() {
        let stream = RecordingInfoStream::new();
        stream.message("MS", "merge thread started");
        stream.message("FP", "flush triggered");
        stream.message("MS", "merge thread finished");

        assert_eq!(stream.messages().len(), 3);
        assert_eq!(stream.messages_for("MS").len(), 2);
        assert!(stream.contains("FP", "flush"));
        assert!(!stream.contains("FP", "merge"));

        stream.clear();
        assert!(stream.messages().is_empty());
    }

    #[test]
    fn test_no_output_stream_is_disabled() {
        let stream = NoOutputInfoStream;
        assert!(!stream.is_enabled("MS"));
        stream.message("MS", "ignored");
    }
}
