//! Destinations for demultiplexed child output lines.

use std::sync::{Mutex, PoisonError};

/// Receives child output lines and per-process lifecycle lines.
///
/// The engine never formats or timestamps anything: lines arrive exactly as
/// the child wrote them. Stdout lines land on [`LineSink::debug`], stderr
/// lines on [`LineSink::warn`], and each completed process contributes a
/// single [`LineSink::info`] line.
pub trait LineSink: Send + Sync {
    /// A stdout line from a child.
    fn debug(&self, line: &str);
    /// A stderr line from a child.
    fn warn(&self, line: &str);
    /// A lifecycle line (one per completed process).
    fn info(&self, line: &str);
}

/// Discards every line. The default sink for callers that only care about
/// the aggregated failure report.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopSink;

impl LineSink for NopSink {
    fn debug(&self, _line: &str) {}
    fn warn(&self, _line: &str) {}
    fn info(&self, _line: &str) {}
}

/// Forwards each line to the matching [`tracing`] macro.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn debug(&self, line: &str) {
        tracing::debug!("{line}");
    }

    fn warn(&self, line: &str) {
        tracing::warn!("{line}");
    }

    fn info(&self, line: &str) {
        tracing::info!("{line}");
    }
}

/// Severity attached to a line captured by [`MemorySink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkLevel {
    /// Child stdout.
    Debug,
    /// Child stderr.
    Warn,
    /// Process lifecycle.
    Info,
}

/// Captures lines in memory, in arrival order.
///
/// Useful for collecting child output programmatically instead of logging
/// it; also the assertion surface for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    captured: Mutex<Vec<(SinkLevel, String)>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything captured so far.
    pub fn lines(&self) -> Vec<(SinkLevel, String)> {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Captured lines at one severity, in arrival order.
    pub fn lines_at(&self, level: SinkLevel) -> Vec<String> {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, line)| line.clone())
            .collect()
    }

    fn push(&self, level: SinkLevel, line: &str) {
        self.captured
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, line.to_owned()));
    }
}

impl LineSink for MemorySink {
    fn debug(&self, line: &str) {
        self.push(SinkLevel::Debug, line);
    }

    fn warn(&self, line: &str) {
        self.push(SinkLevel::Warn, line);
    }

    fn info(&self, line: &str) {
        self.push(SinkLevel::Info, line);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_preserves_arrival_order_and_severity() {
        let sink = MemorySink::new();
        sink.debug("out one");
        sink.warn("err one");
        sink.debug("out two");
        sink.info("finished");

        assert_eq!(
            sink.lines(),
            vec![
                (SinkLevel::Debug, "out one".to_owned()),
                (SinkLevel::Warn, "err one".to_owned()),
                (SinkLevel::Debug, "out two".to_owned()),
                (SinkLevel::Info, "finished".to_owned()),
            ]
        );
        assert_eq!(sink.lines_at(SinkLevel::Debug), vec!["out one", "out two"]);
        assert_eq!(sink.lines_at(SinkLevel::Warn), vec!["err one"]);
    }
}
