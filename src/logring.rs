//! Bounded diagnostic log exposed to the preferences UI
//!
//! The speech client records one entry per request stage here so the user can
//! inspect what happened to their last few recordings without digging through
//! the process log. The ring holds the most recent 100 entries.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Maximum number of entries retained
pub const LOG_CAPACITY: usize = 100;

/// Entry severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// A single diagnostic entry
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub at: SystemTime,
    pub severity: Severity,
    pub message: String,
}

/// Shared, bounded ring of diagnostic entries.
///
/// Cheap to clone; all clones share the same buffer. Insertion is O(1)
/// amortized and never grows past [`LOG_CAPACITY`].
#[derive(Clone, Default)]
pub struct LogRing {
    inner: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl LogRing {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_CAPACITY))),
        }
    }

    fn push(&self, severity: Severity, message: String) {
        let mut buf = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if buf.len() == LOG_CAPACITY {
            buf.pop_front();
        }
        buf.push_back(LogEntry {
            at: SystemTime::now(),
            severity,
            message,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(Severity::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(Severity::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(Severity::Error, message.into());
    }

    /// Copy of the current entries, oldest first / newest last.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_in_insertion_order() {
        let ring = LogRing::new();
        ring.info("first");
        ring.warn("second");
        ring.error("third");

        let entries = ring.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[2].message, "third");
        assert_eq!(entries[1].severity, Severity::Warn);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let ring = LogRing::new();
        for i in 0..250 {
            ring.info(format!("entry {i}"));
        }

        let entries = ring.snapshot();
        assert_eq!(entries.len(), LOG_CAPACITY);
        // Oldest entries were evicted; newest is last.
        assert_eq!(entries[0].message, "entry 150");
        assert_eq!(entries[LOG_CAPACITY - 1].message, "entry 249");
    }

    #[test]
    fn test_clones_share_buffer() {
        let ring = LogRing::new();
        let other = ring.clone();
        ring.info("from original");
        other.info("from clone");

        assert_eq!(ring.len(), 2);
        assert_eq!(other.len(), 2);
    }
}
