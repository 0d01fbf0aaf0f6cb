use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;

use kubepanel_types::{ArcLogLine, LogLine, StreamError};

/// Default number of retained lines per session
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Bounded FIFO of the most recent log lines
///
/// Cloning yields another handle to the same storage; the owning session
/// shares it with its flush task and nothing else.
#[derive(Clone)]
pub struct LogBuffer {
    /// Internal storage - Arc<LogLine> keeps snapshots cheap
    entries: Arc<RwLock<VecDeque<ArcLogLine>>>,

    /// Maximum capacity
    capacity: usize,
}

impl LogBuffer {
    /// Create a new log buffer; zero capacity is a configuration error
    pub fn new(capacity: usize) -> Result<Self, StreamError> {
        if capacity == 0 {
            return Err(StreamError::Configuration(
                "log buffer capacity must be positive".to_string(),
            ));
        }

        Ok(Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        })
    }

    /// Append one line, evicting the oldest if over capacity
    pub fn append(&self, line: LogLine) {
        let mut entries = self.entries.write();
        entries.push_back(Arc::new(line));
        Self::evict_excess(&mut entries, self.capacity);
    }

    /// Append a batch of lines with a single eviction pass
    pub fn extend<I>(&self, lines: I)
    where
        I: IntoIterator<Item = LogLine>,
    {
        let mut entries = self.entries.write();
        entries.extend(lines.into_iter().map(Arc::new));
        Self::evict_excess(&mut entries, self.capacity);
    }

    fn evict_excess(entries: &mut VecDeque<ArcLogLine>, capacity: usize) {
        let excess = entries.len().saturating_sub(capacity);
        if excess > 0 {
            entries.drain(..excess);
        }
    }

    /// All retained lines in arrival order
    pub fn snapshot(&self) -> Vec<ArcLogLine> {
        self.entries.read().iter().cloned().collect()
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the last N entries
    pub fn tail(&self, n: usize) -> Vec<ArcLogLine> {
        let entries = self.entries.read();
        let start = entries.len().saturating_sub(n);
        entries.iter().skip(start).cloned().collect()
    }

    /// Get entries in a range (for virtual scrolling)
    pub fn range(&self, start: usize, count: usize) -> Vec<ArcLogLine> {
        let entries = self.entries.read();
        entries.iter().skip(start).take(count).cloned().collect()
    }

    /// Export all entries as raw lines
    pub fn export_raw(&self) -> String {
        self.entries
            .read()
            .iter()
            .map(|e| e.raw.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}
