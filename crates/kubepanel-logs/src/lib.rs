//! Log processing for kubepanel
//!
//! This crate provides the bounded log buffer, the per-panel streaming
//! session with batched delivery and reconnects, and the registry that
//! keeps one panel per cluster context.

mod buffer;
mod parser;
mod preferences;
mod registry;
mod retry;
mod session;

#[cfg(test)]
mod testing;

pub use buffer::{DEFAULT_BUFFER_CAPACITY, LogBuffer};
pub use parser::LogParser;
pub use preferences::{MemoryPreferencesStore, TomlPreferencesStore};
pub use registry::PanelRegistry;
pub use retry::RetryPolicy;
pub use session::{DEFAULT_FLUSH_INTERVAL, LogStreamSession, SessionConfig, SessionState};

// Re-export types used in our public API
pub use kubepanel_types::{
    DisplayPreferences, LogLine, LogSource, Panel, PanelEvent, PanelFactory, PreferencesStore,
    StreamError, StreamOptions, StreamStatus, StreamTarget,
};
