//! Shared types for kubepanel
//!
//! This crate contains the data model used across the kubepanel crates and
//! the narrow contracts for the collaborators the core talks to: the log
//! source, the panel render surface, and the preferences store.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// Stream Targets
// ============================================================================

/// Which container(s) of a pod to stream
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum ContainerSelector {
    /// Every container in the pod, merged
    #[default]
    All,
    /// A single named container
    Named(String),
}

impl ContainerSelector {
    /// Container name, if a single container is selected
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Named(name) => Some(name),
        }
    }
}

impl fmt::Display for ContainerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// The pod/container a log session is pointed at
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub context: String,
    pub namespace: String,
    pub pod: String,
    pub container: ContainerSelector,
}

impl StreamTarget {
    pub fn new(
        context: impl Into<String>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            namespace: namespace.into(),
            pod: pod.into(),
            container: ContainerSelector::All,
        }
    }

    /// Narrow the target to a single container
    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = ContainerSelector::Named(container.into());
        self
    }

    /// Reject targets that can never resolve to a pod
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.context.trim().is_empty() {
            return Err(StreamError::Configuration(
                "cluster context must not be empty".to_string(),
            ));
        }
        if self.namespace.trim().is_empty() {
            return Err(StreamError::Configuration(format!(
                "namespace must not be empty for pod '{}'",
                self.pod
            )));
        }
        if self.pod.trim().is_empty() {
            return Err(StreamError::Configuration(
                "pod name must not be empty".to_string(),
            ));
        }
        if let ContainerSelector::Named(name) = &self.container {
            if name.trim().is_empty() {
                return Err(StreamError::Configuration(format!(
                    "container name must not be empty for pod '{}'",
                    self.pod
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.pod)?;
        if let ContainerSelector::Named(name) = &self.container {
            write!(f, "/{}", name)?;
        }
        Ok(())
    }
}

/// How a log stream is opened
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOptions {
    /// Keep streaming new lines (vs. a one-shot tail)
    pub follow: bool,

    /// Number of historical lines to request (None = everything)
    pub tail_lines: Option<i64>,

    /// Ask the source to prefix each line with its RFC3339 timestamp
    pub timestamps: bool,

    /// Read the previous container instance's logs
    pub previous: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&DisplayPreferences::default())
    }
}

impl From<&DisplayPreferences> for StreamOptions {
    fn from(prefs: &DisplayPreferences) -> Self {
        Self {
            follow: prefs.follow,
            tail_lines: (prefs.line_limit > 0).then_some(prefs.line_limit),
            timestamps: prefs.timestamps,
            previous: prefs.show_previous,
        }
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// A single log record
#[derive(Clone, Debug, PartialEq)]
pub struct LogLine {
    /// Arrival sequence number within the session
    pub seq: u64,

    /// Original raw line as received from the source
    pub raw: String,

    /// Line content with timestamp and container prefix stripped
    pub text: String,

    /// Parsed timestamp (if available)
    pub timestamp: Option<DateTime<Utc>>,

    /// Source container tag (when streaming several containers)
    pub container: Option<String>,
}

impl LogLine {
    /// Create a log line with no parsed metadata
    pub fn new(seq: u64, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            seq,
            text: raw.clone(),
            raw,
            timestamp: None,
            container: None,
        }
    }
}

/// Shared handle to an immutable log line
pub type ArcLogLine = Arc<LogLine>;

/// Stream status as reported to the render surface
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Connected,
    Disconnected,
    Error,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

// ============================================================================
// Panel Events
// ============================================================================

/// Messages posted from a session to its panel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PanelEvent {
    /// A batch of new lines, in arrival order
    LogData { lines: Vec<String> },
    /// Connection status change
    StreamStatus { status: StreamStatus },
    /// A failure the user should see
    Error { message: String },
}

impl PanelEvent {
    pub fn status(status: StreamStatus) -> Self {
        Self::StreamStatus { status }
    }

    pub fn error(err: &StreamError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

// ============================================================================
// Preferences
// ============================================================================

/// Per-cluster-context display preferences for the log panel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayPreferences {
    pub follow: bool,
    pub timestamps: bool,
    /// Historical lines to request on start (0 = no limit)
    pub line_limit: i64,
    pub show_previous: bool,
}

impl Default for DisplayPreferences {
    fn default() -> Self {
        Self {
            follow: true,
            timestamps: false,
            line_limit: 100,
            show_previous: false,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Failures of the log streaming core
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Target unreachable or not found; never retried automatically
    #[error("cannot reach {target}: {reason}")]
    Connection { target: String, reason: String },

    /// Access denied; never retried automatically
    #[error("access denied to {target}: {reason}")]
    Permission { target: String, reason: String },

    /// Transient interruption of an established stream
    #[error("log stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Invalid capacity, interval or target
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Operation on a session that has already been disposed
    #[error("log session has been disposed")]
    Disposed,
}

impl StreamError {
    pub fn connection(target: &StreamTarget, reason: impl Into<String>) -> Self {
        Self::Connection {
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    pub fn permission(target: &StreamTarget, reason: impl Into<String>) -> Self {
        Self::Permission {
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the session may recover from this error on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StreamInterrupted(_))
    }
}

/// Failures persisting display preferences
#[derive(Debug, thiserror::Error)]
pub enum PreferencesError {
    #[error("failed to write preferences: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode preferences: {0}")]
    Encode(String),
}

// ============================================================================
// Collaborator Contracts
// ============================================================================

/// An open log stream. Dropping it force-closes the underlying connection.
pub struct LogConnection {
    lines: BoxStream<'static, Result<String, StreamError>>,
    pump: Option<JoinHandle<()>>,
}

impl LogConnection {
    /// Wrap a stream of raw lines
    pub fn new<S>(lines: S) -> Self
    where
        S: futures::Stream<Item = Result<String, StreamError>> + Send + 'static,
    {
        Self {
            lines: lines.boxed(),
            pump: None,
        }
    }

    /// Wrap a channel fed by a background task; the task is aborted on destroy
    pub fn from_channel(
        rx: mpsc::Receiver<Result<String, StreamError>>,
        pump: JoinHandle<()>,
    ) -> Self {
        let lines = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Self {
            lines: lines.boxed(),
            pump: Some(pump),
        }
    }

    /// Poll for the next raw line; `None` means the source closed the stream
    pub fn poll_next_line(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<String, StreamError>>> {
        self.lines.poll_next_unpin(cx)
    }

    /// Force-close the connection
    pub fn destroy(self) {}
}

impl Drop for LogConnection {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl fmt::Debug for LogConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogConnection")
            .field("pumped", &self.pump.is_some())
            .finish()
    }
}

/// Something that can open a log stream for a pod/container
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn open(
        &self,
        target: &StreamTarget,
        options: &StreamOptions,
    ) -> Result<LogConnection, StreamError>;
}

/// A render surface bound to one cluster context
pub trait Panel: Send + Sync {
    /// Fire-and-forget delivery; there is no backpressure signal
    fn post_message(&self, event: PanelEvent);

    /// Bring the panel to the foreground
    fn reveal(&self);

    /// Release the panel's host resources
    fn dispose(&self);
}

/// Creates panels for newly opened cluster contexts
pub trait PanelFactory: Send + Sync {
    fn create_panel(&self, context: &str) -> Arc<dyn Panel>;
}

/// Per-cluster-context preference persistence
pub trait PreferencesStore: Send + Sync {
    /// Stored preferences for a context, or defaults
    fn load(&self, context: &str) -> DisplayPreferences;

    fn save(&self, context: &str, prefs: &DisplayPreferences) -> Result<(), PreferencesError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panel_event_wire_shape() {
        let data = PanelEvent::LogData {
            lines: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            serde_json::to_string(&data).unwrap(),
            r#"{"type":"logData","lines":["a","b"]}"#
        );

        let status = PanelEvent::status(StreamStatus::Disconnected);
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"type":"streamStatus","status":"disconnected"}"#
        );

        let err = PanelEvent::Error {
            message: "boom".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"type":"error","message":"boom"}"#
        );
    }

    #[test]
    fn test_target_validation() {
        assert!(StreamTarget::new("ctx", "default", "web-0").validate().is_ok());
        assert!(matches!(
            StreamTarget::new("ctx", "default", "").validate(),
            Err(StreamError::Configuration(_))
        ));
        assert!(matches!(
            StreamTarget::new("", "default", "web-0").validate(),
            Err(StreamError::Configuration(_))
        ));
        assert!(matches!(
            StreamTarget::new("ctx", "default", "web-0")
                .with_container(" ")
                .validate(),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn test_target_display() {
        let target = StreamTarget::new("ctx", "prod", "api-7f9c").with_container("sidecar");
        assert_eq!(target.to_string(), "prod/api-7f9c/sidecar");
        assert_eq!(
            StreamTarget::new("ctx", "prod", "api-7f9c").to_string(),
            "prod/api-7f9c"
        );
    }

    #[test]
    fn test_options_from_preferences() {
        let mut prefs = DisplayPreferences::default();
        let options = StreamOptions::from(&prefs);
        assert!(options.follow);
        assert_eq!(options.tail_lines, Some(100));

        prefs.line_limit = 0;
        prefs.show_previous = true;
        let options = StreamOptions::from(&prefs);
        assert_eq!(options.tail_lines, None);
        assert!(options.previous);
    }

    #[test]
    fn test_only_interruptions_are_retryable() {
        let target = StreamTarget::new("ctx", "default", "web-0");
        assert!(StreamError::StreamInterrupted("eof".to_string()).is_retryable());
        assert!(!StreamError::connection(&target, "not found").is_retryable());
        assert!(!StreamError::permission(&target, "forbidden").is_retryable());
        assert!(!StreamError::Configuration("x".to_string()).is_retryable());
    }
}
