use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kubepanel_types::{
    ArcLogLine, LogConnection, LogLine, LogSource, Panel, PanelEvent, StreamError, StreamOptions,
    StreamStatus, StreamTarget,
};

use crate::buffer::{DEFAULT_BUFFER_CAPACITY, LogBuffer};
use crate::parser::LogParser;
use crate::retry::RetryPolicy;

/// Default cadence at which pending lines are delivered to the panel
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Tunables for one log session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum retained lines
    pub buffer_capacity: usize,

    /// Delivery cadence
    pub flush_interval: Duration,

    /// Reconnect policy for interrupted follow streams
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.buffer_capacity == 0 {
            return Err(StreamError::Configuration(
                "log buffer capacity must be positive".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(StreamError::Configuration(
                "flush interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a log session
///
/// `Idle -> Connecting -> Connected -> (Disconnected -> Connecting)* -> Connected | Error`.
/// `Stopped` follows an explicit stop or a completed one-shot tail;
/// `Disposed` is final.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Error,
    Stopped,
    Disposed,
}

impl SessionState {
    /// Status reported to the panel for this state, if any
    pub fn status(self) -> Option<StreamStatus> {
        match self {
            Self::Connected => Some(StreamStatus::Connected),
            Self::Disconnected => Some(StreamStatus::Disconnected),
            Self::Error => Some(StreamStatus::Error),
            _ => None,
        }
    }

    /// No background activity happens in this state
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Error | Self::Stopped | Self::Disposed)
    }
}

/// Mutable session state, guarded as one unit so append and flush never interleave
struct Inner {
    /// Bumped on every start/stop; work tagged with an older value is discarded
    generation: u64,
    state: SessionState,
    last_status: Option<StreamStatus>,
    pending: Vec<LogLine>,
    next_seq: u64,
    retry_count: u32,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            generation: 0,
            state: SessionState::Idle,
            last_status: None,
            pending: Vec::new(),
            next_seq: 0,
            retry_count: 0,
        }
    }
}

/// State shared between the session handle and its background tasks
struct Shared {
    inner: Mutex<Inner>,

    /// The wired-up connection, tagged with its generation. Lock after `inner`.
    connection: Mutex<Option<(u64, LogConnection)>>,

    buffer: LogBuffer,
    panel: Arc<dyn Panel>,
}

impl Shared {
    /// Open a new generation for a fresh connection
    fn begin(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.state = SessionState::Connecting;
        inner.last_status = None;
        inner.retry_count = 0;
        inner.generation
    }

    /// Invalidate the running generation and hand back its connection
    ///
    /// A session that ended in `Error` keeps that state.
    fn halt(&self, deliver_pending: bool) -> Option<LogConnection> {
        let mut inner = self.inner.lock();
        if deliver_pending {
            self.flush_locked(&mut inner);
        } else {
            inner.pending.clear();
        }
        inner.generation += 1;
        if inner.state != SessionState::Error {
            inner.state = SessionState::Stopped;
        }
        self.connection.lock().take().map(|(_, connection)| connection)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    /// Wire up a freshly opened connection unless the generation moved on
    fn attach(&self, generation: u64, connection: LogConnection) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        *self.connection.lock() = Some((generation, connection));
        self.transition_locked(&mut inner, SessionState::Connected);
        true
    }

    fn detach(&self, generation: u64) -> Option<LogConnection> {
        let mut slot = self.connection.lock();
        match slot.take() {
            Some((owner, connection)) if owner == generation => Some(connection),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Next line from this generation's connection; `None` once it is gone
    async fn next_line(&self, generation: u64) -> Option<Result<String, StreamError>> {
        futures::future::poll_fn(|cx| match self.connection.lock().as_mut() {
            Some((owner, connection)) if *owner == generation => connection.poll_next_line(cx),
            _ => Poll::Ready(None),
        })
        .await
    }

    fn push_line(&self, generation: u64, raw: String) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        // Output proves the connection works; the retry budget starts over
        inner.retry_count = 0;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.pending.push(LogParser::parse(&raw, seq));
        true
    }

    /// Deliver pending lines; `None` once the generation is stale or settled
    fn flush(&self, generation: u64) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return None;
        }
        let delivered = self.flush_locked(&mut inner);
        (!inner.state.is_settled()).then_some(delivered)
    }

    fn flush_locked(&self, inner: &mut Inner) -> usize {
        if inner.pending.is_empty() {
            return 0;
        }
        let lines = std::mem::take(&mut inner.pending);
        let count = lines.len();
        let raw: Vec<String> = lines.iter().map(|line| line.raw.clone()).collect();
        self.buffer.extend(lines);
        self.panel.post_message(PanelEvent::LogData { lines: raw });
        count
    }

    fn transition(&self, generation: u64, next: SessionState) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        self.transition_locked(&mut inner, next);
        true
    }

    fn transition_locked(&self, inner: &mut Inner, next: SessionState) {
        // Lines received before the change reach the panel first
        self.flush_locked(inner);
        debug!(from = ?inner.state, to = ?next, "log session transition");
        inner.state = next;
        self.report_status(inner, next.status());
    }

    fn report_status(&self, inner: &mut Inner, status: Option<StreamStatus>) {
        if let Some(status) = status {
            if inner.last_status != Some(status) {
                inner.last_status = Some(status);
                self.panel.post_message(PanelEvent::status(status));
            }
        }
    }

    fn set_retry_count(&self, generation: u64, count: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.retry_count = count;
        true
    }

    /// One-shot tail finished normally
    fn complete(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        self.flush_locked(&mut inner);
        self.report_status(&mut inner, Some(StreamStatus::Disconnected));
        inner.state = SessionState::Stopped;
    }

    fn fail(&self, generation: u64, err: &StreamError) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        self.transition_locked(&mut inner, SessionState::Error);
        self.panel.post_message(PanelEvent::error(err));
    }

    fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }

    fn mark(&self, state: SessionState) {
        self.inner.lock().state = state;
    }

    fn clear_pending(&self) {
        self.inner.lock().pending.clear();
    }
}

/// Controller for one panel's log subscription
///
/// Owns the connection, the retained buffer and the flush timer. The driver
/// task reads from the connection but the session can close it at any time. Inbound lines are queued and delivered to the panel in
/// one batch per flush interval.
pub struct LogStreamSession {
    shared: Arc<Shared>,
    source: Arc<dyn LogSource>,
    config: SessionConfig,
    target: Option<StreamTarget>,
    options: StreamOptions,

    /// Cancellation token for the running generation
    cancel: CancellationToken,

    /// Driver and flusher task handles
    tasks: Vec<JoinHandle<()>>,
}

impl LogStreamSession {
    /// Create an idle session; invalid configuration fails here
    pub fn new(
        panel: Arc<dyn Panel>,
        source: Arc<dyn LogSource>,
        config: SessionConfig,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let buffer = LogBuffer::new(config.buffer_capacity)?;

        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                connection: Mutex::new(None),
                buffer,
                panel,
            }),
            source,
            config,
            target: None,
            options: StreamOptions::default(),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Tear down any current connection and stream `target`
    ///
    /// Connection failures are reported to the panel, not returned.
    pub fn start(&mut self, target: StreamTarget, options: StreamOptions) -> Result<(), StreamError> {
        self.ensure_live()?;
        target.validate()?;
        self.teardown(true);
        self.spawn(target, options);
        Ok(())
    }

    /// Point the session at a new pod; the old history is dropped
    pub fn retarget(
        &mut self,
        target: StreamTarget,
        options: StreamOptions,
    ) -> Result<(), StreamError> {
        self.ensure_live()?;
        target.validate()?;
        self.teardown(false);
        self.shared.buffer.clear();
        self.spawn(target, options);
        Ok(())
    }

    /// Manual retry of the current target, e.g. after an error
    pub fn restart(&mut self) -> Result<(), StreamError> {
        let target = self.target.clone().ok_or_else(|| {
            StreamError::Configuration("log session has no target to restart".to_string())
        })?;
        let options = self.options.clone();
        self.retarget(target, options)
    }

    /// Stop streaming; retained history stays available
    pub fn stop(&mut self) {
        if self.state() == SessionState::Disposed {
            return;
        }
        self.teardown(true);
        debug!(stream = ?self.target.as_ref().map(|t| t.to_string()), "log session stopped");
    }

    /// Stop and release everything; calling it again is a no-op
    pub fn dispose(&mut self) {
        if self.state() == SessionState::Disposed {
            return;
        }
        self.stop();
        self.shared.buffer.clear();
        self.shared.mark(SessionState::Disposed);
        self.target = None;
    }

    /// Drop retained and pending lines (user "clear display")
    pub fn clear(&self) {
        self.shared.clear_pending();
        self.shared.buffer.clear();
    }

    /// Retained history in arrival order
    pub fn snapshot(&self) -> Vec<ArcLogLine> {
        self.shared.buffer.snapshot()
    }

    pub fn buffer(&self) -> &LogBuffer {
        &self.shared.buffer
    }

    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Status as last reported to the panel
    pub fn status(&self) -> Option<StreamStatus> {
        self.shared.inner.lock().last_status
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.retry_count()
    }

    /// Lines received but not yet flushed
    pub fn pending_len(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    pub fn target(&self) -> Option<&StreamTarget> {
        self.target.as_ref()
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn ensure_live(&self) -> Result<(), StreamError> {
        if self.state() == SessionState::Disposed {
            return Err(StreamError::Disposed);
        }
        Ok(())
    }

    /// Close the current connection before returning
    fn teardown(&mut self, deliver_pending: bool) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(connection) = self.shared.halt(deliver_pending) {
            connection.destroy();
        }
    }

    fn spawn(&mut self, target: StreamTarget, options: StreamOptions) {
        let generation = self.shared.begin();
        self.cancel = CancellationToken::new();
        info!(stream = %target, follow = options.follow, "starting log stream");

        let driver = StreamDriver {
            generation,
            cancel: self.cancel.clone(),
            shared: Arc::clone(&self.shared),
            source: Arc::clone(&self.source),
            target: target.clone(),
            options: options.clone(),
            retry: self.config.retry.clone(),
        };
        self.tasks.push(tokio::spawn(driver.run()));
        self.tasks.push(tokio::spawn(run_flusher(
            generation,
            self.cancel.clone(),
            Arc::clone(&self.shared),
            self.config.flush_interval,
        )));

        self.target = Some(target);
        self.options = options;
    }
}

impl Drop for LogStreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        drop(self.shared.connection.lock().take());
    }
}

/// Why the pump loop returned
enum PumpEnd {
    Cancelled,
    Stale,
    Closed,
    Interrupted(StreamError),
}

/// Background task driving the connection for one generation
struct StreamDriver {
    generation: u64,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    source: Arc<dyn LogSource>,
    target: StreamTarget,
    options: StreamOptions,
    retry: RetryPolicy,
}

impl StreamDriver {
    async fn run(self) {
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.source.open(&self.target, &self.options) => result,
        };

        let mut connection = match opened {
            Ok(connection) => connection,
            Err(err) => {
                warn!(stream = %self.target, error = %err, "failed to open log stream");
                self.shared.fail(self.generation, &err);
                return;
            }
        };

        loop {
            // A connection that lands after stop() is dropped, never wired up
            if self.cancel.is_cancelled() || !self.shared.attach(self.generation, connection) {
                return;
            }

            let end = self.pump().await;
            if let Some(connection) = self.shared.detach(self.generation) {
                connection.destroy();
            }

            let cause = match end {
                PumpEnd::Cancelled | PumpEnd::Stale => return,
                PumpEnd::Closed if !self.options.follow => {
                    debug!(stream = %self.target, "log tail complete");
                    self.shared.complete(self.generation);
                    return;
                }
                PumpEnd::Interrupted(err) if !self.options.follow => {
                    self.shared.fail(self.generation, &err);
                    return;
                }
                PumpEnd::Closed => {
                    warn!(stream = %self.target, "log stream closed unexpectedly");
                    StreamError::StreamInterrupted("stream closed by the server".to_string())
                }
                PumpEnd::Interrupted(err) => {
                    warn!(stream = %self.target, error = %err, "log stream interrupted");
                    err
                }
            };

            connection = match self.reconnect(cause).await {
                Some(next) => next,
                None => return,
            };
        }
    }

    async fn pump(&self) -> PumpEnd {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                next = self.shared.next_line(self.generation) => match next {
                    Some(Ok(line)) => {
                        if !self.shared.push_line(self.generation, line) {
                            return PumpEnd::Stale;
                        }
                    }
                    Some(Err(err)) => return PumpEnd::Interrupted(err),
                    None if !self.shared.is_current(self.generation) => return PumpEnd::Stale,
                    None => return PumpEnd::Closed,
                },
            }
        }
    }

    /// Reopen after `cause` ended the stream
    ///
    /// Attempts continue from the current retry count: a reconnect that
    /// opens but ends before producing output still uses up an attempt.
    async fn reconnect(&self, cause: StreamError) -> Option<LogConnection> {
        if !self
            .shared
            .transition(self.generation, SessionState::Disconnected)
        {
            return None;
        }

        // Resume with new lines only; the history is already buffered
        let resume = StreamOptions {
            tail_lines: Some(0),
            ..self.options.clone()
        };
        let mut last_error = cause;
        let first = self.shared.retry_count() + 1;

        for attempt in first..=self.retry.max_attempts {
            if !self.shared.set_retry_count(self.generation, attempt) {
                return None;
            }

            let delay = self.retry.delay(attempt);
            debug!(stream = %self.target, attempt, ?delay, "reconnecting log stream");
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self
                .shared
                .transition(self.generation, SessionState::Connecting)
            {
                return None;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.source.open(&self.target, &resume) => result,
            };

            match result {
                Ok(connection) => return Some(connection),
                Err(err @ StreamError::Permission { .. }) => {
                    warn!(stream = %self.target, error = %err, "reconnect denied");
                    self.shared.fail(self.generation, &err);
                    return None;
                }
                Err(err) => {
                    debug!(stream = %self.target, attempt, error = %err, "reconnect attempt failed");
                    last_error = err;
                    if !self
                        .shared
                        .transition(self.generation, SessionState::Disconnected)
                    {
                        return None;
                    }
                }
            }
        }

        let reason = format!(
            "gave up after {} reconnect attempts: {}",
            self.retry.max_attempts, last_error
        );
        warn!(stream = %self.target, "{}", reason);
        self.shared
            .fail(self.generation, &StreamError::StreamInterrupted(reason));
        None
    }
}

/// Deliver pending lines once per interval until the generation ends
async fn run_flusher(
    generation: u64,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if shared.flush(generation).is_none() {
                    break;
                }
            }
        }
    }
}
