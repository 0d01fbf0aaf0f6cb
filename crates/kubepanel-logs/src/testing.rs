//! Fakes for session and registry tests: a scripted log source and a
//! panel that records everything posted to it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use kubepanel_types::{
    LogConnection, LogSource, Panel, PanelEvent, PanelFactory, StreamError, StreamOptions,
    StreamStatus, StreamTarget,
};

type LineItem = Result<String, StreamError>;

/// Poll `condition` until it holds, failing the test after two seconds
pub(crate) async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give background tasks a few flush intervals to misbehave
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

#[derive(Default)]
pub(crate) struct RecordingPanel {
    events: Mutex<Vec<PanelEvent>>,
    reveals: AtomicUsize,
    disposals: AtomicUsize,
}

impl RecordingPanel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<PanelEvent> {
        self.events.lock().clone()
    }

    pub fn log_batches(&self) -> Vec<Vec<String>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PanelEvent::LogData { lines } => Some(lines.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<StreamStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PanelEvent::StreamStatus { status } => Some(*status),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PanelEvent::Error { message } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn reveals(&self) -> usize {
        self.reveals.load(Ordering::SeqCst)
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

impl Panel for RecordingPanel {
    fn post_message(&self, event: PanelEvent) {
        self.events.lock().push(event);
    }

    fn reveal(&self) {
        self.reveals.fetch_add(1, Ordering::SeqCst);
    }

    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct RecordingPanelFactory {
    panels: Mutex<Vec<(String, Arc<RecordingPanel>)>>,
}

impl RecordingPanelFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.panels.lock().len()
    }

    pub fn panel(&self, index: usize) -> Arc<RecordingPanel> {
        Arc::clone(&self.panels.lock()[index].1)
    }

    pub fn contexts(&self) -> Vec<String> {
        self.panels.lock().iter().map(|(ctx, _)| ctx.clone()).collect()
    }
}

impl PanelFactory for RecordingPanelFactory {
    fn create_panel(&self, context: &str) -> Arc<dyn Panel> {
        let panel = RecordingPanel::new();
        self.panels
            .lock()
            .push((context.to_string(), Arc::clone(&panel)));
        panel
    }
}

/// Test-side end of a scripted stream; dropping it closes the stream
pub(crate) struct LineFeed {
    tx: mpsc::UnboundedSender<LineItem>,
}

impl LineFeed {
    pub fn line(&self, line: &str) {
        let _ = self.tx.send(Ok(line.to_string()));
    }

    pub fn interrupt(&self, reason: &str) {
        let _ = self
            .tx
            .send(Err(StreamError::StreamInterrupted(reason.to_string())));
    }
}

enum Script {
    Stream(mpsc::UnboundedReceiver<LineItem>),
    Gated(oneshot::Receiver<()>, mpsc::UnboundedReceiver<LineItem>),
    Fail(StreamError),
}

/// Counts a connection as live until its stream is dropped or closes
struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Log source answering each `open` with the next scripted outcome
#[derive(Default)]
pub(crate) struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
    opened: Mutex<Vec<(StreamTarget, StreamOptions)>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_stream(&self) -> LineFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().push_back(Script::Stream(rx));
        LineFeed { tx }
    }

    /// A stream that closes as soon as it is opened
    pub fn push_closed_stream(&self) {
        drop(self.push_stream());
    }

    /// A stream that opens fine and then fails before any output
    pub fn push_interrupted_stream(&self, reason: &str) {
        self.push_stream().interrupt(reason);
    }

    /// A stream whose open blocks until the returned sender fires
    pub fn push_gated_stream(&self) -> (oneshot::Sender<()>, LineFeed) {
        let (gate_tx, gate_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().push_back(Script::Gated(gate_rx, rx));
        (gate_tx, LineFeed { tx })
    }

    pub fn push_failure(&self, err: StreamError) {
        self.scripts.lock().push_back(Script::Fail(err));
    }

    pub fn opens(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn opened(&self) -> Vec<(StreamTarget, StreamOptions)> {
        self.opened.lock().clone()
    }

    /// Connections handed out and not yet dropped or closed
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn connect(&self, rx: mpsc::UnboundedReceiver<LineItem>) -> LogConnection {
        let guard = LiveGuard::new(Arc::clone(&self.live));
        let lines = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|item| (item, (rx, guard)))
        });
        LogConnection::new(lines)
    }
}

#[async_trait]
impl LogSource for ScriptedSource {
    async fn open(
        &self,
        target: &StreamTarget,
        options: &StreamOptions,
    ) -> Result<LogConnection, StreamError> {
        self.opened.lock().push((target.clone(), options.clone()));
        let script = self.scripts.lock().pop_front();

        match script {
            Some(Script::Stream(rx)) => Ok(self.connect(rx)),
            Some(Script::Gated(gate, rx)) => {
                let _ = gate.await;
                Ok(self.connect(rx))
            }
            Some(Script::Fail(err)) => Err(err),
            None => Err(StreamError::connection(target, "no scripted stream")),
        }
    }
}
