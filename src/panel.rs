//! Terminal render surface for log panels
//!
//! Log lines go to stdout; status changes and errors go to stderr. With
//! `--json` every panel event is written to stdout as one JSON object per
//! line instead.

use std::io::{self, Write};
use std::sync::Arc;

use tracing::{debug, warn};

use kubepanel_logs::{Panel, PanelEvent, PanelFactory, StreamStatus};

pub struct TerminalPanel {
    context: String,
    json: bool,

    /// Whether the stream follows; a one-shot tail never reconnects
    follow: bool,
}

impl TerminalPanel {
    fn write_lines(lines: &[String]) {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for line in lines {
            if writeln!(out, "{}", line).is_err() {
                // stdout closed (e.g. piped into head)
                break;
            }
        }
    }
}

impl Panel for TerminalPanel {
    fn post_message(&self, event: PanelEvent) {
        if self.json {
            match serde_json::to_string(&event) {
                Ok(line) => Self::write_lines(&[line]),
                Err(e) => warn!(error = %e, "failed to encode panel event"),
            }
            return;
        }

        match event {
            PanelEvent::LogData { lines } => Self::write_lines(&lines),
            PanelEvent::StreamStatus { status } => {
                eprintln!("{}", status_line(&self.context, status, self.follow));
            }
            PanelEvent::Error { message } => {
                eprintln!("[{}] error: {}", self.context, message);
            }
        }
    }

    fn reveal(&self) {
        debug!(context = %self.context, "log panel revealed");
    }

    fn dispose(&self) {
        let _ = io::stdout().flush();
    }
}

/// Human-readable status notice
fn status_line(context: &str, status: StreamStatus, follow: bool) -> String {
    match status {
        StreamStatus::Connected => format!("[{}] streaming", context),
        StreamStatus::Disconnected if follow => {
            format!("[{}] disconnected, reconnecting...", context)
        }
        StreamStatus::Disconnected => format!("[{}] end of logs", context),
        StreamStatus::Error => format!("[{}] stream failed", context),
    }
}

/// Creates a terminal panel per cluster context
pub struct TerminalPanelFactory {
    json: bool,
    follow: bool,
}

impl TerminalPanelFactory {
    pub fn new(json: bool, follow: bool) -> Self {
        Self { json, follow }
    }
}

impl PanelFactory for TerminalPanelFactory {
    fn create_panel(&self, context: &str) -> Arc<dyn Panel> {
        Arc::new(TerminalPanel {
            context: context.to_string(),
            json: self.json,
            follow: self.follow,
        })
    }
}
