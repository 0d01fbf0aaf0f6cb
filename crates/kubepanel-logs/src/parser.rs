use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use kubepanel_types::LogLine;

/// `[pod/<pod>/<container>] ` prefix added when several containers are merged
static CONTAINER_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[pod/[^/\]\s]+/([^/\]\s]+)\] ?").expect("container prefix regex is valid")
});

/// Log parser for extracting structure from raw log lines
pub struct LogParser;

impl LogParser {
    /// Parse a raw log line into a LogLine. Never fails.
    pub fn parse(raw: &str, seq: u64) -> LogLine {
        let mut line = LogLine::new(seq, raw);

        let (container, content) = Self::extract_container(raw);
        line.container = container;

        let (timestamp, content) = Self::extract_k8s_timestamp(content);
        line.timestamp = timestamp;
        line.text = content.to_string();

        line
    }

    fn extract_container(raw: &str) -> (Option<String>, &str) {
        match CONTAINER_PREFIX.captures(raw) {
            Some(caps) => {
                let end = caps.get(0).map(|m| m.end()).unwrap_or(0);
                let container = caps.get(1).map(|m| m.as_str().to_string());
                (container, &raw[end..])
            }
            None => (None, raw),
        }
    }

    /// Extract the Kubernetes timestamp from the beginning of a log line
    fn extract_k8s_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        // K8s timestamp format: 2024-01-15T10:30:00.123456789Z followed by a space
        let (first, rest) = raw.split_once(' ').unwrap_or((raw, ""));
        match Self::parse_timestamp(first) {
            Some(ts) => (Some(ts), rest),
            None => (None, raw),
        }
    }

    fn parse_timestamp(token: &str) -> Option<DateTime<Utc>> {
        // Shortest RFC3339 form is 2024-01-15T10:30:00Z (20 chars)
        if token.len() < 20 || !token.as_bytes()[0].is_ascii_digit() {
            return None;
        }
        DateTime::parse_from_rfc3339(token)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}
