//! Configuration file handling

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use kubepanel_logs::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_FLUSH_INTERVAL, RetryPolicy, SessionConfig, StreamError,
};

/// Contents of the optional TOML config file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionSection,
    pub retry: RetrySection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub buffer_capacity: usize,
    pub flush_interval_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL.as_millis() as u64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
        }
    }
}

impl Config {
    /// Load the config file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Session settings, with the CLI buffer size taking precedence
    pub fn session_config(&self, buffer_size: Option<usize>) -> Result<SessionConfig, StreamError> {
        let retry = RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.initial_backoff_ms),
            Duration::from_millis(self.retry.max_backoff_ms),
        )?;

        let config = SessionConfig {
            buffer_capacity: buffer_size.unwrap_or(self.session.buffer_capacity),
            flush_interval: Duration::from_millis(self.session.flush_interval_ms),
            retry,
        };
        config.validate()?;
        Ok(config)
    }
}
