use std::time::Duration;

use kubepanel_types::StreamError;

/// Reconnect policy for interrupted follow-mode streams
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed reconnect attempts before giving up
    pub max_attempts: u32,

    /// Delay before the first reconnect attempt
    pub initial_backoff: Duration,

    /// Upper bound for any single delay
    pub max_backoff: Duration,

    /// Growth factor between consecutive attempts
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Result<Self, StreamError> {
        if max_attempts == 0 {
            return Err(StreamError::Configuration(
                "reconnect attempts must be positive".to_string(),
            ));
        }
        if max_backoff < initial_backoff {
            return Err(StreamError::Configuration(format!(
                "max backoff {:?} is shorter than initial backoff {:?}",
                max_backoff, initial_backoff
            )));
        }
        Ok(Self {
            max_attempts,
            initial_backoff,
            max_backoff,
            ..Default::default()
        })
    }

    /// Retry without waiting between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}
