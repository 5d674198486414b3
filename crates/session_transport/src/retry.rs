use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::config::RetryConfig;
use crate::error::TransportError;

/// Maximum retry attempts after an initial connect attempt.
pub const MAX_RETRIES: u32 = 3;
/// Base delay before the first retry.
pub const BASE_DELAY_MS: u64 = 1000;
/// Upper bound for a single backoff delay.
pub const MAX_DELAY_MS: u64 = 30_000;
/// Maximum consecutive resumes of a dropped stream.
pub const MAX_RESUMES: u32 = 3;

fn retryable_status_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)rate.?limit|overloaded|service.?unavailable|upstream.?connect|connection.?(refused|reset)")
            .expect("retry regex must compile")
    })
}

/// Error text retry policy for transient failures and retryable statuses.
pub fn is_retryable_http_error(status: u16, error_text: &str) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504) || retryable_status_regex().is_match(error_text)
}

/// What to do after a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Open a fresh connection after `delay`. Nothing was received yet.
    Retry { delay: Duration },
    /// Reconnect after `delay`, asking the server to continue after `last_event_id`.
    Resume {
        delay: Duration,
        last_event_id: String,
    },
    /// Surface the failure.
    Fail,
}

/// Exponential backoff bounded by [`RetryConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    config: RetryConfig,
}

impl BackoffSchedule {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30);
        let base = self.config.base_delay.as_millis() as u64;
        let delay = base.saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay).min(self.config.max_delay)
    }

    /// Failure before any frame was received. `attempt` counts failures so far,
    /// including this one.
    #[must_use]
    pub fn on_connect_failure(&self, error: &TransportError, attempt: u32) -> RetryDecision {
        if !error.is_retryable() || attempt > self.config.max_retries {
            return RetryDecision::Fail;
        }
        RetryDecision::Retry {
            delay: self.delay(attempt.saturating_sub(1)),
        }
    }

    /// Failure after at least one frame. Resumption needs a captured event id.
    /// `resumes` counts consecutive resumes already attempted.
    #[must_use]
    pub fn on_mid_stream_failure(
        &self,
        error: &TransportError,
        resumes: u32,
        last_event_id: Option<&str>,
        server_hint: Option<Duration>,
    ) -> RetryDecision {
        if !self.config.resume || !error.is_retryable() || resumes >= self.config.max_resumes {
            return RetryDecision::Fail;
        }
        let Some(last_event_id) = last_event_id.filter(|id| !id.is_empty()) else {
            return RetryDecision::Fail;
        };
        let delay = server_hint
            .map(|hint| hint.min(self.config.max_delay))
            .unwrap_or_else(|| self.delay(resumes));
        RetryDecision::Resume {
            delay,
            last_event_id: last_event_id.to_string(),
        }
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
