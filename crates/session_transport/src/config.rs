use std::collections::BTreeMap;
use std::time::Duration;

use crate::endpoints::DEFAULT_BASE_URL;
use crate::retry::{BASE_DELAY_MS, MAX_DELAY_MS, MAX_RESUMES, MAX_RETRIES};
use crate::sse::DEFAULT_MAX_FRAME_BYTES;

/// Bundle used when a session config does not name one.
pub const DEFAULT_BUNDLE: &str = "foundation";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub const ENV_BASE_URL: &str = "AGENT_SESSION_BASE_URL";
pub const ENV_API_KEY: &str = "AGENT_SESSION_API_KEY";
pub const ENV_BUNDLE: &str = "AGENT_SESSION_BUNDLE";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "AGENT_SESSION_REQUEST_TIMEOUT_MS";
pub const ENV_IDLE_TIMEOUT_MS: &str = "AGENT_SESSION_IDLE_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "AGENT_SESSION_MAX_RETRIES";

/// Retry and resumption limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first connect attempt. Default: 3.
    pub max_retries: u32,
    /// Delay before the first retry, doubled per attempt. Default: 1s.
    pub base_delay: Duration,
    /// Cap for any single delay. Default: 30s.
    pub max_delay: Duration,
    /// Consecutive resumes allowed for one stream. Default: 3.
    pub max_resumes: u32,
    /// Whether dropped streams reconnect with `Last-Event-ID`. Default: true.
    pub resume: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
            max_delay: Duration::from_millis(MAX_DELAY_MS),
            max_resumes: MAX_RESUMES,
            resume: true,
        }
    }
}

impl RetryConfig {
    /// No retries and no resumption.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            max_resumes: 0,
            resume: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_max_resumes(mut self, max_resumes: u32) -> Self {
        self.max_resumes = max_resumes;
        self
    }

    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// Client configuration for the session service.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the session service.
    pub base_url: String,
    /// Optional bearer token passed to `Authorization`.
    pub api_key: Option<String>,
    /// Bundle used by one-shot runs and default session configs.
    pub bundle: String,
    /// Timeout for unary requests (create, delete, approval responses).
    pub request_timeout: Duration,
    /// Timeout for establishing a TCP/TLS connection.
    pub connect_timeout: Duration,
    /// Maximum silence on an open stream, heartbeats included.
    pub idle_timeout: Duration,
    /// Optional `User-Agent` override.
    pub user_agent: Option<String>,
    /// Additional headers merged into request headers.
    pub extra_headers: BTreeMap<String, String>,
    pub retry: RetryConfig,
    /// Upper bound for one undecoded SSE frame.
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            bundle: DEFAULT_BUNDLE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            user_agent: None,
            extra_headers: BTreeMap::new(),
            retry: RetryConfig::default(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `AGENT_SESSION_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let millis = |key: &str| {
            read(key)
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let mut config = Self::default();
        if let Some(base_url) = read(ENV_BASE_URL) {
            config.base_url = base_url;
        }
        if let Some(api_key) = read(ENV_API_KEY) {
            config.api_key = Some(api_key);
        }
        if let Some(bundle) = read(ENV_BUNDLE) {
            config.bundle = bundle;
        }
        if let Some(timeout) = millis(ENV_REQUEST_TIMEOUT_MS) {
            config.request_timeout = timeout;
        }
        if let Some(timeout) = millis(ENV_IDLE_TIMEOUT_MS) {
            config.idle_timeout = timeout;
        }
        if let Some(max_retries) = read(ENV_MAX_RETRIES).and_then(|value| value.parse().ok()) {
            config.retry.max_retries = max_retries;
        }
        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_bundle(mut self, bundle: impl Into<String>) -> Self {
        self.bundle = bundle.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn insert_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }
}
