use url::Url;

use crate::error::TransportError;

/// Default base URL for a locally running session service.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8410";

/// Resolved endpoint set for one session service.
///
/// Identifiers are pushed as path segments, so ids containing `/` or spaces
/// are percent-encoded instead of changing the route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    base: Url,
}

impl Endpoints {
    /// Normalize and validate a base URL.
    ///
    /// Normalization rules:
    /// 1) blank input falls back to [`DEFAULT_BASE_URL`]
    /// 2) trailing slashes are dropped
    /// 3) only `http` and `https` are accepted
    pub fn new(input: &str) -> Result<Self, TransportError> {
        let trimmed = input.trim();
        let raw = if trimmed.is_empty() {
            DEFAULT_BASE_URL
        } else {
            trimmed
        };
        let base = Url::parse(raw.trim_end_matches('/'))
            .map_err(|error| TransportError::InvalidConfig(format!("invalid base URL {raw}: {error}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TransportError::InvalidConfig(format!(
                "unsupported URL scheme '{}' in {raw}",
                base.scheme()
            )));
        }
        if base.cannot_be_a_base() {
            return Err(TransportError::InvalidConfig(format!(
                "base URL cannot carry paths: {raw}"
            )));
        }
        Ok(Self { base })
    }

    #[must_use]
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// `POST {base}/sessions`
    #[must_use]
    pub fn sessions(&self) -> Url {
        self.join(&["sessions"])
    }

    /// `DELETE {base}/sessions/{id}`
    #[must_use]
    pub fn session(&self, session_id: &str) -> Url {
        self.join(&["sessions", session_id])
    }

    /// `POST {base}/sessions/{id}/prompt` (SSE response)
    #[must_use]
    pub fn prompt(&self, session_id: &str) -> Url {
        self.join(&["sessions", session_id, "prompt"])
    }

    /// `POST {base}/sessions/{id}/approvals/{request_id}`
    #[must_use]
    pub fn approval(&self, session_id: &str, request_id: &str) -> Url {
        self.join(&["sessions", session_id, "approvals", request_id])
    }

    fn join(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}
