//! Correlation of `approval.required` events with caller decisions.
//!
//! Each request moves `pending -> approved | denied` through an explicit
//! response, or `pending -> expired` when the stream that raised it closes
//! first. All three outcomes are terminal.

use std::collections::HashMap;
use std::fmt;

use session_transport::ApprovalDecision;

use crate::error::SessionError;
use crate::stream::StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ApprovalDecision> for ApprovalState {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approved => Self::Approved,
            ApprovalDecision::Denied => Self::Denied,
        }
    }
}

/// An approval request observed on a session's stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub id: String,
    pub session_id: String,
    pub prompt: String,
    pub options: Vec<String>,
    pub state: ApprovalState,
    stream_id: StreamId,
}

impl ApprovalRequest {
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

/// Per-session ledger of approval requests, guarded by the session lock.
#[derive(Debug, Default)]
pub(crate) struct ApprovalBook {
    requests: HashMap<String, ApprovalRequest>,
}

impl ApprovalBook {
    /// Record a request raised by `stream_id`.
    ///
    /// A replayed id (for example after a resume) leaves the existing entry as is.
    pub(crate) fn observe(
        &mut self,
        session_id: &str,
        stream_id: StreamId,
        request_id: &str,
        prompt: &str,
        options: &[String],
    ) {
        self.requests
            .entry(request_id.to_string())
            .or_insert_with(|| ApprovalRequest {
                id: request_id.to_string(),
                session_id: session_id.to_string(),
                prompt: prompt.to_string(),
                options: options.to_vec(),
                state: ApprovalState::Pending,
                stream_id,
            });
    }

    /// Move a pending request to the caller's decision before it is sent.
    pub(crate) fn begin_response(
        &mut self,
        session_id: &str,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), SessionError> {
        let Some(request) = self.requests.get_mut(request_id) else {
            return Err(SessionError::UnknownApprovalRequest {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
            });
        };
        match request.state {
            ApprovalState::Pending => {
                request.state = decision.into();
                Ok(())
            }
            ApprovalState::Expired => Err(SessionError::ApprovalWindowClosed {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
            }),
            ApprovalState::Approved | ApprovalState::Denied => {
                Err(SessionError::UnknownApprovalRequest {
                    session_id: session_id.to_string(),
                    request_id: request_id.to_string(),
                })
            }
        }
    }

    /// Undo [`ApprovalBook::begin_response`] after the decision failed to send.
    ///
    /// If the owning stream closed meanwhile the request expires instead.
    pub(crate) fn rollback(&mut self, request_id: &str, stream_open: bool) {
        if let Some(request) = self.requests.get_mut(request_id) {
            if matches!(request.state, ApprovalState::Approved | ApprovalState::Denied) {
                request.state = if stream_open {
                    ApprovalState::Pending
                } else {
                    ApprovalState::Expired
                };
            }
        }
    }

    /// Expire every pending request raised by `stream_id`. Returns how many expired.
    pub(crate) fn expire_stream(&mut self, stream_id: StreamId) -> usize {
        self.expire_where(|request| request.stream_id == stream_id)
    }

    pub(crate) fn expire_all(&mut self) -> usize {
        self.expire_where(|_| true)
    }

    #[must_use]
    pub(crate) fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<_> = self
            .requests
            .values()
            .filter(|request| request.state == ApprovalState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.id.cmp(&b.id));
        pending
    }

    #[must_use]
    pub(crate) fn get(&self, request_id: &str) -> Option<&ApprovalRequest> {
        self.requests.get(request_id)
    }

    fn expire_where(&mut self, predicate: impl Fn(&ApprovalRequest) -> bool) -> usize {
        let mut expired = 0;
        for request in self.requests.values_mut() {
            if request.state == ApprovalState::Pending && predicate(request) {
                request.state = ApprovalState::Expired;
                expired += 1;
            }
        }
        expired
    }
}
