use session_transport::{DecodeError, TransportError};
use thiserror::Error;

use crate::session::SessionState;

/// Failure surfaced by [`SessionClient`](crate::SessionClient) operations and
/// event streams.
///
/// Fail-fast variants name the violated precondition so callers can decide
/// whether to retry, switch sessions, or give up.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect after {attempts} attempt(s): {source}")]
    ConnectError {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("stream for session '{session_id}' broke after event {last_event_id:?}: {source}")]
    MidStreamError {
        session_id: String,
        last_event_id: Option<String>,
        #[source]
        source: TransportError,
    },

    #[error("undecodable frame on session '{session_id}': {source}")]
    DecodeError {
        session_id: String,
        #[source]
        source: DecodeError,
    },

    #[error("failed to create session with bundle '{bundle}': {reason}")]
    SessionCreateError {
        bundle: String,
        reason: String,
        #[source]
        source: Option<TransportError>,
    },

    #[error("session '{session_id}' is {state}; {operation} requires an active session")]
    InvalidSessionState {
        session_id: String,
        state: SessionState,
        operation: &'static str,
    },

    #[error("session '{session_id}' already has an open stream")]
    StreamBusy { session_id: String },

    #[error("approval request '{request_id}' is not pending on session '{session_id}'")]
    UnknownApprovalRequest {
        session_id: String,
        request_id: String,
    },

    #[error(
        "approval request '{request_id}' on session '{session_id}' expired when its stream closed"
    )]
    ApprovalWindowClosed {
        session_id: String,
        request_id: String,
    },

    #[error("{operation} failed for session '{session_id}': {source}")]
    Transport {
        operation: &'static str,
        session_id: String,
        #[source]
        source: TransportError,
    },

    #[error("invalid client configuration: {0}")]
    Config(#[source] TransportError),
}

impl SessionError {
    #[must_use]
    pub fn transport(
        operation: &'static str,
        session_id: impl Into<String>,
        source: TransportError,
    ) -> Self {
        Self::Transport {
            operation,
            session_id: session_id.into(),
            source,
        }
    }

    #[must_use]
    pub fn create(
        bundle: impl Into<String>,
        reason: impl Into<String>,
        source: Option<TransportError>,
    ) -> Self {
        Self::SessionCreateError {
            bundle: bundle.into(),
            reason: reason.into(),
            source,
        }
    }
}
