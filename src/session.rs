use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use session_transport::config::DEFAULT_BUNDLE;
use session_transport::CreateSessionRequest;
use time::OffsetDateTime;

use crate::approval::{ApprovalBook, ApprovalRequest};
use crate::error::SessionError;
use crate::stream::{CancelHandle, StreamId};

/// Lifecycle of a session as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Created,
    Active,
    Deleting,
    Deleted,
}

impl SessionState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options a session is created with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub bundle: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub working_dir: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BUNDLE)
    }
}

impl SessionConfig {
    pub fn new(bundle: impl Into<String>) -> Self {
        Self {
            bundle: bundle.into(),
            provider: None,
            model: None,
            working_dir: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn insert_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub(crate) fn to_request(&self) -> CreateSessionRequest {
        CreateSessionRequest {
            bundle: self.bundle.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            working_dir: self.working_dir.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ActiveStream {
    pub(crate) id: StreamId,
    pub(crate) cancel: CancelHandle,
}

/// Mutable part of a session. Only reachable through [`Session::lock`].
#[derive(Debug)]
pub(crate) struct SessionSlot {
    pub(crate) state: SessionState,
    pub(crate) active_stream: Option<ActiveStream>,
    pub(crate) approvals: ApprovalBook,
    next_stream_id: StreamId,
}

#[derive(Debug)]
struct SessionInner {
    id: String,
    config: SessionConfig,
    created_at: OffsetDateTime,
    slot: Mutex<SessionSlot>,
}

/// Handle to one remote session.
///
/// Cheap to clone; every clone refers to the same lifecycle state. State
/// transitions happen through [`SessionClient`](crate::SessionClient).
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(id: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                config,
                created_at: OffsetDateTime::now_utc(),
                slot: Mutex::new(SessionSlot {
                    state: SessionState::Created,
                    active_stream: None,
                    approvals: ApprovalBook::default(),
                    next_stream_id: 1,
                }),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn created_at(&self) -> OffsetDateTime {
        self.inner.created_at
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    #[must_use]
    pub fn has_open_stream(&self) -> bool {
        self.lock().active_stream.is_some()
    }

    /// Snapshot of one approval request, whatever its state.
    #[must_use]
    pub fn approval(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.lock().approvals.get(request_id).cloned()
    }

    /// Pending approval requests, ordered by id.
    #[must_use]
    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.lock().approvals.pending()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionSlot> {
        lock_unpoisoned(&self.inner.slot)
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    /// Claim the single stream slot of an active session.
    pub(crate) fn open_stream(
        &self,
        operation: &'static str,
    ) -> Result<(StreamId, CancelHandle), SessionError> {
        let mut slot = self.lock();
        if slot.state != SessionState::Active {
            return Err(SessionError::InvalidSessionState {
                session_id: self.id().to_string(),
                state: slot.state,
                operation,
            });
        }
        if slot.active_stream.is_some() {
            return Err(SessionError::StreamBusy {
                session_id: self.id().to_string(),
            });
        }

        let id = slot.next_stream_id;
        slot.next_stream_id += 1;
        let cancel = CancelHandle::default();
        slot.active_stream = Some(ActiveStream {
            id,
            cancel: cancel.clone(),
        });
        Ok((id, cancel))
    }

    /// Free the slot held by `stream_id` and expire its pending approvals.
    pub(crate) fn release_stream(&self, stream_id: StreamId) {
        let mut slot = self.lock();
        if slot
            .active_stream
            .as_ref()
            .is_some_and(|active| active.id == stream_id)
        {
            slot.active_stream = None;
        }
        slot.approvals.expire_stream(stream_id);
    }

    /// Move to `deleting` unless deletion already started.
    ///
    /// Cancels the open stream and expires every pending approval. Returns
    /// `false` when the session was already `deleting` or `deleted`.
    pub(crate) fn begin_delete(&self) -> bool {
        let mut slot = self.lock();
        if matches!(slot.state, SessionState::Deleting | SessionState::Deleted) {
            return false;
        }
        slot.state = SessionState::Deleting;
        if let Some(active) = slot.active_stream.take() {
            active.cancel.cancel();
        }
        slot.approvals.expire_all();
        true
    }

    /// Signal the open stream, if any, to stop at its next suspension point.
    pub(crate) fn cancel_open_stream(&self) {
        if let Some(active) = self.lock().active_stream.as_ref() {
            active.cancel.cancel();
        }
    }

    /// Reopen (or expire) a request whose decision failed to reach the server.
    pub(crate) fn rollback_approval(&self, request_id: &str) {
        let mut slot = self.lock();
        let stream_open = match (slot.approvals.get(request_id), slot.active_stream.as_ref()) {
            (Some(request), Some(active)) => request.stream_id() == active.id,
            _ => false,
        };
        slot.approvals.rollback(request_id, stream_open);
    }

    pub(crate) fn observe_approval(
        &self,
        stream_id: StreamId,
        request_id: &str,
        prompt: &str,
        options: &[String],
    ) {
        self.lock()
            .approvals
            .observe(self.id(), stream_id, request_id, prompt, options);
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use session_transport::ApprovalDecision;

    use super::{Session, SessionConfig, SessionState};
    use crate::approval::ApprovalState;
    use crate::error::SessionError;

    fn active_session() -> Session {
        let session = Session::new("s-1", SessionConfig::default());
        session.set_state(SessionState::Active);
        session
    }

    #[test]
    fn stream_slot_is_exclusive_until_released() {
        let session = active_session();
        let (first, _) = session.open_stream("prompt").expect("first stream");

        assert_matches!(
            session.open_stream("prompt"),
            Err(SessionError::StreamBusy { session_id }) if session_id == "s-1"
        );

        session.release_stream(first);
        let (second, _) = session.open_stream("prompt").expect("second stream");
        assert_ne!(first, second);
    }

    #[test]
    fn stale_release_keeps_current_stream() {
        let session = active_session();
        let (first, _) = session.open_stream("prompt").expect("first stream");
        session.release_stream(first);
        let (second, _) = session.open_stream("prompt").expect("second stream");

        session.release_stream(first);
        assert!(session.has_open_stream());
        session.release_stream(second);
        assert!(!session.has_open_stream());
    }

    #[test]
    fn only_active_sessions_open_streams() {
        let session = Session::new("s-1", SessionConfig::default());
        assert_matches!(
            session.open_stream("prompt"),
            Err(SessionError::InvalidSessionState {
                state: SessionState::Created,
                operation: "prompt",
                ..
            })
        );
    }

    #[test]
    fn delete_starts_once_and_cancels_open_stream() {
        let session = active_session();
        let (_, cancel) = session.open_stream("prompt").expect("stream");

        assert!(session.begin_delete());
        assert!(cancel.is_cancelled());
        assert!(!session.has_open_stream());
        assert_eq!(session.state(), SessionState::Deleting);

        assert!(!session.begin_delete());
    }

    #[test]
    fn failed_response_reopens_request_while_stream_is_open() {
        let session = active_session();
        let (stream_id, _) = session.open_stream("prompt").expect("stream");
        session.observe_approval(stream_id, "r1", "rm -rf build?", &[]);
        session
            .lock()
            .approvals
            .begin_response("s-1", "r1", ApprovalDecision::Approved)
            .expect("pending");

        session.rollback_approval("r1");
        assert_eq!(
            session.approval("r1").map(|request| request.state),
            Some(ApprovalState::Pending)
        );
    }

    #[test]
    fn default_config_uses_foundation_bundle() {
        let request = SessionConfig::default().with_model("small").to_request();
        assert_eq!(request.bundle, "foundation");
        assert_eq!(request.model.as_deref(), Some("small"));
    }
}
