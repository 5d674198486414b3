use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use session_transport::payload::{ApprovalResponseBody, CreateSessionResponse};
use session_transport::{
    ApprovalDecision, BackoffSchedule, ClientConfig, Endpoints, HttpTransport, PromptRequest,
    RetryDecision, StreamRequest, Transport, TransportError, UnaryRequest,
};
use tracing::{debug, info, warn};

use crate::approval::ApprovalRequest;
use crate::error::SessionError;
use crate::response::{collect_response, Response};
use crate::scope::SessionGuard;
use crate::session::{lock_unpoisoned, Session, SessionConfig, SessionState};
use crate::stream::EventStream;

struct ClientInner {
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
    config: ClientConfig,
    schedule: BackoffSchedule,
    sessions: Mutex<BTreeSet<String>>,
}

/// Entry point for the session service.
///
/// Cheap to clone; clones share the transport and the set of live sessions.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClient")
            .field("base_url", &self.inner.endpoints.base().as_str())
            .field("bundle", &self.inner.config.bundle)
            .finish_non_exhaustive()
    }
}

impl SessionClient {
    /// Client over HTTP.
    pub fn new(config: ClientConfig) -> Result<Self, SessionError> {
        let transport = HttpTransport::new(config.clone()).map_err(SessionError::Config)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Client configured from `AGENT_SESSION_*` environment variables.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::new(ClientConfig::from_env())
    }

    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, SessionError> {
        let endpoints = Endpoints::new(&config.base_url).map_err(SessionError::Config)?;
        let schedule = BackoffSchedule::new(config.retry.clone());
        Ok(Self {
            inner: Arc::new(ClientInner {
                transport,
                endpoints,
                config,
                schedule,
                sessions: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Ids of sessions created by this client and not yet deleted.
    pub fn list_sessions(&self) -> Vec<String> {
        lock_unpoisoned(&self.inner.sessions).iter().cloned().collect()
    }

    pub async fn create_session(&self, config: SessionConfig) -> Result<Session, SessionError> {
        if config.bundle.trim().is_empty() {
            return Err(SessionError::create(
                &config.bundle,
                "bundle name is empty",
                None,
            ));
        }

        let body = serde_json::to_value(config.to_request()).map_err(|error| {
            SessionError::create(&config.bundle, "could not encode request", Some(error.into()))
        })?;
        let reply = self
            .send_unary(UnaryRequest::post(self.inner.endpoints.sessions(), body))
            .await
            .map_err(|source| SessionError::create(&config.bundle, source.to_string(), Some(source)))?;

        let session_id = serde_json::from_value::<CreateSessionResponse>(reply)
            .ok()
            .map(|reply| reply.session_id)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                SessionError::create(&config.bundle, "reply carries no session id", None)
            })?;

        let session = Session::new(session_id, config);
        session.set_state(SessionState::Active);
        lock_unpoisoned(&self.inner.sessions).insert(session.id().to_string());
        info!(session_id = %session.id(), bundle = %session.config().bundle, "session created");
        Ok(session)
    }

    /// Delete `session` on the server. Safe to call any number of times.
    ///
    /// An open stream is cancelled and pending approvals expire before the
    /// request goes out. The session ends `deleted` locally even when the
    /// server call fails; that failure is returned once.
    pub async fn delete_session(&self, session: &Session) -> Result<(), SessionError> {
        if !session.begin_delete() {
            debug!(session_id = %session.id(), "session already deleted");
            return Ok(());
        }

        let result = self
            .send_unary(UnaryRequest::delete(self.inner.endpoints.session(session.id())))
            .await;
        session.set_state(SessionState::Deleted);
        lock_unpoisoned(&self.inner.sessions).remove(session.id());

        match result {
            Ok(_) => {
                info!(session_id = %session.id(), "session deleted");
                Ok(())
            }
            Err(error) if error.is_not_found() => {
                debug!(session_id = %session.id(), "session already gone on server");
                Ok(())
            }
            Err(error) => {
                warn!(session_id = %session.id(), error = %error, "session delete failed");
                Err(SessionError::transport("delete_session", session.id(), error))
            }
        }
    }

    /// Open an event stream for `input`. No request is sent until the first
    /// [`EventStream::next`].
    pub fn prompt(
        &self,
        session: &Session,
        input: impl Into<String>,
    ) -> Result<EventStream, SessionError> {
        self.open_prompt(session, input.into(), None)
    }

    /// Re-attach to `input` after an event the caller already holds, such as
    /// [`EventStream::last_event_id`] saved from an earlier stream. The server
    /// skips everything up to `last_event_id` and so does the stream.
    pub fn resume_prompt(
        &self,
        session: &Session,
        input: impl Into<String>,
        last_event_id: impl Into<String>,
    ) -> Result<EventStream, SessionError> {
        self.open_prompt(session, input.into(), Some(last_event_id.into()))
    }

    fn open_prompt(
        &self,
        session: &Session,
        input: String,
        last_event_id: Option<String>,
    ) -> Result<EventStream, SessionError> {
        let body = serde_json::to_value(PromptRequest::new(input))
            .map_err(|error| SessionError::transport("prompt", session.id(), error.into()))?;
        let (stream_id, cancel) = session.open_stream("prompt")?;
        debug!(
            session_id = %session.id(),
            stream_id,
            last_event_id = last_event_id.as_deref().unwrap_or(""),
            "event stream created"
        );

        let mut request = StreamRequest::new(self.inner.endpoints.prompt(session.id()), body);
        if let Some(last_event_id) = last_event_id {
            request = request.resume_after(last_event_id);
        }
        Ok(EventStream::new(
            session.clone(),
            stream_id,
            cancel,
            Arc::clone(&self.inner.transport),
            request,
            &self.inner.config,
            self.inner.schedule.clone(),
        ))
    }

    /// Answer a pending approval request observed on `session`'s stream.
    pub async fn respond_approval(
        &self,
        session: &Session,
        request_id: &str,
        decision: ApprovalDecision,
    ) -> Result<(), SessionError> {
        let body = serde_json::to_value(ApprovalResponseBody {
            decision,
            reason: None,
        })
        .map_err(|error| SessionError::transport("respond_approval", session.id(), error.into()))?;

        session
            .lock()
            .approvals
            .begin_response(session.id(), request_id, decision)?;

        let url = self.inner.endpoints.approval(session.id(), request_id);
        match self.send_unary(UnaryRequest::post(url, body)).await {
            Ok(_) => {
                info!(session_id = %session.id(), request_id, %decision, "approval answered");
                Ok(())
            }
            Err(error) => {
                session.rollback_approval(request_id);
                Err(SessionError::transport("respond_approval", session.id(), error))
            }
        }
    }

    pub fn pending_approvals(&self, session: &Session) -> Vec<ApprovalRequest> {
        session.pending_approvals()
    }

    /// Create a session that is deleted when the returned guard closes or drops.
    pub async fn guard(&self, config: SessionConfig) -> Result<SessionGuard, SessionError> {
        let session = self.create_session(config).await?;
        Ok(SessionGuard::new(self.clone(), session))
    }

    /// Run `body` with a fresh session and delete it afterwards, whatever the outcome.
    ///
    /// An error from `body` takes precedence over an error from the delete.
    pub async fn with_session<F, Fut, T>(
        &self,
        config: SessionConfig,
        body: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        let guard = self.guard(config).await?;
        let result = body(guard.session().clone()).await;
        let closed = guard.close().await;
        let value = result?;
        closed?;
        Ok(value)
    }

    /// One-shot prompt: create a session with the configured bundle, collect the
    /// whole response, delete the session.
    pub async fn run(&self, text: impl Into<String>) -> Result<Response, SessionError> {
        let text = text.into();
        let client = self.clone();
        self.with_session(
            SessionConfig::new(self.inner.config.bundle.clone()),
            |session| async move {
                let stream = client.prompt(&session, text)?;
                collect_response(stream).await
            },
        )
        .await
    }

    async fn send_unary(&self, request: UnaryRequest) -> Result<Value, TransportError> {
        let mut attempt = 0;
        loop {
            match self.inner.transport.send(request.clone()).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;
                    match self.inner.schedule.on_connect_failure(&error, attempt) {
                        RetryDecision::Retry { delay } => {
                            warn!(
                                method = %request.method,
                                url = %request.url,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "request failed; retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::Resume { .. } | RetryDecision::Fail => return Err(error),
                    }
                }
            }
        }
    }
}
