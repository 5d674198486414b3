//! Pull-based event stream over one prompt.
//!
//! [`EventStream`] is an explicit state machine over a decoder, an optional
//! transport body and the id of the last delivered event. Each call to
//! [`EventStream::next`] first drains frames that are already buffered and
//! only then reads one more chunk from the transport, so at most one read is
//! ever in flight ahead of the consumer. Cancellation is a separate entry
//! point that drops the body and releases the session's stream slot.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use session_transport::{
    decode_frame, BackoffSchedule, ByteStream, ClientConfig, DecodeError, Event, EventKind,
    Frame, RetryDecision, SseDecoder, StreamRequest, Transport, TransportError,
};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::reconnect::Reconnector;
use crate::session::Session;

/// Identifies one stream within its session.
pub type StreamId = u64;

/// Code of the `error` event synthesized when a stream breaks for good.
pub const STREAM_INTERRUPTED: &str = "stream.interrupted";

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Shared flag that cancels an [`EventStream`] from anywhere.
///
/// The stream checks it before every step and while awaiting transport bytes.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No connection attempt yet.
    Idle,
    Open,
    Finished,
}

pub struct EventStream {
    session: Session,
    stream_id: StreamId,
    transport: Arc<dyn Transport>,
    request: StreamRequest,
    decoder: SseDecoder,
    body: Option<ByteStream>,
    phase: Phase,
    reconnector: Reconnector,
    cancel: CancelHandle,
    idle_timeout: Duration,
    /// Events at or before this id were already delivered before a resume.
    resume_floor: Option<String>,
    frames_received: u64,
    failure: Option<SessionError>,
}

impl EventStream {
    pub(crate) fn new(
        session: Session,
        stream_id: StreamId,
        cancel: CancelHandle,
        transport: Arc<dyn Transport>,
        request: StreamRequest,
        config: &ClientConfig,
        schedule: BackoffSchedule,
    ) -> Self {
        let mut decoder = SseDecoder::new(config.max_frame_bytes);
        if let Some(last_event_id) = request.last_event_id.clone() {
            decoder = decoder.with_last_event_id(last_event_id);
        }
        let resume_floor = request.last_event_id.clone();
        Self {
            session,
            stream_id,
            transport,
            request,
            decoder,
            body: None,
            phase: Phase::Idle,
            reconnector: Reconnector::new(schedule),
            cancel,
            idle_timeout: config.idle_timeout,
            resume_floor,
            frames_received: 0,
            failure: None,
        }
    }

    /// Pull the next event.
    ///
    /// Returns `None` once the stream has ended: after `done`, after the server
    /// closed the body, after a terminal failure, or after cancellation.
    pub async fn next(&mut self) -> Option<Result<Event, SessionError>> {
        loop {
            if self.phase == Phase::Finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.close();
                return None;
            }

            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Some(item) = self.accept(frame) {
                        return Some(item);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(source) => return Some(Err(self.fail_decode(source))),
            }

            let step = if self.body.is_none() {
                self.connect().await.map(|()| true)
            } else {
                self.read_chunk().await
            };
            match step {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        session_id = %self.session.id(),
                        last_event_id = self.decoder.last_event_id().unwrap_or(""),
                        "server closed event stream"
                    );
                    self.close();
                    return None;
                }
                Err(error) => {
                    if let Some(item) = self.recover(error).await {
                        return Some(item);
                    }
                }
            }
        }
    }

    /// Stop the stream and close its connection. Idempotent.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.close();
    }

    /// Handle that cancels this stream from another task.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Id of the last completed frame, the point a resume continues from.
    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.decoder.last_event_id()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    /// The mid-stream failure behind a synthesized `stream.interrupted` event.
    #[must_use]
    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<SessionError> {
        self.failure.take()
    }

    /// Adapt into a [`Stream`] with the same pull semantics.
    pub fn into_stream(self) -> impl Stream<Item = Result<Event, SessionError>> + Send {
        stream::unfold(self, |mut events| async move {
            let item = events.next().await?;
            Some((item, events))
        })
    }

    fn accept(&mut self, frame: Frame) -> Option<Result<Event, SessionError>> {
        if let Some(id) = frame.id.as_deref() {
            if self.is_replayed(id) {
                debug!(session_id = %self.session.id(), event_id = id, "skipping replayed event");
                return None;
            }
        }

        let event = match decode_frame(&frame) {
            Ok(event) => event,
            Err(source) => return Some(Err(self.fail_decode(source))),
        };
        self.frames_received += 1;
        self.reconnector.on_frame();

        match &event.kind {
            EventKind::ApprovalRequired {
                request_id,
                prompt,
                options,
                ..
            } => {
                self.session
                    .observe_approval(self.stream_id, request_id, prompt, options);
            }
            EventKind::Done { .. } => self.close(),
            _ => {}
        }
        Some(Ok(event))
    }

    fn is_replayed(&self, id: &str) -> bool {
        self.resume_floor
            .as_deref()
            .is_some_and(|floor| is_at_or_before(id, floor))
    }

    /// Open the body. Waiting longer than the idle timeout for response
    /// headers counts as a failed attempt.
    async fn connect(&mut self) -> Result<(), TransportError> {
        let idle_timeout = self.idle_timeout;
        let open = tokio::time::timeout(idle_timeout, self.transport.open_stream(self.request.clone()));
        let body = match await_or_cancel(open, &self.cancel).await? {
            Ok(body) => body?,
            Err(_) => return Err(TransportError::IdleTimeout(idle_timeout)),
        };
        debug!(
            session_id = %self.session.id(),
            resumed = self.request.last_event_id.is_some(),
            "event stream open"
        );
        self.body = Some(body);
        self.phase = Phase::Open;
        Ok(())
    }

    /// Read one chunk into the decoder. `Ok(false)` means the server closed the body.
    async fn read_chunk(&mut self) -> Result<bool, TransportError> {
        let Some(body) = self.body.as_mut() else {
            return Ok(false);
        };
        let idle_timeout = self.idle_timeout;
        let read = tokio::time::timeout(idle_timeout, body.next());
        match await_or_cancel(read, &self.cancel).await? {
            Err(_) => Err(TransportError::IdleTimeout(idle_timeout)),
            Ok(None) => Ok(false),
            Ok(Some(chunk)) => {
                self.decoder.feed(&chunk?);
                Ok(true)
            }
        }
    }

    async fn recover(&mut self, error: TransportError) -> Option<Result<Event, SessionError>> {
        if matches!(error, TransportError::Cancelled) {
            self.close();
            return None;
        }
        self.body = None;
        self.decoder.reset();

        if self.frames_received == 0 {
            return match self.reconnector.on_connect_failure(&error) {
                RetryDecision::Retry { delay } => {
                    warn!(
                        session_id = %self.session.id(),
                        attempt = self.reconnector.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "event stream connect failed; retrying"
                    );
                    pause(&self.cancel, delay).await;
                    None
                }
                RetryDecision::Resume { .. } | RetryDecision::Fail => {
                    let attempts = self.reconnector.attempts();
                    self.close();
                    Some(Err(SessionError::ConnectError {
                        attempts,
                        source: error,
                    }))
                }
            };
        }

        let cursor = self.decoder.last_event_id().map(str::to_owned);
        match self.reconnector.on_mid_stream_failure(
            &error,
            cursor.as_deref(),
            self.decoder.retry_hint(),
        ) {
            RetryDecision::Resume {
                delay,
                last_event_id,
            } => {
                warn!(
                    session_id = %self.session.id(),
                    last_event_id = %last_event_id,
                    resume = self.reconnector.resumes(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "event stream interrupted; resuming"
                );
                self.request = self.request.resume_after(last_event_id.clone());
                // Replayed frames can pull the cursor back; the floor only moves forward.
                self.resume_floor = match self.resume_floor.take() {
                    Some(floor) if is_at_or_before(&last_event_id, &floor) => Some(floor),
                    _ => Some(last_event_id),
                };
                pause(&self.cancel, delay).await;
                None
            }
            RetryDecision::Retry { .. } | RetryDecision::Fail => {
                warn!(
                    session_id = %self.session.id(),
                    last_event_id = cursor.as_deref().unwrap_or(""),
                    error = %error,
                    "event stream interrupted"
                );
                let message = error.to_string();
                self.failure = Some(SessionError::MidStreamError {
                    session_id: self.session.id().to_string(),
                    last_event_id: cursor,
                    source: error,
                });
                self.close();
                Some(Ok(Event::new(
                    None,
                    EventKind::Error {
                        code: Some(STREAM_INTERRUPTED.to_string()),
                        message: Some(message),
                    },
                )))
            }
        }
    }

    fn fail_decode(&mut self, source: DecodeError) -> SessionError {
        warn!(session_id = %self.session.id(), error = %source, "undecodable frame; closing stream");
        self.close();
        SessionError::DecodeError {
            session_id: self.session.id().to_string(),
            source,
        }
    }

    fn close(&mut self) {
        if self.phase == Phase::Finished {
            return;
        }
        self.phase = Phase::Finished;
        self.body = None;
        self.decoder.reset();
        self.session.release_stream(self.stream_id);
        debug!(session_id = %self.session.id(), stream_id = self.stream_id, "event stream closed");
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("session_id", &self.session.id())
            .field("stream_id", &self.stream_id)
            .field("phase", &self.phase)
            .field("last_event_id", &self.decoder.last_event_id())
            .field("connected", &self.body.is_some())
            .finish()
    }
}

/// Numeric ids compare by value; anything else only matches itself.
fn is_at_or_before(id: &str, floor: &str) -> bool {
    match (id.parse::<u64>(), floor.parse::<u64>()) {
        (Ok(id), Ok(floor)) => id <= floor,
        _ => id == floor,
    }
}

async fn pause(cancel: &CancelHandle, delay: Duration) {
    // A cancelled sleep is picked up by the next loop iteration.
    let _ = await_or_cancel(tokio::time::sleep(delay), cancel).await;
}

async fn await_or_cancel<F>(future: F, cancel: &CancelHandle) -> Result<F::Output, TransportError>
where
    F: Future,
{
    let mut future = Box::pin(future);

    loop {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            return Ok(output);
        }
    }
}
