#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use agent_session::{
    ByteStream, ClientConfig, Method, RetryConfig, SessionClient, StreamRequest, Transport,
    TransportError, UnaryRequest,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use serde_json::{json, Value};

pub enum Chunk {
    Bytes(Vec<u8>),
    Fail(TransportError),
    /// Never yields; the body stays open and silent.
    Stall,
}

pub enum StreamScript {
    Body(Vec<Chunk>),
    Refuse(TransportError),
    /// Accepts the request but never answers with headers.
    Hang,
}

struct UnaryScript {
    method: Method,
    path_suffix: String,
    reply: Result<Value, TransportError>,
}

#[derive(Default)]
pub struct TransportTrace {
    pub unary_requests: Vec<UnaryRequest>,
    pub stream_requests: Vec<StreamRequest>,
    unary_scripts: Vec<UnaryScript>,
    stream_scripts: VecDeque<StreamScript>,
    sessions_created: usize,
}

/// In-memory [`Transport`] that replays scripted replies and records requests.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    trace: Arc<Mutex<TransportTrace>>,
    bodies_opened: Arc<AtomicUsize>,
    bodies_dropped: Arc<AtomicUsize>,
    chunks_pulled: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next unary request whose method matches and whose
    /// URL path ends with `path_suffix`.
    pub fn push_unary(
        &self,
        method: Method,
        path_suffix: &str,
        reply: Result<Value, TransportError>,
    ) {
        lock_unpoisoned(&self.trace).unary_scripts.push(UnaryScript {
            method,
            path_suffix: path_suffix.to_string(),
            reply,
        });
    }

    pub fn push_stream(&self, script: StreamScript) {
        lock_unpoisoned(&self.trace).stream_scripts.push_back(script);
    }

    pub fn push_body(&self, chunks: Vec<Chunk>) {
        self.push_stream(StreamScript::Body(chunks));
    }

    pub fn trace(&self) -> MutexGuard<'_, TransportTrace> {
        lock_unpoisoned(&self.trace)
    }

    pub fn unary_requests(&self) -> Vec<UnaryRequest> {
        self.trace().unary_requests.clone()
    }

    pub fn stream_requests(&self) -> Vec<StreamRequest> {
        self.trace().stream_requests.clone()
    }

    pub fn requests_to(&self, method: Method, path_suffix: &str) -> usize {
        self.trace()
            .unary_requests
            .iter()
            .filter(|request| request.method == method && request.url.path().ends_with(path_suffix))
            .count()
    }

    pub fn bodies_opened(&self) -> usize {
        self.bodies_opened.load(Ordering::SeqCst)
    }

    pub fn bodies_dropped(&self) -> usize {
        self.bodies_dropped.load(Ordering::SeqCst)
    }

    pub fn chunks_pulled(&self) -> usize {
        self.chunks_pulled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: UnaryRequest) -> Result<Value, TransportError> {
        let mut trace = lock_unpoisoned(&self.trace);
        trace.unary_requests.push(request.clone());

        let path = request.url.path().to_string();
        let scripted = trace
            .unary_scripts
            .iter()
            .position(|script| script.method == request.method && path.ends_with(&script.path_suffix));
        if let Some(index) = scripted {
            return trace.unary_scripts.remove(index).reply;
        }

        if request.method == Method::Post && path.ends_with("/sessions") {
            trace.sessions_created += 1;
            return Ok(json!({ "session_id": format!("sess-{}", trace.sessions_created) }));
        }
        Ok(Value::Null)
    }

    async fn open_stream(&self, request: StreamRequest) -> Result<ByteStream, TransportError> {
        let script = {
            let mut trace = lock_unpoisoned(&self.trace);
            trace.stream_requests.push(request);
            trace.stream_scripts.pop_front()
        };

        match script {
            Some(StreamScript::Body(chunks)) => {
                self.bodies_opened.fetch_add(1, Ordering::SeqCst);
                Ok(scripted_body(
                    chunks,
                    DropCounter(Arc::clone(&self.bodies_dropped)),
                    Arc::clone(&self.chunks_pulled),
                ))
            }
            Some(StreamScript::Refuse(error)) => Err(error),
            Some(StreamScript::Hang) => std::future::pending().await,
            None => Err(TransportError::Connect("no scripted stream left".to_string())),
        }
    }
}

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn scripted_body(
    chunks: Vec<Chunk>,
    on_drop: DropCounter,
    pulls: Arc<AtomicUsize>,
) -> ByteStream {
    let state = (VecDeque::from(chunks), on_drop, pulls);
    Box::pin(stream::unfold(state, |(mut chunks, on_drop, pulls)| async move {
        pulls.fetch_add(1, Ordering::SeqCst);
        match chunks.pop_front()? {
            Chunk::Bytes(bytes) => Some((Ok(Bytes::from(bytes)), (chunks, on_drop, pulls))),
            Chunk::Fail(error) => Some((Err(error), (chunks, on_drop, pulls))),
            Chunk::Stall => {
                std::future::pending::<()>().await;
                None
            }
        }
    }))
}

/// One SSE frame carrying a `{type, data}` envelope.
pub fn frame(id: Option<&str>, event_type: &str, data: Value) -> Vec<u8> {
    let envelope = json!({ "type": event_type, "data": data });
    let mut out = String::new();
    if let Some(id) = id {
        out.push_str(&format!("id: {id}\n"));
    }
    out.push_str(&format!("data: {envelope}\n\n"));
    out.into_bytes()
}

pub fn delta(id: &str, text: &str) -> Chunk {
    Chunk::Bytes(frame(Some(id), "content.delta", json!({ "delta": text })))
}

pub fn done(id: &str) -> Chunk {
    Chunk::Bytes(frame(Some(id), "done", json!({ "status": "completed" })))
}

pub fn approval(id: &str, request_id: &str) -> Chunk {
    Chunk::Bytes(frame(
        Some(id),
        "approval.required",
        json!({ "request_id": request_id, "prompt": "run rm -rf build?", "options": ["approve", "deny"] }),
    ))
}

pub fn reset() -> Chunk {
    Chunk::Fail(TransportError::Read("connection reset by peer".to_string()))
}

/// Retry settings fast enough for tests.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5))
}

pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_retry(fast_retry())
        .with_idle_timeout(Duration::from_millis(200))
}

pub fn client_with(config: ClientConfig) -> (SessionClient, ScriptedTransport) {
    let transport = ScriptedTransport::new();
    let client = SessionClient::with_transport(config, Arc::new(transport.clone()))
        .expect("client should build");
    (client, transport)
}

pub fn client() -> (SessionClient, ScriptedTransport) {
    client_with(test_config())
}

pub fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
