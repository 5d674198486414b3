//! Streaming client for the agent session service.
//!
//! Invariant: one open [`EventStream`] per [`Session`]; a second `prompt` on the
//! same session fails with [`SessionError::StreamBusy`] until the first stream
//! is exhausted, cancelled, or dropped.
//!
//! # Public API Overview
//! - Create and delete sessions through [`SessionClient`], or scope them with
//!   [`SessionClient::with_session`] and [`SessionGuard`].
//! - Pull typed events one at a time from [`EventStream::next`]; reconnects and
//!   resumes after `Last-Event-ID` happen inside the stream.
//! - Answer `approval.required` events with [`SessionClient::respond_approval`].
//! - Fold a whole prompt into a [`Response`] with [`collect_response`] or
//!   [`SessionClient::run`].
//!
//! Wire-level pieces (SSE decoding, payloads, retry classification, HTTP) live
//! in the `session_transport` crate and are re-exported where callers need them.

mod approval;
mod client;
mod error;
mod reconnect;
mod response;
mod scope;
mod session;
mod stream;

pub use approval::{ApprovalRequest, ApprovalState};
pub use client::SessionClient;
pub use error::SessionError;
pub use response::{collect_response, Response, ResponseAccumulator, ResponseStatus, ToolInvocation};
pub use scope::SessionGuard;
pub use session::{Session, SessionConfig, SessionState};
pub use stream::{CancelHandle, EventStream, StreamId, STREAM_INTERRUPTED};

/// Transport configuration and wire types.
pub use session_transport::{
    ApprovalDecision, ByteStream, ClientConfig, DecodeError, Event, EventKind, Method,
    RetryConfig, StreamRequest, Transport, TransportError, UnaryRequest,
};
