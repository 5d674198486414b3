//! Transport-only primitives for the agent session service.
//!
//! This crate owns request building, SSE framing, wire-envelope decoding and
//! retry classification for the session endpoints. It holds no session state:
//! lifecycle, stream ownership and approval bookkeeping live in the
//! `agent_session` package that sits on top of it.
//!
//! The [`Transport`] trait is the seam between the two. [`HttpTransport`] is
//! the `reqwest` implementation used in production; tests substitute scripted
//! transports.

pub mod client;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod headers;
pub mod payload;
pub mod retry;
pub mod sse;

pub use client::{ByteStream, HttpTransport, Method, StreamRequest, Transport, UnaryRequest};
pub use config::{ClientConfig, RetryConfig};
pub use endpoints::Endpoints;
pub use error::{DecodeError, TransportError};
pub use events::{decode_frame, Event, EventKind};
pub use payload::{ApprovalDecision, CreateSessionRequest, PromptRequest};
pub use retry::{BackoffSchedule, RetryDecision};
pub use sse::{Frame, SseDecoder};
