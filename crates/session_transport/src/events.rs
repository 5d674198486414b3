use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::sse::Frame;

pub const CONTENT_DELTA: &str = "content.delta";
pub const THINKING_DELTA: &str = "thinking.delta";
pub const TOOL_CALL: &str = "tool.call";
pub const TOOL_RESULT: &str = "tool.result";
pub const APPROVAL_REQUIRED: &str = "approval.required";
pub const ERROR: &str = "error";
pub const DONE: &str = "done";

/// Typed payload of one server event, keyed by the wire `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventKind {
    #[serde(rename = "content.delta")]
    ContentDelta { delta: String },
    #[serde(rename = "thinking.delta")]
    ThinkingDelta { delta: String },
    #[serde(rename = "tool.call")]
    ToolCall {
        #[serde(default, alias = "id")]
        call_id: Option<String>,
        #[serde(alias = "tool_name")]
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    #[serde(rename = "tool.result")]
    ToolResult {
        #[serde(default, alias = "id")]
        call_id: Option<String>,
        #[serde(default, alias = "tool_name")]
        name: Option<String>,
        #[serde(default)]
        output: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// The server wants a decision before (or while) continuing.
    #[serde(rename = "approval.required")]
    ApprovalRequired {
        request_id: String,
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        options: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename = "done")]
    Done {
        #[serde(default)]
        status: Option<String>,
    },
    /// Unknown event type retained so newer servers never break older clients.
    #[serde(rename = "unknown")]
    Unknown { event_type: String, payload: Value },
}

/// One event delivered to the caller, with the id of the frame it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    #[must_use]
    pub fn new(id: Option<String>, kind: EventKind) -> Self {
        Self { id, kind }
    }

    /// Wire discriminant of this event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match &self.kind {
            EventKind::ContentDelta { .. } => CONTENT_DELTA,
            EventKind::ThinkingDelta { .. } => THINKING_DELTA,
            EventKind::ToolCall { .. } => TOOL_CALL,
            EventKind::ToolResult { .. } => TOOL_RESULT,
            EventKind::ApprovalRequired { .. } => APPROVAL_REQUIRED,
            EventKind::Error { .. } => ERROR,
            EventKind::Done { .. } => DONE,
            EventKind::Unknown { event_type, .. } => event_type,
        }
    }

    /// True for `done`, the only event that ends a stream by itself.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.kind, EventKind::Done { .. })
    }

    #[must_use]
    pub fn content_delta(&self) -> Option<&str> {
        match &self.kind {
            EventKind::ContentDelta { delta } => Some(delta),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Decode one frame into an [`Event`].
///
/// The frame data must be a JSON envelope `{"type": .., "data": ..}`. The SSE
/// `event:` name stands in for a missing `type`. A bare `[DONE]` sentinel maps
/// to [`EventKind::Done`].
pub fn decode_frame(frame: &Frame) -> Result<Event, DecodeError> {
    let id = frame.id.clone();
    let data = frame.data.trim();

    if data == "[DONE]" {
        return Ok(Event::new(id, EventKind::Done { status: None }));
    }

    let envelope: Envelope =
        serde_json::from_str(data).map_err(|source| DecodeError::InvalidJson {
            preview: preview(data),
            source,
        })?;
    let event_type = envelope
        .event_type
        .or_else(|| frame.event.clone())
        .filter(|value| !value.is_empty())
        .ok_or(DecodeError::MissingType)?;

    let kind = map_event(event_type, envelope.data)?;
    Ok(Event::new(id, kind))
}

fn map_event(event_type: String, data: Value) -> Result<EventKind, DecodeError> {
    Ok(match event_type.as_str() {
        CONTENT_DELTA => {
            let payload: DeltaPayload = decode_payload(&event_type, data)?;
            EventKind::ContentDelta {
                delta: payload.delta,
            }
        }
        THINKING_DELTA => {
            let payload: DeltaPayload = decode_payload(&event_type, data)?;
            EventKind::ThinkingDelta {
                delta: payload.delta,
            }
        }
        TOOL_CALL => {
            let payload: ToolCallPayload = decode_payload(&event_type, data)?;
            EventKind::ToolCall {
                call_id: payload.call_id,
                name: payload.name,
                arguments: payload.arguments,
            }
        }
        TOOL_RESULT => {
            let payload: ToolResultPayload = decode_payload(&event_type, data)?;
            EventKind::ToolResult {
                call_id: payload.call_id,
                name: payload.name,
                output: payload.output,
                is_error: payload.is_error,
            }
        }
        APPROVAL_REQUIRED => {
            let payload: ApprovalPayload = decode_payload(&event_type, data)?;
            EventKind::ApprovalRequired {
                request_id: payload.request_id,
                prompt: payload.prompt,
                options: payload.options,
                timeout_secs: payload.timeout_secs,
            }
        }
        ERROR => {
            let payload: ErrorPayload = decode_payload(&event_type, data)?;
            EventKind::Error {
                code: payload.code,
                message: payload.message,
            }
        }
        DONE => {
            let payload: DonePayload = decode_payload(&event_type, data)?;
            EventKind::Done {
                status: payload.status,
            }
        }
        _ => EventKind::Unknown {
            event_type,
            payload: data,
        },
    })
}

fn decode_payload<T: DeserializeOwned>(event_type: &str, data: Value) -> Result<T, DecodeError> {
    // Events without data still decode into their all-default payload.
    let data = match data {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(data).map_err(|source| DecodeError::InvalidPayload {
        event_type: event_type.to_string(),
        source,
    })
}

fn preview(data: &str) -> String {
    const LIMIT: usize = 120;
    match data.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &data[..cut]),
        None => data.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct DeltaPayload {
    delta: String,
}

#[derive(Debug, Deserialize)]
struct ToolCallPayload {
    #[serde(default, alias = "id")]
    call_id: Option<String>,
    #[serde(alias = "tool_name")]
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ToolResultPayload {
    #[serde(default, alias = "id")]
    call_id: Option<String>,
    #[serde(default, alias = "tool_name")]
    name: Option<String>,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct ApprovalPayload {
    request_id: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DonePayload {
    #[serde(default)]
    status: Option<String>,
}
