use serde_json::Value;
use session_transport::{Event, EventKind};

use crate::error::SessionError;
use crate::stream::EventStream;

/// How a collected stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    /// The server sent `done`.
    Completed { status: Option<String> },
    /// The server closed the stream without `done`.
    Ended,
    /// The stream broke and could not be resumed.
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub call_id: Option<String>,
    pub name: String,
    pub arguments: Value,
    pub output: Option<Value>,
    pub is_error: bool,
}

/// Everything a prompt produced, folded from its events in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub session_id: String,
    pub text: String,
    pub thinking: String,
    pub tools: Vec<ToolInvocation>,
    /// `error` events reported by the server while the stream kept going.
    pub errors: Vec<String>,
    pub events: Vec<Event>,
    pub status: ResponseStatus,
}

impl Response {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self.status, ResponseStatus::Completed { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResponseAccumulator {
    text: String,
    thinking: String,
    tools: Vec<ToolInvocation>,
    errors: Vec<String>,
    events: Vec<Event>,
    done: Option<Option<String>>,
    failure: Option<String>,
}

impl ResponseAccumulator {
    pub fn push(&mut self, event: Event) {
        match &event.kind {
            EventKind::ContentDelta { delta } => self.text.push_str(delta),
            EventKind::ThinkingDelta { delta } => self.thinking.push_str(delta),
            EventKind::ToolCall {
                call_id,
                name,
                arguments,
            } => self.tools.push(ToolInvocation {
                call_id: call_id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
                output: None,
                is_error: false,
            }),
            EventKind::ToolResult {
                call_id,
                output,
                is_error,
                ..
            } => {
                let matching = self.tools.iter_mut().rev().find(|tool| {
                    tool.output.is_none() && (call_id.is_none() || tool.call_id == *call_id)
                });
                if let Some(tool) = matching {
                    tool.output = Some(output.clone());
                    tool.is_error = *is_error;
                }
            }
            EventKind::Error { code, message } => {
                let message = error_message(message.as_deref());
                self.errors.push(match code {
                    Some(code) => format!("{message} ({code})"),
                    None => message,
                });
            }
            EventKind::Done { status } => self.done = Some(status.clone()),
            EventKind::ApprovalRequired { .. } | EventKind::Unknown { .. } => {}
        }
        self.events.push(event);
    }

    /// Record the event that ended a broken stream.
    pub fn push_failure(&mut self, event: Event) {
        let message = match &event.kind {
            EventKind::Error { message, .. } => error_message(message.as_deref()),
            _ => "stream failed".to_string(),
        };
        self.failure = Some(message);
        self.events.push(event);
    }

    #[must_use]
    pub fn finish(self, session_id: impl Into<String>) -> Response {
        let status = match (self.failure, self.done) {
            (Some(message), _) => ResponseStatus::Failed { message },
            (None, Some(status)) => ResponseStatus::Completed { status },
            (None, None) => ResponseStatus::Ended,
        };
        Response {
            session_id: session_id.into(),
            text: self.text,
            thinking: self.thinking,
            tools: self.tools,
            errors: self.errors,
            events: self.events,
            status,
        }
    }
}

fn error_message(message: Option<&str>) -> String {
    message.unwrap_or("unknown error").to_string()
}

/// Drain `stream` into a [`Response`].
///
/// A decode error or a failed connect is returned as is. A stream that breaks
/// after delivering events still yields its partial response with
/// [`ResponseStatus::Failed`].
pub async fn collect_response(mut stream: EventStream) -> Result<Response, SessionError> {
    let mut accumulator = ResponseAccumulator::default();
    while let Some(event) = stream.next().await {
        let event = event?;
        // The stream records its failure together with the last event it yields.
        if stream.failure().is_some() {
            accumulator.push_failure(event);
        } else {
            accumulator.push(event);
        }
    }
    Ok(accumulator.finish(stream.session().id()))
}
