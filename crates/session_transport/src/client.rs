use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::ClientConfig;
use crate::endpoints::Endpoints;
use crate::error::{parse_error_message, TransportError};
use crate::headers::{build_headers, ACCEPT_EVENT_STREAM, ACCEPT_JSON, HEADER_LAST_EVENT_ID};

/// Raw body of a streaming response. Dropping it closes the connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Post => "POST",
            Self::Delete => "DELETE",
        })
    }
}

/// JSON request answered by a single JSON (or empty) body.
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<Value>,
}

impl UnaryRequest {
    #[must_use]
    pub fn post(url: Url, body: Value) -> Self {
        Self {
            method: Method::Post,
            url,
            body: Some(body),
        }
    }

    #[must_use]
    pub fn delete(url: Url) -> Self {
        Self {
            method: Method::Delete,
            url,
            body: None,
        }
    }
}

/// Request whose response body is an SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub url: Url,
    pub body: Value,
    /// Last event id seen on a previous connection for the same prompt.
    pub last_event_id: Option<String>,
    /// Ask the server not to replay the event named by `last_event_id`.
    pub skip_duplicates: bool,
}

impl StreamRequest {
    #[must_use]
    pub fn new(url: Url, body: Value) -> Self {
        Self {
            url,
            body,
            last_event_id: None,
            skip_duplicates: false,
        }
    }

    /// Same logical request, resumed after `last_event_id`.
    #[must_use]
    pub fn resume_after(&self, last_event_id: impl Into<String>) -> Self {
        Self {
            last_event_id: Some(last_event_id.into()),
            skip_duplicates: true,
            ..self.clone()
        }
    }
}

/// Outbound HTTP seam used by the session layer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a unary request. Non-success statuses map to [`TransportError::Status`].
    async fn send(&self, request: UnaryRequest) -> Result<Value, TransportError>;

    /// Open a streaming request and return its raw body.
    async fn open_stream(&self, request: StreamRequest) -> Result<ByteStream, TransportError>;
}

/// [`Transport`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: Client,
    config: ClientConfig,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        Endpoints::new(&config.base_url)?;
        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(TransportError::from)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn build_headers(&self, accept: &str) -> Result<HeaderMap, TransportError> {
        let headers = build_headers(&self.config, accept)?;
        to_header_map(headers)
    }

    pub fn build_unary(&self, request: &UnaryRequest) -> Result<RequestBuilder, TransportError> {
        let method = match request.method {
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self
            .http
            .request(method, request.url.clone())
            .headers(self.build_headers(ACCEPT_JSON)?)
            .timeout(self.config.request_timeout);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }

    pub fn build_stream(&self, request: &StreamRequest) -> Result<RequestBuilder, TransportError> {
        let mut headers = self.build_headers(ACCEPT_EVENT_STREAM)?;
        let mut url = request.url.clone();
        if let Some(last_event_id) = &request.last_event_id {
            headers.insert(
                HeaderName::from_static(HEADER_LAST_EVENT_ID),
                HeaderValue::from_str(last_event_id).map_err(|_| {
                    TransportError::InvalidConfig(format!(
                        "last event id is not a valid header value: {last_event_id}"
                    ))
                })?,
            );
            if request.skip_duplicates {
                url.query_pairs_mut().append_pair("skip_duplicates", "true");
            }
        }
        // No overall timeout: the body stays open for as long as the agent runs.
        Ok(self.http.post(url).headers(headers).json(&request.body))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: UnaryRequest) -> Result<Value, TransportError> {
        debug!(method = %request.method, url = %request.url, "sending request");
        let response = self.build_unary(&request)?.send().await?;
        let response = ensure_success(response).await?;
        let body = response.bytes().await.map_err(TransportError::from_body)?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|error| TransportError::InvalidResponse(error.to_string()))
    }

    async fn open_stream(&self, request: StreamRequest) -> Result<ByteStream, TransportError> {
        debug!(
            url = %request.url,
            last_event_id = request.last_event_id.as_deref().unwrap_or(""),
            "opening event stream"
        );
        let response = self.build_stream(&request)?.send().await?;
        let response = ensure_success(response).await?;
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from_body));
        Ok(Box::pin(body))
    }
}

async fn ensure_success(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        message: parse_error_message(status.as_u16(), &body),
    })
}

fn to_header_map(headers: BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut out = HeaderMap::new();
    for (key, value) in headers {
        out.insert(
            HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
                TransportError::InvalidConfig(format!("invalid header key: {key}"))
            })?,
            HeaderValue::from_str(&value).map_err(|_| {
                TransportError::InvalidConfig(format!("invalid header value for {key}"))
            })?,
        );
    }
    Ok(out)
}
