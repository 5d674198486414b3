use std::collections::BTreeMap;

use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::TransportError;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_USER_AGENT: &str = "user-agent";
pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";
pub const HEADER_CACHE_CONTROL: &str = "cache-control";

pub const ACCEPT_JSON: &str = "application/json";
pub const ACCEPT_EVENT_STREAM: &str = "text/event-stream";

/// Build a deterministic header map for one request.
///
/// Every request gets a fresh `x-request-id`. Extra headers from the config
/// are lowercased and win over the defaults, except `authorization`, which is
/// only ever derived from the API key.
pub fn build_headers(
    config: &ClientConfig,
    accept: &str,
) -> Result<BTreeMap<String, String>, TransportError> {
    let mut headers = BTreeMap::new();

    headers.insert(HEADER_ACCEPT.to_owned(), accept.to_owned());
    headers.insert(HEADER_CONTENT_TYPE.to_owned(), ACCEPT_JSON.to_owned());
    if accept == ACCEPT_EVENT_STREAM {
        headers.insert(HEADER_CACHE_CONTROL.to_owned(), "no-cache".to_owned());
    }

    let user_agent = config
        .user_agent
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(default_user_agent);
    headers.insert(HEADER_USER_AGENT.to_owned(), user_agent);
    headers.insert(HEADER_REQUEST_ID.to_owned(), Uuid::new_v4().to_string());

    for (key, value) in &config.extra_headers {
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            return Err(TransportError::InvalidConfig(
                "extra header names must not be blank".to_owned(),
            ));
        }
        if key == HEADER_AUTHORIZATION {
            continue;
        }
        headers.insert(key, value.trim().to_owned());
    }

    if let Some(api_key) = config
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        headers.insert(HEADER_AUTHORIZATION.to_owned(), format!("Bearer {api_key}"));
    }

    Ok(headers)
}

fn default_user_agent() -> String {
    format!("agent-session/{}", env!("CARGO_PKG_VERSION"))
}
