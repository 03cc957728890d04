use keygate_common::{Headers, header_get};

/// Joins a base URL and a path without doubling slashes.
pub(crate) fn build_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

/// Appends one query parameter, value percent-encoded.
pub(crate) fn append_query_param(url: &str, name: &str, value: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{name}={}", urlencoding::encode(value))
}

pub(crate) fn accept_is_event_stream(headers: &Headers) -> bool {
    header_get(headers, "accept")
        .map(|v| v.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

pub(crate) fn query_has_stream_true(query: Option<&str>) -> bool {
    let Some(query) = query else {
        return false;
    };
    query
        .split('&')
        .any(|pair| matches!(pair.split_once('='), Some(("stream", "true"))))
}

pub(crate) fn body_has_stream_true(body: &[u8]) -> bool {
    if body.is_empty() {
        return false;
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

pub(crate) fn body_model(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let value = serde_json::from_slice::<serde_json::Value>(body).ok()?;
    let model = value.get("model")?.as_str()?;
    let model = model.strip_prefix("models/").unwrap_or(model);
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

/// Pulls the human-readable message out of an upstream error body, falling
/// back to the raw payload.
pub fn parse_upstream_error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return message.to_string();
        }
        if let Some(message) = value.get("error").and_then(|e| e.as_str()) {
            return message.to_string();
        }
        if let Some(message) = value.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    String::from_utf8_lossy(body).into_owned()
}
