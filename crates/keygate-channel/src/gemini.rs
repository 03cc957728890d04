use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use keygate_common::{Headers, header_set};
use keygate_pool::Group;

use crate::http::ValidationHttp;
use crate::request::UpstreamRequest;
use crate::util::{
    accept_is_event_stream, append_query_param, body_has_stream_true, body_model, build_url,
    parse_upstream_error_message, query_has_stream_true,
};
use crate::{Channel, ChannelError, ChannelResult};

const STREAM_ACTION_SUFFIX: &str = ":streamGenerateContent";

pub struct GeminiChannel {
    http: ValidationHttp,
}

impl GeminiChannel {
    pub fn new(http: ValidationHttp) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Channel for GeminiChannel {
    fn kind(&self) -> &'static str {
        "gemini"
    }

    fn modify_request(
        &self,
        req: &mut UpstreamRequest,
        key: &str,
        _group: &Group,
    ) -> ChannelResult<()> {
        // The OpenAI-compatibility surface wants a Bearer token; the native
        // API authenticates through the key query parameter.
        if req.url.contains("v1beta/openai") {
            header_set(&mut req.headers, "authorization", format!("Bearer {key}"));
        } else {
            req.url = append_query_param(&req.url, "key", key);
        }
        Ok(())
    }

    fn is_stream(&self, path: &str, query: Option<&str>, headers: &Headers, body: &[u8]) -> bool {
        path.ends_with(STREAM_ACTION_SUFFIX)
            || accept_is_event_stream(headers)
            || query_has_stream_true(query)
            || body_has_stream_true(body)
    }

    fn extract_model(&self, path: &str, body: &[u8]) -> Option<String> {
        path_model(path).or_else(|| body_model(body))
    }

    async fn validate_key(&self, key: &str, group: &Group) -> ChannelResult<()> {
        let base = group
            .primary_upstream()
            .ok_or(ChannelError::MissingUpstream)?;
        let endpoint = group
            .validation_endpoint
            .replace("{model}", &group.test_model);
        let url = append_query_param(&build_url(base, &endpoint), "key", key);

        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"maxOutputTokens": 1}
        });
        let (status, response) = self
            .http
            .post_json(&url, &Vec::new(), Bytes::from(body.to_string()))
            .await
            .map_err(ChannelError::Upstream)?;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(ChannelError::Upstream(parse_upstream_error_message(
                &response,
            )))
        }
    }
}

/// Parses the `models/{name}:{action}` URL segment.
fn path_model(path: &str) -> Option<String> {
    let start = path.find("models/")? + "models/".len();
    let rest = &path[start..];
    let end = rest.find(':').unwrap_or(rest.len());
    let model = rest[..end].trim_end_matches('/');
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HttpMethod;

    fn request(url: &str) -> UpstreamRequest {
        UpstreamRequest {
            method: HttpMethod::Post,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            is_stream: true,
        }
    }

    fn group() -> Group {
        Group {
            id: 1,
            name: "g".to_string(),
            channel: "gemini".to_string(),
            upstreams: vec!["https://generativelanguage.googleapis.com".to_string()],
            validation_endpoint: "/v1beta/models/{model}:generateContent".to_string(),
            header_rules: Vec::new(),
            param_overrides: serde_json::Map::new(),
            test_model: "gemini-2.0-flash".to_string(),
            aggregate: Vec::new(),
        }
    }

    fn channel() -> GeminiChannel {
        GeminiChannel::new(ValidationHttp::new().unwrap())
    }

    #[test]
    fn native_api_uses_key_query_param() {
        let ch = channel();
        let mut req = request(
            "https://generativelanguage.googleapis.com/v1beta/models/m:streamGenerateContent?alt=sse",
        );
        ch.modify_request(&mut req, "secret", &group()).unwrap();
        assert!(req.url.ends_with("alt=sse&key=secret"));
        assert!(req.headers.is_empty());
    }

    #[test]
    fn openai_compat_surface_uses_bearer() {
        let ch = channel();
        let mut req =
            request("https://generativelanguage.googleapis.com/v1beta/openai/chat/completions");
        ch.modify_request(&mut req, "secret", &group()).unwrap();
        assert!(!req.url.contains("key="));
        assert_eq!(
            keygate_common::header_get(&req.headers, "authorization"),
            Some("Bearer secret")
        );
    }

    #[test]
    fn stream_detection_covers_all_hints() {
        let ch = channel();
        assert!(ch.is_stream("/v1beta/models/m:streamGenerateContent", None, &Vec::new(), b""));
        assert!(ch.is_stream(
            "/v1beta/models/m:generateContent",
            None,
            &vec![("accept".to_string(), "text/event-stream".to_string())],
            b""
        ));
        assert!(ch.is_stream("/v1/chat", Some("stream=true"), &Vec::new(), b""));
        assert!(ch.is_stream("/v1/chat", None, &Vec::new(), br#"{"stream": true}"#));
        assert!(!ch.is_stream("/v1beta/models/m:generateContent", None, &Vec::new(), b"{}"));
    }

    #[test]
    fn model_comes_from_path_then_body() {
        let ch = channel();
        assert_eq!(
            ch.extract_model("/v1beta/models/gemini-2.0-flash:streamGenerateContent", b""),
            Some("gemini-2.0-flash".to_string())
        );
        assert_eq!(
            ch.extract_model("/v1beta/openai/chat/completions", br#"{"model": "models/g-1"}"#),
            Some("g-1".to_string())
        );
        assert_eq!(ch.extract_model("/healthz", b"{}"), None);
    }
}
