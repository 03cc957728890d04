use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use keygate_common::{Headers, header_set};
use keygate_pool::Group;

use crate::http::ValidationHttp;
use crate::request::UpstreamRequest;
use crate::util::{
    accept_is_event_stream, body_has_stream_true, body_model, build_url,
    parse_upstream_error_message, query_has_stream_true,
};
use crate::{Channel, ChannelError, ChannelResult};

/// Adapter for OpenAI-compatible upstreams (the official API and the many
/// services speaking its dialect).
pub struct OpenAiChannel {
    http: ValidationHttp,
}

impl OpenAiChannel {
    pub fn new(http: ValidationHttp) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Channel for OpenAiChannel {
    fn kind(&self) -> &'static str {
        "openai"
    }

    fn modify_request(
        &self,
        req: &mut UpstreamRequest,
        key: &str,
        _group: &Group,
    ) -> ChannelResult<()> {
        header_set(&mut req.headers, "authorization", format!("Bearer {key}"));
        Ok(())
    }

    fn is_stream(&self, _path: &str, query: Option<&str>, headers: &Headers, body: &[u8]) -> bool {
        accept_is_event_stream(headers) || query_has_stream_true(query) || body_has_stream_true(body)
    }

    fn extract_model(&self, _path: &str, body: &[u8]) -> Option<String> {
        body_model(body)
    }

    async fn validate_key(&self, key: &str, group: &Group) -> ChannelResult<()> {
        let base = group
            .primary_upstream()
            .ok_or(ChannelError::MissingUpstream)?;
        let url = build_url(base, &group.validation_endpoint);
        let body = json!({
            "model": group.test_model,
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let headers = vec![("authorization".to_string(), format!("Bearer {key}"))];
        let (status, response) = self
            .http
            .post_json(&url, &headers, Bytes::from(body.to_string()))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HttpMethod;
    use keygate_common::header_get;

    #[test]
    fn sets_bearer_authorization() {
        let ch = OpenAiChannel::new(ValidationHttp::new().unwrap());
        let mut req = UpstreamRequest {
            method: HttpMethod::Post,
            url: "https://api.openai.example/v1/chat/completions".to_string(),
            headers: Vec::new(),
            body: None,
            is_stream: true,
        };
        let group = Group {
            id: 1,
            name: "o".to_string(),
            channel: "openai".to_string(),
            upstreams: vec!["https://api.openai.example".to_string()],
            validation_endpoint: "/v1/chat/completions".to_string(),
            header_rules: Vec::new(),
            param_overrides: serde_json::Map::new(),
            test_model: "gpt-4o-mini".to_string(),
            aggregate: Vec::new(),
        };
        ch.modify_request(&mut req, "sk-pool", &group).unwrap();
        assert_eq!(
            header_get(&req.headers, "authorization"),
            Some("Bearer sk-pool")
        );
    }
}
