use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;

use keygate_common::{Headers, header_remove, header_set};
use keygate_pool::Group;

use crate::http::ValidationHttp;
use crate::request::UpstreamRequest;
use crate::util::{
    accept_is_event_stream, body_has_stream_true, body_model, build_url,
    parse_upstream_error_message, query_has_stream_true,
};
use crate::{Channel, ChannelError, ChannelResult};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicChannel {
    http: ValidationHttp,
}

impl AnthropicChannel {
    pub fn new(http: ValidationHttp) -> Self {
        Self { http }
    }

    fn auth_headers(key: &str) -> Headers {
        vec![
            ("authorization".to_string(), format!("Bearer {key}")),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ]
    }
}

#[async_trait]
impl Channel for AnthropicChannel {
    fn kind(&self) -> &'static str {
        "anthropic"
    }

    fn modify_request(
        &self,
        req: &mut UpstreamRequest,
        key: &str,
        _group: &Group,
    ) -> ChannelResult<()> {
        header_remove(&mut req.headers, "x-api-key");
        header_set(&mut req.headers, "authorization", format!("Bearer {key}"));
        header_set(&mut req.headers, "anthropic-version", ANTHROPIC_VERSION);
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
        let (status, response) = self
            .http
            .post_json(&url, &Self::auth_headers(key), Bytes::from(body.to_string()))
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
