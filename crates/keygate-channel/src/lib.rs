mod anthropic;
mod gemini;
mod http;
mod openai;
mod registry;
mod request;
mod util;

use async_trait::async_trait;

use keygate_common::Headers;
use keygate_pool::Group;

pub use http::ValidationHttp;
pub use registry::{ChannelKeyValidator, ChannelRegistry, register_builtin_channels};
pub use request::{HttpMethod, UpstreamRequest};
pub use util::parse_upstream_error_message;

pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone)]
pub enum ChannelError {
    UnknownChannel(String),
    MissingUpstream,
    InvalidRequest(String),
    /// Validation endpoint answered non-2xx; carries the upstream message.
    Upstream(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::UnknownChannel(kind) => write!(f, "unknown channel kind: {kind}"),
            ChannelError::MissingUpstream => write!(f, "group has no upstream url"),
            ChannelError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            ChannelError::Upstream(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Per-provider adapter: auth rewriting, stream detection, model extraction
/// and key validation for one upstream family.
#[async_trait]
pub trait Channel: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Rewrites the outgoing request so it authenticates with the upstream's
    /// native scheme.
    fn modify_request(
        &self,
        req: &mut UpstreamRequest,
        key: &str,
        group: &Group,
    ) -> ChannelResult<()>;

    /// Whether the client asked for a streamed response.
    fn is_stream(&self, path: &str, query: Option<&str>, headers: &Headers, body: &[u8]) -> bool;

    /// Model name for logging and routing decisions.
    fn extract_model(&self, path: &str, body: &[u8]) -> Option<String>;

    /// Minimal generation request against the group's validation endpoint.
    /// 2xx means the key works; anything else carries the upstream-parsed
    /// error message.
    async fn validate_key(&self, key: &str, group: &Group) -> ChannelResult<()>;
}
