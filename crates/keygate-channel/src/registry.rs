use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use keygate_pool::{Group, KeyValidator};

use crate::anthropic::AnthropicChannel;
use crate::gemini::GeminiChannel;
use crate::http::ValidationHttp;
use crate::openai::OpenAiChannel;
use crate::{Channel, ChannelError, ChannelResult};

/// Maps a group's channel kind to its adapter.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<&'static str, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, channel: Arc<dyn Channel>) {
        debug!(kind = channel.kind(), "channel registered");
        self.channels.insert(channel.kind(), channel);
    }

    pub fn get(&self, kind: &str) -> ChannelResult<Arc<dyn Channel>> {
        self.channels
            .get(kind)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownChannel(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.channels.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

pub fn register_builtin_channels(registry: &mut ChannelRegistry, http: ValidationHttp) {
    registry.register(Arc::new(GeminiChannel::new(http.clone())));
    registry.register(Arc::new(OpenAiChannel::new(http.clone())));
    registry.register(Arc::new(AnthropicChannel::new(http)));
}

/// Bridges the pool's revalidation task to the per-channel probes.
pub struct ChannelKeyValidator {
    registry: Arc<ChannelRegistry>,
}

impl ChannelKeyValidator {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl KeyValidator for ChannelKeyValidator {
    async fn validate(&self, key: &str, group: &Group) -> Result<(), String> {
        let channel = self
            .registry
            .get(&group.channel)
            .map_err(|err| err.to_string())?;
        channel
            .validate_key(key, group)
            .await
            .map_err(|err| err.to_string())
    }
}
