use std::sync::Arc;

use keygate_channel::ChannelRegistry;
use keygate_pool::{CredentialPool, Group};
use keygate_stream::StreamProcessor;
use tracing::warn;

use crate::logs::{LogRecord, LogRing, SettingsStore};
use crate::upstream::UpstreamClient;

const LOG_RING_CAPACITY: usize = 2_048;

/// Everything a request handler needs, wired once at startup and shared
/// behind `Arc`. Constructor injection only; no globals.
pub struct AppState {
    pub pool: Arc<CredentialPool>,
    pub registry: Arc<ChannelRegistry>,
    pub processor: Arc<StreamProcessor>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub settings_store: Arc<dyn SettingsStore>,
    logs: LogRing,
}

impl AppState {
    pub fn new(
        pool: Arc<CredentialPool>,
        registry: Arc<ChannelRegistry>,
        processor: Arc<StreamProcessor>,
        upstream: Arc<dyn UpstreamClient>,
        settings_store: Arc<dyn SettingsStore>,
    ) -> Self {
        Self {
            pool,
            registry,
            processor,
            upstream,
            settings_store,
            logs: LogRing::new(LOG_RING_CAPACITY),
        }
    }

    pub async fn resolve_group(&self, name: &str) -> Option<Group> {
        self.pool.group_by_name(name).await
    }

    /// Log insertion must never fail a user request.
    pub fn record_log(&self, record: LogRecord) {
        self.logs.insert(record);
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<LogRecord> {
        self.logs.recent(limit)
    }

    /// Persists the current settings; a failing store is only a warning.
    pub async fn persist_settings(&self) {
        let settings = self.processor.settings();
        if let Err(message) = self.settings_store.save(&settings).await {
            warn!(%message, "settings persistence failed");
        }
    }
}
