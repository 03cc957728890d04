use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use keygate_common::ProxySettings;

/// One request-level log row, as served by `GET /admin/recent-logs`.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub trace_id: String,
    pub group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub status: u16,
    pub elapsed_ms: u64,
    pub is_stream: bool,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interruption: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bounded in-memory log buffer. Inserts never fail and never block a user
/// request; when full, the oldest row goes first.
#[derive(Debug)]
pub struct LogRing {
    inner: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&self, record: LogRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(record);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<LogRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Persistence seam for runtime settings. The relational store behind the
/// admin panel implements this; the core only ever loads and saves.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Option<ProxySettings>;
    async fn save(&self, settings: &ProxySettings) -> Result<(), String>;
}

#[derive(Default)]
pub struct MemorySettingsStore {
    inner: RwLock<Option<ProxySettings>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn load(&self) -> Option<ProxySettings> {
        self.inner.read().await.clone()
    }

    async fn save(&self, settings: &ProxySettings) -> Result<(), String> {
        *self.inner.write().await = Some(settings.clone());
        Ok(())
    }
}
