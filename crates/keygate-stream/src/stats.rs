use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::retry::InterruptionReason;

const SIGNIFICANT_STREAMS: u64 = 10;

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    pub total_streams: u64,
    pub successful_streams: u64,
    pub interrupted_streams: u64,
    pub retries: u64,
    pub thoughts_filtered: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetailedStats {
    #[serde(flatten)]
    pub stream: StreamStats,
    /// Terminal interruptions by reason.
    pub interruptions: BTreeMap<&'static str, u64>,
    pub avg_stream_ms: u64,
    pub avg_retry_ms: u64,
    pub uptime_s: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: HealthVerdict,
    pub success_rate: f64,
    pub total_streams: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_streams: u64,
    successful_streams: u64,
    interrupted_streams: u64,
    retries: u64,
    thoughts_filtered: u64,
    stream_duration: Duration,
    retry_attempts: u64,
    retry_duration: Duration,
    interruptions: BTreeMap<&'static str, u64>,
}

/// Process-wide stream counters. All counters are strictly monotonic; the
/// only reset path is [`StatsCollector::reset`] behind the admin endpoint.
/// Reads hand out copies, never references into the guarded state.
#[derive(Debug)]
pub struct StatsCollector {
    inner: RwLock<StatsInner>,
    started: Instant,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StatsInner::default()),
            started: Instant::now(),
        }
    }

    pub fn record_stream_start(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.total_streams += 1;
    }

    pub fn record_stream_success(&self, duration: Duration, retries: u32) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.successful_streams += 1;
        inner.retries += retries as u64;
        inner.stream_duration += duration;
    }

    /// Counts one classified interruption, terminal or not. A stream that
    /// recovers through a retry still leaves its mark here.
    pub fn record_interruption_reason(&self, reason: InterruptionReason) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner.interruptions.entry(reason.as_str()).or_insert(0) += 1;
    }

    /// Terminal bookkeeping for a stream that failed for good.
    pub fn record_stream_interruption(
        &self,
        reason: InterruptionReason,
        duration: Duration,
        retries: u32,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.interrupted_streams += 1;
        inner.retries += retries as u64;
        inner.stream_duration += duration;
        debug!(reason = %reason, retries, "stream failed");
    }

    pub fn record_retry_attempt(&self, duration: Duration) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.retry_attempts += 1;
        inner.retry_duration += duration;
    }

    pub fn record_thought_filtered(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.thoughts_filtered += 1;
    }

    pub fn snapshot(&self) -> StreamStats {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        StreamStats {
            total_streams: inner.total_streams,
            successful_streams: inner.successful_streams,
            interrupted_streams: inner.interrupted_streams,
            retries: inner.retries,
            thoughts_filtered: inner.thoughts_filtered,
        }
    }

    pub fn detailed(&self) -> DetailedStats {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let finished = inner.successful_streams + inner.interrupted_streams;
        DetailedStats {
            stream: StreamStats {
                total_streams: inner.total_streams,
                successful_streams: inner.successful_streams,
                interrupted_streams: inner.interrupted_streams,
                retries: inner.retries,
                thoughts_filtered: inner.thoughts_filtered,
            },
            interruptions: inner.interruptions.clone(),
            avg_stream_ms: average_ms(inner.stream_duration, finished),
            avg_retry_ms: average_ms(inner.retry_duration, inner.retry_attempts),
            uptime_s: self.started.elapsed().as_secs(),
        }
    }

    pub fn health(&self) -> HealthStatus {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let finished = inner.successful_streams + inner.interrupted_streams;
        let success_rate = if finished == 0 {
            1.0
        } else {
            inner.successful_streams as f64 / finished as f64
        };
        let status = if success_rate >= 0.8 {
            HealthVerdict::Healthy
        } else if success_rate >= 0.5 {
            HealthVerdict::Degraded
        } else {
            HealthVerdict::Unhealthy
        };
        HealthStatus {
            status,
            success_rate,
            total_streams: inner.total_streams,
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner = StatsInner::default();
    }

    /// Emits a structured summary once enough traffic has been observed.
    pub fn log_stats_if_significant(&self) {
        let stats = self.snapshot();
        if stats.total_streams < SIGNIFICANT_STREAMS {
            return;
        }
        let health = self.health();
        info!(
            event = "stream_stats",
            total = stats.total_streams,
            successful = stats.successful_streams,
            interrupted = stats.interrupted_streams,
            retries = stats.retries,
            thoughts_filtered = stats.thoughts_filtered,
            success_rate = health.success_rate,
        );
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn average_ms(total: Duration, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        (total.as_millis() / count as u128) as u64
    }
}
