use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use keygate_common::{ProxySettings, ProxySettingsPatch, SettingsError};

use crate::SharedSettings;
use crate::client::{ByteStream, ContinuationClient, UpstreamOrigin};
use crate::filter::ThoughtFilter;
use crate::retry::{InterruptionReason, RetryEngine, StreamError, StreamOutcome};
use crate::stats::StatsCollector;

/// Facade wiring the line parser, thought filter, stats and retry engine
/// together under one timeout-bound context per request.
pub struct StreamProcessor {
    settings: SharedSettings,
    stats: Arc<StatsCollector>,
    engine: RetryEngine,
}

impl StreamProcessor {
    pub fn new(
        settings: ProxySettings,
        stats: Arc<StatsCollector>,
        client: Arc<dyn ContinuationClient>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        let settings: SharedSettings = Arc::new(ArcSwap::from_pointee(settings));
        let engine = RetryEngine::new(settings.clone(), stats.clone(), client);
        Ok(Self {
            settings,
            stats,
            engine,
        })
    }

    pub fn settings(&self) -> ProxySettings {
        self.settings.load().as_ref().clone()
    }

    /// Applies a validated settings patch. Rejected patches leave the running
    /// configuration untouched; accepted ones become visible to every
    /// dependent component on its next settings load.
    pub fn update_settings(
        &self,
        patch: ProxySettingsPatch,
    ) -> Result<ProxySettings, SettingsError> {
        let next = patch.overlay(&self.settings.load());
        next.validate()?;
        self.settings.store(Arc::new(next.clone()));
        debug!(event = "settings_updated", ?next);
        Ok(next)
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// Runs the full retry-and-resume pipeline for one streaming request.
    pub async fn process_stream(
        &self,
        origin: UpstreamOrigin,
        upstream: ByteStream,
        writer: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome, StreamError> {
        self.stats.record_stream_start();
        let filter = ThoughtFilter::new();
        let deadline = Duration::from_secs(self.settings.load().stream_timeout_s);
        let child = cancel.child_token();

        let work = self.engine.run(origin, upstream, writer, child.clone(), &filter);
        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => {
                // The engine future was dropped mid-attempt; close everything
                // it was reading from and account for the loss here.
                child.cancel();
                self.stats.record_interruption_reason(InterruptionReason::Drop);
                self.stats
                    .record_stream_interruption(InterruptionReason::Drop, deadline, 0);
                Err(StreamError::Aborted)
            }
        }
    }

    /// Verbatim byte copier for non-Gemini streams: no parsing, no retries.
    pub async fn process_simple_stream(
        &self,
        mut upstream: ByteStream,
        writer: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) -> Result<(), StreamError> {
        self.stats.record_stream_start();
        let started = Instant::now();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    self.stats.record_interruption_reason(InterruptionReason::Drop);
                    self.stats
                        .record_stream_interruption(InterruptionReason::Drop, started.elapsed(), 0);
                    return Err(StreamError::Aborted);
                }
                chunk = upstream.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                self.stats.record_stream_success(started.elapsed(), 0);
                return Ok(());
            };
            if writer.send(chunk).await.is_err() {
                self.stats.record_interruption_reason(InterruptionReason::Drop);
                self.stats
                    .record_stream_interruption(InterruptionReason::Drop, started.elapsed(), 0);
                return Err(StreamError::Aborted);
            }
        }
    }
}
