use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use keygate_common::{ProxySettings, header_set};
use keygate_protocol::gemini::{Content, ContinuationBody, Part};
use keygate_protocol::sse::{LineScanner, LineVerdict, RawLine, classify_line};
use keygate_protocol::validate_stream_completion;

use crate::client::{ByteStream, ContinuationClient, UpstreamOrigin};
use crate::filter::ThoughtFilter;
use crate::stats::StatsCollector;
use crate::SharedSettings;

pub const CONTINUE_PROMPT: &str = "Please continue from where you left off.";

/// Why a stream attempt did not finish cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionReason {
    /// Safety / content-filter line seen.
    Block,
    /// Stream closed without a finish reason, or the read failed.
    Drop,
    /// STOP seen but the accumulated output fails the completion check.
    Incomplete,
    /// Finish reason present but not STOP.
    FinishAbnormal,
    /// Output-character cap exceeded.
    Timeout,
}

impl InterruptionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterruptionReason::Block => "block",
            InterruptionReason::Drop => "drop",
            InterruptionReason::Incomplete => "incomplete",
            InterruptionReason::FinishAbnormal => "finish_abnormal",
            InterruptionReason::Timeout => "timeout",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, InterruptionReason::Timeout)
    }
}

impl fmt::Display for InterruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Client disconnect or deadline; no further retries.
    #[error("stream aborted")]
    Aborted,
    /// Retry budget spent or the reason is non-retryable.
    #[error("stream failed after {retries} retries: {reason}")]
    Exhausted {
        reason: InterruptionReason,
        retries: u32,
    },
    #[error("continuation rebuild failed: {0}")]
    Rebuild(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub accumulated_text: String,
    pub retry_count: u32,
}

/// Per-request retry state. Born on request entry, dies with it; never shared
/// across tasks.
#[derive(Debug)]
pub struct RetryContext {
    accumulated_text: String,
    accumulated_chars: u64,
    retry_count: u32,
    last_reason: Option<InterruptionReason>,
    origin: UpstreamOrigin,
    started: Instant,
}

impl RetryContext {
    pub fn new(origin: UpstreamOrigin) -> Self {
        Self {
            accumulated_text: String::new(),
            accumulated_chars: 0,
            retry_count: 0,
            last_reason: None,
            origin,
            started: Instant::now(),
        }
    }

    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_reason(&self) -> Option<InterruptionReason> {
        self.last_reason
    }

    fn append(&mut self, text: &str) {
        self.accumulated_text.push_str(text);
        self.accumulated_chars += text.chars().count() as u64;
    }

    /// Rebuilds the upstream request body for a continuation attempt.
    ///
    /// Envelope fields pass through untouched; turns are copied down to role
    /// and text. The model/user turn pair is appended only when something was
    /// already emitted, so repeated calls yield byte-identical JSON.
    pub fn continuation_body(&self) -> Result<ContinuationBody, serde_json::Error> {
        let source: ContinuationBody = serde_json::from_slice(&self.origin.body)?;
        let mut contents: Vec<Content> = source
            .contents
            .into_iter()
            .map(|content| Content {
                role: content.role,
                parts: content
                    .parts
                    .into_iter()
                    .filter(|part| part.text.is_some())
                    .map(|part| Part {
                        text: part.text,
                        thought: None,
                    })
                    .collect(),
            })
            .collect();

        if !self.accumulated_text.is_empty() {
            contents.push(Content {
                role: Some("model".to_string()),
                parts: vec![Part::text(self.accumulated_text.clone())],
            });
            contents.push(Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(CONTINUE_PROMPT)],
            });
        }

        Ok(ContinuationBody {
            contents,
            generation_config: source.generation_config,
            safety_settings: source.safety_settings,
            system_instruction: source.system_instruction,
        })
    }

    pub fn continuation_body_bytes(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec(&self.continuation_body()?)?))
    }
}

enum AttemptEnd {
    Done,
    Aborted,
    Interrupted(InterruptionReason),
}

/// Drives one client request through the initial attempt and any number of
/// continuation attempts, writing forwarded lines to a single downstream
/// writer in producer order.
pub struct RetryEngine {
    settings: SharedSettings,
    stats: Arc<StatsCollector>,
    client: Arc<dyn ContinuationClient>,
}

impl RetryEngine {
    pub fn new(
        settings: SharedSettings,
        stats: Arc<StatsCollector>,
        client: Arc<dyn ContinuationClient>,
    ) -> Self {
        Self {
            settings,
            stats,
            client,
        }
    }

    pub async fn run(
        &self,
        origin: UpstreamOrigin,
        initial_body: ByteStream,
        writer: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
        filter: &ThoughtFilter,
    ) -> Result<StreamOutcome, StreamError> {
        let mut ctx = RetryContext::new(origin);
        let mut next_body = Some(initial_body);
        let mut is_retry = false;

        loop {
            let settings = self.settings.load_full();

            let reason = match next_body.take() {
                Some(body) => {
                    let attempt_started = Instant::now();
                    let end = self
                        .run_attempt(&mut ctx, body, &writer, &cancel, filter, is_retry, &settings)
                        .await;
                    if is_retry {
                        self.stats.record_retry_attempt(attempt_started.elapsed());
                    }
                    match end {
                        AttemptEnd::Done => {
                            self.stats
                                .record_stream_success(ctx.started.elapsed(), ctx.retry_count);
                            return Ok(StreamOutcome {
                                accumulated_text: ctx.accumulated_text,
                                retry_count: ctx.retry_count,
                            });
                        }
                        AttemptEnd::Aborted => return Err(self.abort(&ctx)),
                        AttemptEnd::Interrupted(reason) => reason,
                    }
                }
                // The continuation request itself failed at the HTTP level.
                None => InterruptionReason::Drop,
            };

            ctx.last_reason = Some(reason);
            self.stats.record_interruption_reason(reason);
            if settings.enable_detailed_logging {
                debug!(
                    reason = %reason,
                    retry_count = ctx.retry_count,
                    accumulated_chars = ctx.accumulated_chars,
                    "stream interrupted"
                );
            }

            if !reason.is_retryable() || ctx.retry_count >= settings.max_consecutive_retries {
                self.stats.record_stream_interruption(
                    reason,
                    ctx.started.elapsed(),
                    ctx.retry_count,
                );
                return Err(StreamError::Exhausted {
                    reason,
                    retries: ctx.retry_count,
                });
            }
            ctx.retry_count += 1;

            tokio::select! {
                _ = cancel.cancelled() => return Err(self.abort(&ctx)),
                _ = tokio::time::sleep(Duration::from_millis(settings.retry_delay_ms)) => {}
            }

            let body = match ctx.continuation_body_bytes() {
                Ok(body) => body,
                Err(err) => {
                    warn!(error = %err, "continuation rebuild failed");
                    self.stats.record_stream_interruption(
                        reason,
                        ctx.started.elapsed(),
                        ctx.retry_count,
                    );
                    return Err(StreamError::Rebuild(err));
                }
            };
            if settings.save_retry_requests {
                debug!(
                    retry_count = ctx.retry_count,
                    body = %String::from_utf8_lossy(&body),
                    "continuation request"
                );
            }

            let mut headers = ctx.origin.headers.clone();
            header_set(&mut headers, "content-type", "application/json");
            let timeout = Duration::from_secs(settings.stream_timeout_s);
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(self.abort(&ctx)),
                response = self.client.send(&ctx.origin.url, &headers, body, timeout) => response,
            };

            match response {
                Ok(response) if (200..300).contains(&response.status) => {
                    filter.enable_swallow_mode();
                    is_retry = true;
                    next_body = Some(response.body);
                }
                Ok(response) => {
                    warn!(status = response.status, "continuation request rejected");
                    next_body = None;
                }
                Err(message) => {
                    warn!(error = %message, "continuation request failed");
                    next_body = None;
                }
            }
        }
    }

    fn abort(&self, ctx: &RetryContext) -> StreamError {
        self.stats.record_interruption_reason(InterruptionReason::Drop);
        self.stats.record_stream_interruption(
            InterruptionReason::Drop,
            ctx.started.elapsed(),
            ctx.retry_count,
        );
        StreamError::Aborted
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        ctx: &mut RetryContext,
        mut body: ByteStream,
        writer: &mpsc::Sender<Bytes>,
        cancel: &CancellationToken,
        filter: &ThoughtFilter,
        is_retry: bool,
        settings: &ProxySettings,
    ) -> AttemptEnd {
        let mut scanner = LineScanner::new();
        let mut last_finish: Option<String> = None;
        let mut saw_data = false;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return AttemptEnd::Aborted,
                chunk = body.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            for line in scanner.push(&chunk) {
                match self
                    .handle_line(ctx, line, writer, filter, is_retry, settings, &mut last_finish, &mut saw_data)
                    .await
                {
                    Some(end) => return end,
                    None => continue,
                }
            }
        }
        if let Some(line) = scanner.finish() {
            if let Some(end) = self
                .handle_line(ctx, line, writer, filter, is_retry, settings, &mut last_finish, &mut saw_data)
                .await
            {
                return end;
            }
        }

        if !saw_data {
            return AttemptEnd::Interrupted(InterruptionReason::Drop);
        }
        if validate_stream_completion(&ctx.accumulated_text, last_finish.as_deref()) {
            return AttemptEnd::Done;
        }
        AttemptEnd::Interrupted(match last_finish.as_deref() {
            Some("STOP") => InterruptionReason::Incomplete,
            Some(_) => InterruptionReason::FinishAbnormal,
            None => InterruptionReason::Drop,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_line(
        &self,
        ctx: &mut RetryContext,
        line: RawLine,
        writer: &mpsc::Sender<Bytes>,
        filter: &ThoughtFilter,
        is_retry: bool,
        settings: &ProxySettings,
        last_finish: &mut Option<String>,
        saw_data: &mut bool,
    ) -> Option<AttemptEnd> {
        match classify_line(&line.text) {
            LineVerdict::Blocked => Some(AttemptEnd::Interrupted(InterruptionReason::Block)),
            LineVerdict::Data {
                text,
                is_thought,
                finish_reason,
            } => {
                if let Some(reason) = finish_reason {
                    *last_finish = Some(reason);
                }
                if filter.should_swallow(is_thought, is_retry, settings) {
                    self.stats.record_thought_filtered();
                    return None;
                }
                *saw_data = true;
                ctx.append(&text);
                if settings.max_output_chars > 0 && ctx.accumulated_chars > settings.max_output_chars
                {
                    return Some(AttemptEnd::Interrupted(InterruptionReason::Timeout));
                }
                if is_retry && !is_thought {
                    filter.note_formal_text(&text, settings);
                }
                self.forward(writer, line.raw).await
            }
            LineVerdict::Finish(reason) => {
                *last_finish = Some(reason);
                self.forward(writer, line.raw).await
            }
            LineVerdict::Other => self.forward(writer, line.raw).await,
        }
    }

    async fn forward(&self, writer: &mpsc::Sender<Bytes>, raw: Bytes) -> Option<AttemptEnd> {
        // A closed writer means the client went away.
        match writer.send(raw).await {
            Ok(()) => None,
            Err(_) => Some(AttemptEnd::Aborted),
        }
    }
}
