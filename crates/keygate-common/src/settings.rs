use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("max_consecutive_retries must be within 0..=200, got {0}")]
    RetryBudgetOutOfRange(u32),
    #[error("retry_delay_ms must be within 100..=10000, got {0}")]
    RetryDelayOutOfRange(u64),
    #[error("stream_timeout_s must be within 30..=3600, got {0}")]
    StreamTimeoutOutOfRange(u64),
}

/// Runtime-tunable proxy settings.
///
/// Held in an `ArcSwap` by the running process; admin updates go through
/// [`ProxySettingsPatch::overlay`] followed by [`ProxySettings::validate`]
/// so a rejected update never half-applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Ceiling on consecutive continuation attempts for one client request.
    pub max_consecutive_retries: u32,
    /// Fixed backoff between attempts.
    pub retry_delay_ms: u64,
    /// Suppress provider thought chunks at the start of a retry attempt.
    pub swallow_thoughts_after_retry: bool,
    /// Require two sentence-ending chunks before leaving swallow mode.
    pub enable_punctuation_heuristic: bool,
    pub enable_detailed_logging: bool,
    /// Emit each rebuilt continuation body into the structured log.
    pub save_retry_requests: bool,
    /// Hard cap on characters delivered to the client; 0 disables the cap.
    pub max_output_chars: u64,
    /// Upper bound on a single stream, attempts included.
    pub stream_timeout_s: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            max_consecutive_retries: 100,
            retry_delay_ms: 750,
            swallow_thoughts_after_retry: true,
            enable_punctuation_heuristic: false,
            enable_detailed_logging: false,
            save_retry_requests: false,
            max_output_chars: 0,
            stream_timeout_s: 300,
        }
    }
}

impl ProxySettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_consecutive_retries > 200 {
            return Err(SettingsError::RetryBudgetOutOfRange(
                self.max_consecutive_retries,
            ));
        }
        if !(100..=10_000).contains(&self.retry_delay_ms) {
            return Err(SettingsError::RetryDelayOutOfRange(self.retry_delay_ms));
        }
        if !(30..=3_600).contains(&self.stream_timeout_s) {
            return Err(SettingsError::StreamTimeoutOutOfRange(self.stream_timeout_s));
        }
        Ok(())
    }
}

/// Partial settings layer used by `PUT /admin/settings`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettingsPatch {
    pub max_consecutive_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub swallow_thoughts_after_retry: Option<bool>,
    pub enable_punctuation_heuristic: Option<bool>,
    pub enable_detailed_logging: Option<bool>,
    pub save_retry_requests: Option<bool>,
    pub max_output_chars: Option<u64>,
    pub stream_timeout_s: Option<u64>,
}

impl ProxySettingsPatch {
    pub fn overlay(&self, base: &ProxySettings) -> ProxySettings {
        ProxySettings {
            max_consecutive_retries: self
                .max_consecutive_retries
                .unwrap_or(base.max_consecutive_retries),
            retry_delay_ms: self.retry_delay_ms.unwrap_or(base.retry_delay_ms),
            swallow_thoughts_after_retry: self
                .swallow_thoughts_after_retry
                .unwrap_or(base.swallow_thoughts_after_retry),
            enable_punctuation_heuristic: self
                .enable_punctuation_heuristic
                .unwrap_or(base.enable_punctuation_heuristic),
            enable_detailed_logging: self
                .enable_detailed_logging
                .unwrap_or(base.enable_detailed_logging),
            save_retry_requests: self.save_retry_requests.unwrap_or(base.save_retry_requests),
            max_output_chars: self.max_output_chars.unwrap_or(base.max_output_chars),
            stream_timeout_s: self.stream_timeout_s.unwrap_or(base.stream_timeout_s),
        }
    }
}
