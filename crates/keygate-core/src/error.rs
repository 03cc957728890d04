use keygate_common::SettingsError;
use keygate_stream::{InterruptionReason, StreamError};

/// Error taxonomy surfaced to the proxy frontline.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("unknown group: {0}")]
    UnknownGroup(String),
    #[error("no active credentials for group: {0}")]
    NoActiveCredentials(String),
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("adapter error: {0}")]
    Adapter(String),
    #[error("stream interrupted: {0}")]
    Interruption(InterruptionReason),
    #[error(transparent)]
    Config(#[from] SettingsError),
    #[error("retry budget exhausted after {retries} retries: {reason}")]
    BudgetExhausted {
        reason: InterruptionReason,
        retries: u32,
    },
}

impl ProxyError {
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::UnknownGroup(_) => 404,
            ProxyError::NoActiveCredentials(_) => 503,
            ProxyError::Transport(_) => 502,
            ProxyError::Adapter(_) => 400,
            ProxyError::Interruption(_) => 502,
            ProxyError::Config(_) => 400,
            ProxyError::BudgetExhausted { .. } => 502,
        }
    }
}

impl From<StreamError> for ProxyError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Aborted => ProxyError::Interruption(InterruptionReason::Drop),
            StreamError::Exhausted { reason, retries } => {
                ProxyError::BudgetExhausted { reason, retries }
            }
            StreamError::Rebuild(inner) => ProxyError::Adapter(inner.to_string()),
        }
    }
}
