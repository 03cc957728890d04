mod error;
mod logs;
mod outcome;
mod rewrite;
mod state;
mod upstream;

pub use error::ProxyError;
pub use logs::{LogRecord, LogRing, MemorySettingsStore, SettingsStore};
pub use outcome::{decode_error_body, demotion_for_status, parse_retry_after};
pub use rewrite::{apply_header_rules, apply_param_overrides};
pub use state::AppState;
pub use upstream::{
    UpstreamBody, UpstreamClient, UpstreamClientConfig, UpstreamResponse, WreqContinuationClient,
    WreqUpstreamClient,
};
