mod client;
mod filter;
mod processor;
mod retry;
mod stats;

pub use client::{ByteStream, ContinuationClient, ContinuationResponse, UpstreamOrigin};
pub use filter::{FilterState, ThoughtFilter};
pub use processor::StreamProcessor;
pub use retry::{CONTINUE_PROMPT, InterruptionReason, RetryContext, StreamError, StreamOutcome};
pub use stats::{DetailedStats, HealthStatus, HealthVerdict, StatsCollector, StreamStats};

/// Settings shared between the processor, the retry engine and the admin
/// surface. Stores are atomic; each attempt loads a fresh snapshot.
pub type SharedSettings = std::sync::Arc<arc_swap::ArcSwap<keygate_common::ProxySettings>>;
