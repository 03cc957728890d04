use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;

use keygate_common::Headers;

/// Chunked upstream response body. The sender side closes the channel when
/// the upstream finishes or errors; there is no separate error frame.
pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

/// Snapshot of the original upstream request, kept for the lifetime of one
/// client request so continuation attempts can be rebuilt from it.
#[derive(Debug, Clone)]
pub struct UpstreamOrigin {
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
}

#[derive(Debug)]
pub struct ContinuationResponse {
    pub status: u16,
    pub body: ByteStream,
}

/// Issues continuation POSTs for the retry engine.
///
/// Implementations build a fresh HTTP client per call with the supplied
/// timeout; the retry engine never reuses a connection across attempts.
pub trait ContinuationClient: Send + Sync {
    fn send<'a>(
        &'a self,
        url: &'a str,
        headers: &'a Headers,
        body: Bytes,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ContinuationResponse, String>> + Send + 'a>>;
}
