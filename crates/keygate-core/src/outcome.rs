use std::io::Read;
use std::time::Duration;

use keygate_common::{Headers, header_get};
use keygate_pool::CredentialStatus;

/// Maps an upstream HTTP status to the credential demotion it warrants.
/// 2xx and most 4xx codes say nothing about the credential itself.
pub fn demotion_for_status(
    status: u16,
    headers: &Headers,
) -> Option<(CredentialStatus, Option<Duration>)> {
    match status {
        401 => Some((CredentialStatus::AuthFailed, None)),
        403 => Some((CredentialStatus::Forbidden, None)),
        429 => Some((CredentialStatus::RateLimited, parse_retry_after(headers))),
        400 => Some((CredentialStatus::BadRequest, None)),
        500..=599 => Some((CredentialStatus::ServerError, None)),
        _ => None,
    }
}

pub fn parse_retry_after(headers: &Headers) -> Option<Duration> {
    let value = header_get(headers, "retry-after")?.trim();
    if value.is_empty() {
        return None;
    }
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

/// Error bodies come back gzip-encoded from some upstreams; decompress them
/// before they reach a log line.
pub fn decode_error_body(headers: &Headers, body: &[u8]) -> String {
    let gzipped = header_get(headers, "content-encoding")
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false);
    if gzipped {
        let mut decoder = flate2::read::GzDecoder::new(body);
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_ok() {
            return String::from_utf8_lossy(&out).into_owned();
        }
    }
    String::from_utf8_lossy(body).into_owned()
}
