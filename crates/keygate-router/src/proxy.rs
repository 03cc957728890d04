use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use bytes::Bytes;
use futures_util::StreamExt;
use time::OffsetDateTime;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use keygate_channel::{Channel, HttpMethod, UpstreamRequest};
use keygate_common::Headers;
use keygate_core::{
    AppState, LogRecord, ProxyError, UpstreamBody, apply_header_rules, apply_param_overrides,
    decode_error_body, demotion_for_status,
};
use keygate_pool::{AcquireError, CredentialStatus, Group, LeasedCredential};
use keygate_stream::{StreamError, UpstreamOrigin};

const REQUEST_ID_HEADER: &str = "x-keygate-request-id";

pub fn proxy_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/proxy/{group}/{*path}", any(proxy_handler))
        .with_state(state)
}

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path((group_name, path)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = Uuid::now_v7().to_string();
    let started = Instant::now();

    let Some(group) = state.resolve_group(&group_name).await else {
        return error_response(
            ProxyError::UnknownGroup(group_name),
            &trace_id,
        );
    };

    let channel = match state.registry.get(&group.channel) {
        Ok(channel) => channel,
        Err(err) => return error_response(ProxyError::Adapter(err.to_string()), &trace_id),
    };

    let Some(http_method) = HttpMethod::parse(method.as_str()) else {
        return (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed").into_response();
    };

    // Group-level rewriting happens before stream detection so overrides that
    // flip `stream` are honored.
    let effective_body = apply_param_overrides(&body, &group.param_overrides).unwrap_or(body);
    let query = strip_key_param(query);
    let mut upstream_headers = headers_to_vec(&headers);
    strip_client_auth(&mut upstream_headers);
    apply_header_rules(&mut upstream_headers, &group.header_rules);

    let is_stream = channel.is_stream(
        &path,
        query.as_deref(),
        &upstream_headers,
        &effective_body,
    );
    let model = channel.extract_model(&path, &effective_body);

    let lease = match state.pool.acquire(group.id).await {
        Ok(lease) => lease,
        Err(AcquireError::GroupUnknown) => {
            return error_response(ProxyError::UnknownGroup(group.name.clone()), &trace_id);
        }
        Err(AcquireError::NoActiveCredentials) => {
            warn!(event = "pool_exhausted", trace_id = %trace_id, group = %group.name);
            return error_response(
                ProxyError::NoActiveCredentials(group.name.clone()),
                &trace_id,
            );
        }
    };

    let mut upstream_req = match build_upstream_request(
        &group,
        http_method,
        &path,
        query.as_deref(),
        upstream_headers,
        effective_body.clone(),
        is_stream,
    ) {
        Ok(req) => req,
        Err(err) => return error_response(err, &trace_id),
    };
    if let Err(err) = channel.modify_request(&mut upstream_req, &lease.key, &group) {
        return error_response(ProxyError::Adapter(err.to_string()), &trace_id);
    }

    info!(
        event = "proxy_request",
        trace_id = %trace_id,
        group = %group.name,
        channel = %group.channel,
        model = ?model,
        method = %method,
        path = %path,
        is_stream,
        credential_id = lease.id,
    );

    let origin = UpstreamOrigin {
        url: upstream_req.url.clone(),
        headers: upstream_req.headers.clone(),
        body: effective_body,
    };

    let response = match state.upstream.send(upstream_req).await {
        Ok(response) => response,
        Err(message) => {
            state
                .pool
                .demote(lease.id, CredentialStatus::NetworkError, None)
                .await;
            record_request_log(
                &state,
                &trace_id,
                &group,
                model.clone(),
                502,
                started,
                is_stream,
                0,
                None,
                Some(message.clone()),
            );
            return error_response(ProxyError::Transport(message), &trace_id);
        }
    };

    let ok = (200..300).contains(&response.status);
    if !ok {
        if let Some((status, retry_after)) =
            demotion_for_status(response.status, &response.headers)
        {
            state.pool.demote(lease.id, status, retry_after).await;
        }
    }

    match response.body {
        UpstreamBody::Stream(upstream_body) if ok => {
            stream_response(
                state,
                channel,
                group,
                lease,
                origin,
                upstream_body,
                trace_id,
                model,
                started,
            )
        }
        UpstreamBody::Stream(_) => {
            // Error statuses are always buffered by the upstream client.
            error_response(
                ProxyError::Transport("unexpected streaming error body".to_string()),
                &trace_id,
            )
        }
        UpstreamBody::Bytes(bytes) => {
            if !ok {
                let message = decode_error_body(&response.headers, &bytes);
                warn!(
                    event = "upstream_error",
                    trace_id = %trace_id,
                    group = %group.name,
                    status = response.status,
                    error_body = %message,
                );
            }
            record_request_log(
                &state,
                &trace_id,
                &group,
                model,
                response.status,
                started,
                is_stream,
                0,
                None,
                None,
            );
            passthrough_response(response.status, response.headers, bytes, &trace_id)
        }
    }
}

/// Hands the upstream body to the stream processor and answers immediately
/// with the SSE framing; the processor task keeps writing into the response.
#[allow(clippy::too_many_arguments)]
fn stream_response(
    state: Arc<AppState>,
    channel: Arc<dyn Channel>,
    group: Group,
    lease: LeasedCredential,
    origin: UpstreamOrigin,
    upstream_body: keygate_stream::ByteStream,
    trace_id: String,
    model: Option<String>,
    started: Instant,
) -> Response {
    let (writer, reader) = tokio::sync::mpsc::channel::<Bytes>(16);
    let cancel = CancellationToken::new();
    // The retry-and-resume pipeline only understands the Gemini wire format;
    // other channels get the plain copier.
    let gemini = channel.kind() == "gemini";

    tokio::spawn(async move {
        let processor = state.processor.clone();
        let result = if gemini {
            processor
                .process_stream(origin, upstream_body, writer, cancel)
                .await
                .map(Some)
        } else {
            processor
                .process_simple_stream(upstream_body, writer, cancel)
                .await
                .map(|()| None)
        };

        match result {
            Ok(outcome) => {
                let retries = outcome.as_ref().map(|o| o.retry_count).unwrap_or(0);
                info!(
                    event = "stream_finished",
                    trace_id = %trace_id,
                    group = %group.name,
                    credential_id = lease.id,
                    retries,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                );
                record_request_log(
                    &state, &trace_id, &group, model, 200, started, true, retries, None, None,
                );
            }
            Err(err) => {
                let (interruption, retries) = match &err {
                    StreamError::Exhausted { reason, retries } => {
                        (Some(reason.as_str()), *retries)
                    }
                    StreamError::Aborted => (Some("drop"), 0),
                    StreamError::Rebuild(_) => (Some("drop"), 0),
                };
                warn!(
                    event = "stream_failed",
                    trace_id = %trace_id,
                    group = %group.name,
                    credential_id = lease.id,
                    error = %err,
                );
                record_request_log(
                    &state,
                    &trace_id,
                    &group,
                    model,
                    200,
                    started,
                    true,
                    retries,
                    interruption,
                    Some(err.to_string()),
                );
            }
        }
        state.processor.stats().log_stats_if_significant();
    });

    let stream = ReceiverStream::new(reader).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

fn build_upstream_request(
    group: &Group,
    method: HttpMethod,
    path: &str,
    query: Option<&str>,
    headers: Headers,
    body: Bytes,
    is_stream: bool,
) -> Result<UpstreamRequest, ProxyError> {
    let base = group
        .primary_upstream()
        .ok_or_else(|| ProxyError::Adapter("group has no upstream url".to_string()))?;
    let mut url = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    Ok(UpstreamRequest {
        method,
        url,
        headers,
        body: if body.is_empty() { None } else { Some(body) },
        is_stream,
    })
}

#[allow(clippy::too_many_arguments)]
fn record_request_log(
    state: &AppState,
    trace_id: &str,
    group: &Group,
    model: Option<String>,
    status: u16,
    started: Instant,
    is_stream: bool,
    retries: u32,
    interruption: Option<&'static str>,
    error: Option<String>,
) {
    state.record_log(LogRecord {
        at: OffsetDateTime::now_utc(),
        trace_id: trace_id.to_string(),
        group: group.name.clone(),
        model,
        status,
        elapsed_ms: started.elapsed().as_millis() as u64,
        is_stream,
        retries,
        interruption,
        error,
    });
}

fn error_response(err: ProxyError, trace_id: &str) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({"error": err.to_string()});
    let mut response = (status, axum::Json(body)).into_response();
    set_request_id(&mut response, trace_id);
    response
}

fn passthrough_response(
    status: u16,
    headers: Headers,
    body: Bytes,
    trace_id: &str,
) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    for (name, value) in headers {
        if is_hop_by_hop_or_framing_header(&name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    set_request_id(&mut response, trace_id);
    response
}

fn set_request_id(response: &mut Response, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    let mut out: Headers = Vec::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

/// Inbound client credentials must never reach the upstream; the pool key is
/// the only authentication that leaves the proxy.
fn strip_client_auth(headers: &mut Headers) {
    headers.retain(|(name, _)| {
        !name.eq_ignore_ascii_case("authorization")
            && !name.eq_ignore_ascii_case("x-api-key")
            && !name.eq_ignore_ascii_case("x-goog-api-key")
            && !name.eq_ignore_ascii_case("host")
            && !name.eq_ignore_ascii_case("content-length")
    });
}

fn strip_key_param(query: Option<String>) -> Option<String> {
    let query = query?;
    let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(&query) else {
        return Some(query);
    };
    let filtered: Vec<(String, String)> =
        pairs.into_iter().filter(|(name, _)| name != "key").collect();
    serde_urlencoded::to_string(&filtered).ok()
}

fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}
