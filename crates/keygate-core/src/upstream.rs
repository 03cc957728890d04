use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use wreq::{Client, Method};

use keygate_channel::{HttpMethod, UpstreamRequest};
use keygate_common::Headers;
use keygate_stream::{ByteStream, ContinuationClient, ContinuationResponse};

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, String>> + Send + 'a>>;
}

/// Long-lived client used for first attempts on the proxy path.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .read_timeout(config.stream_idle_timeout)
            .build()?;
        Ok(Self { config, client })
    }
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, String>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(to_wreq_method(req.method), &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }
            let response = builder.send().await.map_err(|err| err.to_string())?;
            convert_response(response, req.is_stream, self.config.stream_idle_timeout).await
        })
    }
}

fn to_wreq_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

async fn convert_response(
    response: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<UpstreamResponse, String> {
    let status = response.status().as_u16();
    let headers = headers_from_wreq(response.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = response.bytes().await.map_err(|err| err.to_string())?;
        return Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    Ok(UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Stream(pump_body(response, stream_idle_timeout)),
    })
}

/// Moves the response body onto an mpsc channel. Closing the receiver is how
/// every consumer releases the upstream connection.
fn pump_body(response: wreq::Response, idle_timeout: Duration) -> ByteStream {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next()).await;
            let item = match next {
                Ok(item) => item,
                Err(_) => break,
            };
            let Some(item) = item else {
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

/// Continuation sender for the retry engine. A fresh client is built per
/// attempt so the configured stream timeout binds the whole attempt.
#[derive(Debug, Clone)]
pub struct WreqContinuationClient {
    pub connect_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl WreqContinuationClient {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for WreqContinuationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuationClient for WreqContinuationClient {
    fn send<'a>(
        &'a self,
        url: &'a str,
        headers: &'a Headers,
        body: Bytes,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ContinuationResponse, String>> + Send + 'a>> {
        Box::pin(async move {
            let client = Client::builder()
                .connect_timeout(self.connect_timeout)
                .timeout(timeout)
                .read_timeout(self.stream_idle_timeout)
                .build()
                .map_err(|err| err.to_string())?;

            let mut builder = client.post(url);
            for (name, value) in headers {
                builder = builder.header(name, value);
            }
            let response = builder
                .body(body)
                .send()
                .await
                .map_err(|err| err.to_string())?;

            let status = response.status().as_u16();
            if !(200..300).contains(&status) {
                // Drain and close the body; the engine only needs the status.
                let _ = response.bytes().await;
                let (_tx, rx) = tokio::sync::mpsc::channel::<Bytes>(1);
                return Ok(ContinuationResponse { status, body: rx });
            }

            Ok(ContinuationResponse {
                status,
                body: pump_body(response, self.stream_idle_timeout),
            })
        })
    }
}
