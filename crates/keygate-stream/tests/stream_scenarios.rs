use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use keygate_common::{Headers, ProxySettings, header_get};
use keygate_stream::{
    ByteStream, ContinuationClient, ContinuationResponse, StatsCollector, StreamError,
    StreamOutcome, StreamProcessor, UpstreamOrigin,
};

// ---- scripted upstream ----

struct Captured {
    url: String,
    headers: Headers,
    body: Bytes,
}

enum Scripted {
    Stream { status: u16, chunks: Vec<Bytes> },
    Error(String),
}

#[derive(Default)]
struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    captured: Mutex<Vec<Captured>>,
}

impl ScriptedClient {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            captured: Mutex::new(Vec::new()),
        })
    }

    fn captured(&self) -> Vec<(String, Headers, Value)> {
        self.captured
            .lock()
            .unwrap()
            .iter()
            .map(|c| {
                (
                    c.url.clone(),
                    c.headers.clone(),
                    serde_json::from_slice(&c.body).unwrap(),
                )
            })
            .collect()
    }
}

impl ContinuationClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        url: &'a str,
        headers: &'a Headers,
        body: Bytes,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ContinuationResponse, String>> + Send + 'a>> {
        self.captured.lock().unwrap().push(Captured {
            url: url.to_string(),
            headers: headers.clone(),
            body,
        });
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(Scripted::Stream { status, chunks }) => Ok(ContinuationResponse {
                    status,
                    body: stream_of(chunks),
                }),
                Some(Scripted::Error(message)) => Err(message),
                None => Err("no scripted response left".to_string()),
            }
        })
    }
}

fn stream_of(chunks: Vec<Bytes>) -> ByteStream {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        for chunk in chunks {
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });
    rx
}

// ---- SSE line builders ----

fn sse_line(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

fn text_line(text: &str) -> Bytes {
    sse_line(&json!({"candidates": [{"content": {"parts": [{"text": text}]}}]}))
}

fn thought_line(text: &str) -> Bytes {
    sse_line(&json!({"candidates": [{"content": {"parts": [{"text": text, "thought": true}]}}]}))
}

fn finish_line(reason: &str) -> Bytes {
    sse_line(&json!({"candidates": [{"finishReason": reason}]}))
}

fn blocked_line() -> Bytes {
    sse_line(&json!({"promptFeedback": {"blockReason": "SAFETY"}}))
}

// ---- harness ----

fn fast_settings() -> ProxySettings {
    ProxySettings {
        retry_delay_ms: 100,
        ..ProxySettings::default()
    }
}

fn processor_with(settings: ProxySettings, client: Arc<ScriptedClient>) -> StreamProcessor {
    StreamProcessor::new(settings, Arc::new(StatsCollector::new()), client).unwrap()
}

fn origin() -> UpstreamOrigin {
    UpstreamOrigin {
        url: "https://upstream.example/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
            .to_string(),
        headers: vec![("x-goog-api-key".to_string(), "k".to_string())],
        body: Bytes::from(
            json!({"contents": [{"role": "user", "parts": [{"text": "Hi"}]}]}).to_string(),
        ),
    }
}

async fn run_stream(
    processor: &StreamProcessor,
    upstream: Vec<Bytes>,
) -> (Result<StreamOutcome, StreamError>, String) {
    let (tx, mut rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let result = processor
        .process_stream(origin(), stream_of(upstream), tx, cancel)
        .await;
    let mut out = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        out.extend_from_slice(&chunk);
    }
    (result, String::from_utf8(out).unwrap())
}

// ---- scenarios ----

#[tokio::test]
async fn clean_stream_forwards_everything_verbatim() {
    let client = ScriptedClient::new(Vec::new());
    let processor = processor_with(fast_settings(), client.clone());

    let lines = vec![text_line("Hello"), text_line(" world."), finish_line("STOP")];
    let expected: String = lines
        .iter()
        .map(|b| String::from_utf8(b.to_vec()).unwrap())
        .collect();

    let (result, output) = run_stream(&processor, lines).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.accumulated_text, "Hello world.");
    assert_eq!(outcome.retry_count, 0);
    assert_eq!(output, expected);

    let stats = processor.stats().snapshot();
    assert_eq!(stats.total_streams, 1);
    assert_eq!(stats.successful_streams, 1);
    assert_eq!(stats.retries, 0);
    assert!(client.captured().is_empty());
}

#[tokio::test]
async fn dropped_stream_resumes_with_continuation_request() {
    let client = ScriptedClient::new(vec![Scripted::Stream {
        status: 200,
        chunks: vec![text_line("world."), finish_line("STOP")],
    }]);
    let processor = processor_with(fast_settings(), client.clone());

    // Upstream dies after the first chunk, no finish reason.
    let (result, output) = run_stream(&processor, vec![text_line("Hello ")]).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.accumulated_text, "Hello world.");
    assert_eq!(outcome.retry_count, 1);
    assert!(output.contains("Hello "));
    assert!(output.contains("world."));

    let captured = client.captured();
    assert_eq!(captured.len(), 1);
    let (url, headers, body) = &captured[0];
    assert_eq!(url, &origin().url);
    assert_eq!(header_get(headers, "content-type"), Some("application/json"));
    assert_eq!(header_get(headers, "x-goog-api-key"), Some("k"));

    let contents = body["contents"].as_array().unwrap();
    assert_eq!(
        contents[contents.len() - 2],
        json!({"role": "model", "parts": [{"text": "Hello "}]})
    );
    assert_eq!(
        contents[contents.len() - 1],
        json!({"role": "user", "parts": [{"text": "Please continue from where you left off."}]})
    );

    let detailed = processor.stats().detailed();
    assert_eq!(detailed.stream.successful_streams, 1);
    assert_eq!(detailed.stream.retries, 1);
    assert_eq!(detailed.interruptions.get("drop"), Some(&1));
}

#[tokio::test]
async fn blocked_stream_retries_and_swallows_thoughts() {
    let client = ScriptedClient::new(vec![Scripted::Stream {
        status: 200,
        chunks: vec![
            thought_line("let me reconsider"),
            text_line("Sure, here is the answer."),
            finish_line("STOP"),
        ],
    }]);
    let processor = processor_with(fast_settings(), client.clone());

    let (result, output) = run_stream(&processor, vec![blocked_line()]).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.accumulated_text, "Sure, here is the answer.");
    assert_eq!(outcome.retry_count, 1);
    assert!(!output.contains("reconsider"));
    assert!(output.contains("Sure, here is the answer."));

    // The blocked attempt emitted nothing, so the continuation body carries
    // no model/user turn pair.
    let captured = client.captured();
    assert_eq!(captured[0].2["contents"].as_array().unwrap().len(), 1);

    let detailed = processor.stats().detailed();
    assert_eq!(detailed.stream.thoughts_filtered, 1);
    assert_eq!(detailed.interruptions.get("block"), Some(&1));
    assert_eq!(detailed.stream.successful_streams, 1);
}

#[tokio::test]
async fn output_cap_aborts_without_retry() {
    let client = ScriptedClient::new(Vec::new());
    let mut settings = fast_settings();
    settings.max_output_chars = 10;
    let processor = processor_with(settings, client.clone());

    let first = text_line("abcde");
    let expected_forwarded = String::from_utf8(first.to_vec()).unwrap();
    let (result, output) = run_stream(&processor, vec![first, text_line("fghijk")]).await;

    match result {
        Err(StreamError::Exhausted { reason, retries }) => {
            assert_eq!(reason.as_str(), "timeout");
            assert_eq!(retries, 0);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    // Bytes up to the abort point only; the overflowing line is not written.
    assert_eq!(output, expected_forwarded);
    assert!(client.captured().is_empty());

    let detailed = processor.stats().detailed();
    assert_eq!(detailed.stream.interrupted_streams, 1);
    assert_eq!(detailed.interruptions.get("timeout"), Some(&1));
}

#[tokio::test]
async fn punctuation_heuristic_keeps_swallowing_until_two_sentences() {
    let client = ScriptedClient::new(vec![Scripted::Stream {
        status: 200,
        chunks: vec![
            thought_line("planning"),
            text_line("Hmm"),
            thought_line("still planning"),
            text_line("Okay."),
            thought_line("almost there"),
            text_line("Here."),
            // Swallow mode ended on the previous chunk; this one passes.
            thought_line("(visible thought)"),
            text_line("Done."),
            finish_line("STOP"),
        ],
    }]);
    let mut settings = fast_settings();
    settings.enable_punctuation_heuristic = true;
    let processor = processor_with(settings, client.clone());

    let (result, output) = run_stream(&processor, vec![]).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.retry_count, 1);
    assert_eq!(outcome.accumulated_text, "HmmOkay.Here.(visible thought)Done.");

    assert!(!output.contains("planning"));
    assert!(!output.contains("almost there"));
    assert!(output.contains("(visible thought)"));
    assert!(output.contains("Here."));

    assert_eq!(processor.stats().snapshot().thoughts_filtered, 3);
}

#[tokio::test]
async fn budget_exhaustion_fails_with_last_reason() {
    let client = ScriptedClient::new(vec![
        Scripted::Stream {
            status: 200,
            chunks: vec![],
        },
        Scripted::Stream {
            status: 200,
            chunks: vec![],
        },
    ]);
    let mut settings = fast_settings();
    settings.max_consecutive_retries = 2;
    let processor = processor_with(settings, client.clone());

    let (result, output) = run_stream(&processor, vec![]).await;
    match result {
        Err(StreamError::Exhausted { reason, retries }) => {
            assert_eq!(reason.as_str(), "drop");
            assert_eq!(retries, 2);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(output.is_empty());

    let detailed = processor.stats().detailed();
    assert_eq!(detailed.stream.interrupted_streams, 1);
    assert_eq!(detailed.stream.retries, 2);
    assert_eq!(detailed.interruptions.get("drop"), Some(&3));
}

#[tokio::test]
async fn failed_continuation_request_counts_as_drop() {
    let client = ScriptedClient::new(vec![
        Scripted::Error("connection refused".to_string()),
        Scripted::Stream {
            status: 200,
            chunks: vec![text_line("Recovered."), finish_line("STOP")],
        },
    ]);
    let processor = processor_with(fast_settings(), client.clone());

    let (result, _) = run_stream(&processor, vec![]).await;
    let outcome = result.unwrap();
    assert_eq!(outcome.accumulated_text, "Recovered.");
    assert_eq!(outcome.retry_count, 2);
    assert_eq!(processor.stats().detailed().interruptions.get("drop"), Some(&2));
}

#[tokio::test]
async fn non_stop_finish_reason_is_abnormal() {
    let client = ScriptedClient::new(vec![Scripted::Stream {
        status: 200,
        chunks: vec![text_line("All of it."), finish_line("STOP")],
    }]);
    let processor = processor_with(fast_settings(), client.clone());

    let (result, _) = run_stream(
        &processor,
        vec![text_line("Partial"), finish_line("MAX_TOKENS")],
    )
    .await;
    assert!(result.is_ok());
    assert_eq!(
        processor.stats().detailed().interruptions.get("finish_abnormal"),
        Some(&1)
    );
}

#[tokio::test]
async fn incomplete_stop_triggers_retry() {
    // STOP arrives but the text does not end a sentence.
    let client = ScriptedClient::new(vec![Scripted::Stream {
        status: 200,
        chunks: vec![text_line(" finished now."), finish_line("STOP")],
    }]);
    let processor = processor_with(fast_settings(), client.clone());

    let (result, _) = run_stream(
        &processor,
        vec![text_line("not quite"), finish_line("STOP")],
    )
    .await;
    let outcome = result.unwrap();
    assert_eq!(outcome.accumulated_text, "not quite finished now.");
    assert_eq!(
        processor.stats().detailed().interruptions.get("incomplete"),
        Some(&1)
    );
}

#[tokio::test]
async fn cancellation_stops_retries_and_records_drop() {
    let client = ScriptedClient::new(Vec::new());
    let processor = processor_with(fast_settings(), client.clone());

    let (up_tx, up_rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let _ = up_tx.send(text_line("Hello")).await;
        // Keep the upstream open well past the cancellation point.
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let (tx, _keep_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let cancel_handle = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel_handle.cancel();
    });

    let result = processor.process_stream(origin(), up_rx, tx, cancel).await;
    assert!(matches!(result, Err(StreamError::Aborted)));
    assert!(client.captured().is_empty());

    let detailed = processor.stats().detailed();
    assert_eq!(detailed.stream.interrupted_streams, 1);
    assert_eq!(detailed.interruptions.get("drop"), Some(&1));
}

#[tokio::test]
async fn simple_stream_copies_bytes_verbatim() {
    let client = ScriptedClient::new(Vec::new());
    let processor = processor_with(fast_settings(), client);

    let (tx, mut rx) = mpsc::channel(8);
    let upstream = stream_of(vec![
        Bytes::from_static(b"data: {\"anything\": true}\n\n"),
        Bytes::from_static(b"data: [DONE]\n\n"),
    ]);
    processor
        .process_simple_stream(upstream, tx, CancellationToken::new())
        .await
        .unwrap();

    let mut out = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        out.extend_from_slice(&chunk);
    }
    assert_eq!(
        out,
        b"data: {\"anything\": true}\n\ndata: [DONE]\n\n".to_vec()
    );
    assert_eq!(processor.stats().snapshot().successful_streams, 1);
}

#[tokio::test]
async fn settings_updates_validate_before_applying() {
    let client = ScriptedClient::new(Vec::new());
    let processor = processor_with(fast_settings(), client);

    let err = processor.update_settings(keygate_common::ProxySettingsPatch {
        retry_delay_ms: Some(5),
        ..Default::default()
    });
    assert!(err.is_err());
    assert_eq!(processor.settings().retry_delay_ms, 100);

    let ok = processor.update_settings(keygate_common::ProxySettingsPatch {
        max_output_chars: Some(2_000),
        ..Default::default()
    });
    assert_eq!(ok.unwrap().max_output_chars, 2_000);
    assert_eq!(processor.settings().max_output_chars, 2_000);
}
