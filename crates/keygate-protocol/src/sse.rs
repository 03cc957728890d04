use bytes::Bytes;

use crate::gemini::StreamChunk;

pub const FINISH_REASON_STOP: &str = "STOP";

/// Sentence-terminating punctuation, ASCII and CJK full-width.
const TERMINAL_PUNCTUATION: [char; 6] = ['.', '!', '?', '。', '！', '？'];

/// A complete SSE line as read off the wire.
///
/// `raw` keeps the original bytes including the line terminator so the proxy
/// can reproduce upstream output byte-for-byte; `text` is the terminator-free
/// view used for classification.
#[derive(Debug, Clone)]
pub struct RawLine {
    pub raw: Bytes,
    pub text: String,
}

/// Buffers upstream bytes and yields complete LF-terminated lines.
///
/// TCP chunks do not align with SSE line boundaries; a partial trailing line
/// stays buffered until its terminator arrives or [`LineScanner::finish`] is
/// called at end of stream.
#[derive(Debug, Default)]
pub struct LineScanner {
    buffer: Vec<u8>,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawLine> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let rest = self.buffer.split_off(pos + 1);
            let raw = std::mem::replace(&mut self.buffer, rest);
            lines.push(to_raw_line(raw));
        }

        lines
    }

    /// Drains whatever is left after the upstream closed without a final LF.
    pub fn finish(&mut self) -> Option<RawLine> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(to_raw_line(std::mem::take(&mut self.buffer)))
    }
}

fn to_raw_line(raw: Vec<u8>) -> RawLine {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    let text = String::from_utf8_lossy(&raw[..end]).into_owned();
    RawLine {
        raw: Bytes::from(raw),
        text,
    }
}

/// What one SSE line means to the retry engine.
#[derive(Debug, Clone, PartialEq)]
pub enum LineVerdict {
    /// The provider refused to generate (safety / content filter).
    Blocked,
    /// A candidate part with text. `finish_reason` is set when the same chunk
    /// also carries the terminal marker.
    Data {
        text: String,
        is_thought: bool,
        finish_reason: Option<String>,
    },
    /// A finish-reason carrier without any text part.
    Finish(String),
    /// Comments, keep-alives, empty lines, non-JSON payloads.
    Other,
}

pub fn classify_line(line: &str) -> LineVerdict {
    let Some(payload) = line.trim_start().strip_prefix("data:") else {
        return LineVerdict::Other;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return LineVerdict::Other;
    }
    let Ok(chunk) = serde_json::from_str::<StreamChunk>(payload) else {
        return LineVerdict::Other;
    };

    if is_blocked(&chunk) {
        return LineVerdict::Blocked;
    }

    // Multi-candidate responses are out of scope; only the first is read.
    let candidate = chunk.candidates.first();
    let finish_reason = candidate.and_then(|c| c.finish_reason.clone());

    if let Some(part) = candidate
        .and_then(|c| c.content.as_ref())
        .and_then(|content| content.parts.iter().find(|p| p.text.is_some()))
    {
        return LineVerdict::Data {
            text: part.text.clone().unwrap_or_default(),
            is_thought: part.thought.unwrap_or(false),
            finish_reason,
        };
    }

    match finish_reason {
        Some(reason) => LineVerdict::Finish(reason),
        None => LineVerdict::Other,
    }
}

fn is_blocked(chunk: &StreamChunk) -> bool {
    if let Some(feedback) = &chunk.prompt_feedback {
        if feedback.block_reason.is_some() {
            return true;
        }
        if ratings_blocked(feedback.safety_ratings.as_deref()) {
            return true;
        }
    }
    chunk
        .candidates
        .iter()
        .any(|c| ratings_blocked(c.safety_ratings.as_deref()))
}

fn ratings_blocked(ratings: Option<&[crate::gemini::SafetyRating]>) -> bool {
    ratings
        .map(|rs| rs.iter().any(|r| r.blocked == Some(true)))
        .unwrap_or(false)
}

pub fn ends_with_terminal_punctuation(text: &str) -> bool {
    text.trim_end()
        .chars()
        .next_back()
        .map(|c| TERMINAL_PUNCTUATION.contains(&c))
        .unwrap_or(false)
}

/// A stream is complete iff the upstream said STOP and the accumulated output
/// reads as a finished sentence.
pub fn validate_stream_completion(accumulated: &str, last_finish_reason: Option<&str>) -> bool {
    last_finish_reason == Some(FINISH_REASON_STOP)
        && !accumulated.trim().is_empty()
        && ends_with_terminal_punctuation(accumulated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_line(payload: &str) -> String {
        format!("data: {payload}")
    }

    #[test]
    fn scanner_reassembles_lines_across_chunks() {
        let mut scanner = LineScanner::new();
        let first = scanner.push(b"data: {\"a\"");
        assert!(first.is_empty());
        let second = scanner.push(b": 1}\ndata: x\n");
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].text, "data: {\"a\": 1}");
        assert_eq!(second[0].raw.as_ref(), b"data: {\"a\": 1}\n");
        assert_eq!(second[1].text, "data: x");
    }

    #[test]
    fn scanner_strips_crlf_from_text_but_not_raw() {
        let mut scanner = LineScanner::new();
        let lines = scanner.push(b"data: x\r\n");
        assert_eq!(lines[0].text, "data: x");
        assert_eq!(lines[0].raw.as_ref(), b"data: x\r\n");
    }

    #[test]
    fn scanner_finish_drains_trailing_partial_line() {
        let mut scanner = LineScanner::new();
        assert!(scanner.push(b"data: tail").is_empty());
        let last = scanner.finish().unwrap();
        assert_eq!(last.text, "data: tail");
        assert!(scanner.finish().is_none());
    }

    #[test]
    fn classifies_text_chunk() {
        let line = data_line(r#"{"candidates":[{"content":{"parts":[{"text":"Hello"}]}}]}"#);
        assert_eq!(
            classify_line(&line),
            LineVerdict::Data {
                text: "Hello".to_string(),
                is_thought: false,
                finish_reason: None,
            }
        );
    }

    #[test]
    fn classifies_thought_chunk() {
        let line = data_line(
            r#"{"candidates":[{"content":{"parts":[{"text":"hmm","thought":true}]}}]}"#,
        );
        assert_eq!(
            classify_line(&line),
            LineVerdict::Data {
                text: "hmm".to_string(),
                is_thought: true,
                finish_reason: None,
            }
        );
    }

    #[test]
    fn data_chunk_may_carry_finish_reason() {
        let line = data_line(
            r#"{"candidates":[{"content":{"parts":[{"text":" world."}]},"finishReason":"STOP"}]}"#,
        );
        assert_eq!(
            classify_line(&line),
            LineVerdict::Data {
                text: " world.".to_string(),
                is_thought: false,
                finish_reason: Some("STOP".to_string()),
            }
        );
    }

    #[test]
    fn classifies_bare_finish_reason() {
        let line = data_line(r#"{"candidates":[{"finishReason":"MAX_TOKENS"}]}"#);
        assert_eq!(
            classify_line(&line),
            LineVerdict::Finish("MAX_TOKENS".to_string())
        );
    }

    #[test]
    fn classifies_prompt_feedback_block() {
        let line = data_line(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#);
        assert_eq!(classify_line(&line), LineVerdict::Blocked);
    }

    #[test]
    fn classifies_safety_rating_block() {
        let line = data_line(
            r#"{"candidates":[{"safetyRatings":[{"category":"HARM_CATEGORY_HATE_SPEECH","blocked":true}]}]}"#,
        );
        assert_eq!(classify_line(&line), LineVerdict::Blocked);
    }

    #[test]
    fn comments_and_keepalives_are_other() {
        assert_eq!(classify_line(": keep-alive"), LineVerdict::Other);
        assert_eq!(classify_line(""), LineVerdict::Other);
        assert_eq!(classify_line("event: ping"), LineVerdict::Other);
        assert_eq!(classify_line("data: [DONE]"), LineVerdict::Other);
    }

    #[test]
    fn empty_text_part_is_still_data() {
        let line = data_line(r#"{"candidates":[{"content":{"parts":[{"text":""}]}}]}"#);
        assert_eq!(
            classify_line(&line),
            LineVerdict::Data {
                text: String::new(),
                is_thought: false,
                finish_reason: None,
            }
        );
    }

    #[test]
    fn completion_requires_stop_text_and_terminal_punctuation() {
        assert!(validate_stream_completion("Hello world.", Some("STOP")));
        assert!(validate_stream_completion("好的。", Some("STOP")));
        assert!(validate_stream_completion("Done!  ", Some("STOP")));
        assert!(!validate_stream_completion("Hello world", Some("STOP")));
        assert!(!validate_stream_completion("", Some("STOP")));
        assert!(!validate_stream_completion("   ", Some("STOP")));
        assert!(!validate_stream_completion("Hello world.", Some("MAX_TOKENS")));
        assert!(!validate_stream_completion("Hello world.", None));
    }
}
