pub mod gemini;
pub mod sse;

pub use gemini::{ContinuationBody, Content, Part, StreamChunk};
pub use sse::{
    LineScanner, LineVerdict, RawLine, classify_line, ends_with_terminal_punctuation,
    validate_stream_completion,
};
