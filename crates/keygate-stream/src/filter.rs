use std::sync::Mutex;

use serde::Serialize;

use keygate_common::ProxySettings;
use keygate_protocol::ends_with_terminal_punctuation;

/// Observable filter state, copied out for management reads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterState {
    pub swallow_mode_active: bool,
    pub is_outputting_formal_text: bool,
    /// Consecutive formal chunks ending in sentence-terminating punctuation.
    pub resume_punct_streak: u32,
    pub last_formal_text: String,
    /// Set once swallow mode has been exited by formal text.
    pub flushed: bool,
}

/// Gatekeeper between the line parser and the client writer.
///
/// During a retry attempt the upstream usually re-thinks before it resumes
/// the answer; those thought chunks were never part of the visible output and
/// must not appear mid-sentence. Swallow mode holds them back until formal
/// text shows up again.
#[derive(Debug, Default)]
pub struct ThoughtFilter {
    state: Mutex<FilterState>,
}

impl ThoughtFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called exactly once on entry to each retry attempt.
    pub fn enable_swallow_mode(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.swallow_mode_active = true;
        state.is_outputting_formal_text = false;
        state.resume_punct_streak = 0;
    }

    pub fn disable_swallow_mode(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.swallow_mode_active = false;
        state.resume_punct_streak = 0;
        state.last_formal_text.clear();
    }

    /// Whether the chunk must be held back instead of written to the client.
    pub fn should_swallow(&self, is_thought: bool, is_retry: bool, settings: &ProxySettings) -> bool {
        if !is_retry || !settings.swallow_thoughts_after_retry {
            return false;
        }
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.swallow_mode_active {
            return false;
        }
        is_thought
    }

    /// Applies the exit rule after a formal chunk was forwarded during a
    /// retry. Without the punctuation heuristic, the first formal chunk ends
    /// swallow mode; with it, two consecutive sentence-ending chunks are
    /// required and any other chunk resets the streak.
    pub fn note_formal_text(&self, text: &str, settings: &ProxySettings) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.is_outputting_formal_text = true;
        state.last_formal_text = text.to_string();
        if !state.swallow_mode_active {
            return;
        }

        if !settings.enable_punctuation_heuristic {
            state.swallow_mode_active = false;
            state.resume_punct_streak = 0;
            state.flushed = true;
            return;
        }

        if ends_with_terminal_punctuation(text) {
            state.resume_punct_streak += 1;
            if state.resume_punct_streak >= 2 {
                state.swallow_mode_active = false;
                state.resume_punct_streak = 0;
                state.flushed = true;
            }
        } else {
            state.resume_punct_streak = 0;
        }
    }

    pub fn snapshot(&self) -> FilterState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(swallow: bool, heuristic: bool) -> ProxySettings {
        ProxySettings {
            swallow_thoughts_after_retry: swallow,
            enable_punctuation_heuristic: heuristic,
            ..ProxySettings::default()
        }
    }

    #[test]
    fn never_swallows_outside_retry() {
        let filter = ThoughtFilter::new();
        filter.enable_swallow_mode();
        assert!(!filter.should_swallow(true, false, &settings(true, false)));
    }

    #[test]
    fn never_swallows_when_disabled_by_settings() {
        let filter = ThoughtFilter::new();
        filter.enable_swallow_mode();
        assert!(!filter.should_swallow(true, true, &settings(false, false)));
    }

    #[test]
    fn swallows_thoughts_until_formal_text() {
        let filter = ThoughtFilter::new();
        let s = settings(true, false);
        filter.enable_swallow_mode();

        assert!(filter.should_swallow(true, true, &s));
        assert!(!filter.should_swallow(false, true, &s));
        filter.note_formal_text("Sure, here is the answer.", &s);

        // Swallow mode is gone; later thoughts pass through untouched.
        assert!(!filter.should_swallow(true, true, &s));
        let state = filter.snapshot();
        assert!(!state.swallow_mode_active);
        assert!(state.flushed);
        assert_eq!(state.last_formal_text, "Sure, here is the answer.");
    }

    #[test]
    fn punctuation_heuristic_requires_two_terminal_chunks() {
        let filter = ThoughtFilter::new();
        let s = settings(true, true);
        filter.enable_swallow_mode();

        filter.note_formal_text("Hmm", &s);
        assert!(filter.snapshot().swallow_mode_active);
        assert_eq!(filter.snapshot().resume_punct_streak, 0);

        filter.note_formal_text("Okay.", &s);
        assert!(filter.snapshot().swallow_mode_active);
        assert_eq!(filter.snapshot().resume_punct_streak, 1);

        filter.note_formal_text("Here.", &s);
        assert!(!filter.snapshot().swallow_mode_active);
    }

    #[test]
    fn non_terminal_chunk_resets_the_streak() {
        let filter = ThoughtFilter::new();
        let s = settings(true, true);
        filter.enable_swallow_mode();

        filter.note_formal_text("First.", &s);
        filter.note_formal_text("and then", &s);
        assert_eq!(filter.snapshot().resume_punct_streak, 0);
        filter.note_formal_text("Second.", &s);
        assert!(filter.snapshot().swallow_mode_active);
        filter.note_formal_text("Third!", &s);
        assert!(!filter.snapshot().swallow_mode_active);
    }

    #[test]
    fn cjk_terminal_punctuation_counts() {
        let filter = ThoughtFilter::new();
        let s = settings(true, true);
        filter.enable_swallow_mode();
        filter.note_formal_text("好的。", &s);
        filter.note_formal_text("请看！", &s);
        assert!(!filter.snapshot().swallow_mode_active);
    }
}
