//! Per-session transcription state.
//!
//! The recognition engine emits the full transcription since its session
//! started, re-emitting the same word prefix on every revision. This
//! module tracks how much of that text belongs to earlier turns, so the
//! controller only ever sees the words of the current turn.

/// Transcription bookkeeping for one session.
#[derive(Debug, Default)]
pub struct TranscriptState {
    /// Most recent progressive text since the last turn boundary.
    latest: String,
    /// Full text the engine has produced this recognition session.
    /// Used only to detect engine-session resets.
    session_text: String,
    /// Whitespace-separated tokens of `session_text` consumed by
    /// earlier turn boundaries.
    consumed_words: usize,
    /// Token count of `latest`.
    word_count: usize,
}

impl TranscriptState {
    /// Create empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a progressive engine result and return the current-turn text.
    ///
    /// If the full text has fewer words than were already consumed, the
    /// engine session restarted from scratch; the consumed prefix is
    /// dropped so the fresh session's words all count as the new turn.
    pub fn apply(&mut self, text: &str) -> &str {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.len() < self.consumed_words {
            self.consumed_words = 0;
        }

        self.session_text = text.to_owned();
        self.latest = words[self.consumed_words..].join(" ");
        self.word_count = words.len() - self.consumed_words;
        &self.latest
    }

    /// Mark a turn boundary: the current-turn text is consumed and
    /// `latest` is reset to empty before the next event may mutate it.
    pub fn mark_boundary(&mut self) {
        self.consumed_words = self.session_text.split_whitespace().count();
        self.latest.clear();
        self.word_count = 0;
    }

    /// Reset everything, including session history.
    ///
    /// Called before commanding a recognition restart so no stale text
    /// survives into the fresh engine session.
    pub fn clear(&mut self) {
        self.latest.clear();
        self.session_text.clear();
        self.consumed_words = 0;
        self.word_count = 0;
    }

    /// Current-turn text.
    pub fn latest(&self) -> &str {
        &self.latest
    }

    /// Whether the current-turn text is non-empty after trimming.
    pub fn has_speech(&self) -> bool {
        !self.latest.trim().is_empty()
    }

    /// Token count of the current-turn text.
    pub fn word_count(&self) -> usize {
        self.word_count
    }
}
