//! Conversation turn records and the on-disk journal.
//!
//! The turn controller owns record creation and flag mutation; this
//! module owns persistence. Turns are appended as JSONL, one file per
//! session, so writes are race-free across sessions.

use crate::config::JournalConfig;
use crate::error::{Result, VoiceError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

/// One completed (or aborted) conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Monotonic turn number within the session.
    pub turn: u64,
    /// Session this turn belongs to.
    pub session_id: String,
    /// What the user said.
    pub user_text: String,
    /// What the agent replied (may be empty if generation never finished).
    pub agent_text: String,
    /// The user interrupted while the reply was being generated.
    pub interrupted_during_generation: bool,
    /// The user interrupted while the reply was being spoken.
    pub interrupted_during_playback: bool,
    /// The reply was served from the prefetch cache.
    pub served_from_cache: bool,
    /// The pipeline failed for this turn.
    pub error: bool,
    /// When the turn was launched.
    pub started_at: DateTime<Utc>,
    /// When the turn was finalized.
    pub finished_at: DateTime<Utc>,
}

impl ConversationTurn {
    /// Start a new record with all flags clear.
    pub fn begin(session_id: &str, turn: u64, user_text: String) -> Self {
        let now = Utc::now();
        Self {
            turn,
            session_id: session_id.to_owned(),
            user_text,
            agent_text: String::new(),
            interrupted_during_generation: false,
            interrupted_during_playback: false,
            served_from_cache: false,
            error: false,
            started_at: now,
            finished_at: now,
        }
    }
}

/// Append-only JSONL journal, one file per session.
#[derive(Debug, Clone)]
pub struct ConversationJournal {
    root: Option<PathBuf>,
}

impl ConversationJournal {
    /// Create a journal from config. A disabled journal drops all writes.
    pub fn new(config: &JournalConfig) -> Self {
        Self {
            root: config.enabled.then(|| config.resolved_root()),
        }
    }

    /// A journal that persists nothing (`--skip-journal`).
    pub fn disabled() -> Self {
        Self { root: None }
    }

    /// Append a finalized turn record.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal directory or file cannot be written.
    pub fn record(&self, turn: &ConversationTurn) -> Result<()> {
        let Some(root) = &self.root else {
            debug!(turn = turn.turn, "journal disabled, dropping turn record");
            return Ok(());
        };

        std::fs::create_dir_all(root)?;
        let path = root.join(format!("{}.jsonl", turn.session_id));
        let line = serde_json::to_string(turn)
            .map_err(|e| VoiceError::Journal(format!("turn serialization failed: {e}")))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Read all records for a session, in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn read_session(&self, session_id: &str) -> Result<Vec<ConversationTurn>> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };
        let path = root.join(format!("{session_id}.jsonl"));
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(&path)?;
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l)
                    .map_err(|e| VoiceError::Journal(format!("corrupt journal line: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn temp_journal() -> (ConversationJournal, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = JournalConfig {
            enabled: true,
            root_dir: Some(dir.path().to_path_buf()),
        };
        (ConversationJournal::new(&config), dir)
    }

    #[test]
    fn records_round_trip_in_order() {
        let (journal, _dir) = temp_journal();

        let mut first = ConversationTurn::begin("s1", 1, "hello".to_owned());
        first.agent_text = "hi there".to_owned();
        journal.record(&first).unwrap();

        let mut second = ConversationTurn::begin("s1", 2, "tell me a story".to_owned());
        second.interrupted_during_generation = true;
        journal.record(&second).unwrap();

        let turns = journal.read_session("s1").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].turn, 1);
        assert_eq!(turns[0].agent_text, "hi there");
        assert!(turns[1].interrupted_during_generation);
        assert!(!turns[1].served_from_cache);
    }

    #[test]
    fn sessions_are_isolated_by_file() {
        let (journal, _dir) = temp_journal();
        journal
            .record(&ConversationTurn::begin("a", 1, "one".to_owned()))
            .unwrap();
        journal
            .record(&ConversationTurn::begin("b", 1, "two".to_owned()))
            .unwrap();

        assert_eq!(journal.read_session("a").unwrap().len(), 1);
        assert_eq!(journal.read_session("b").unwrap().len(), 1);
        assert_eq!(journal.read_session("a").unwrap()[0].user_text, "one");
    }

    #[test]
    fn disabled_journal_drops_writes() {
        let journal = ConversationJournal::disabled();
        journal
            .record(&ConversationTurn::begin("s", 1, "x".to_owned()))
            .unwrap();
        assert!(journal.read_session("s").unwrap().is_empty());
    }

    #[test]
    fn missing_session_reads_empty() {
        let (journal, _dir) = temp_journal();
        assert!(journal.read_session("nope").unwrap().is_empty());
    }
}
