//! Single-slot, TTL-bounded cache for interrupted replies.
//!
//! When the user interrupts during generation, the reply that was about
//! to be spoken is parked here. If their next silence arrives within the
//! TTL, the parked reply is served directly; otherwise it is discarded.
//!
//! A slot, not a queue: interrupting twice replaces the first pending
//! reply with the second. Stacking replies would desynchronize the agent
//! from the current topic.

use std::time::Duration;
use tokio::time::Instant;

/// The single cache slot.
#[derive(Debug)]
pub struct ReplyCache {
    slot: Option<CachedReply>,
    ttl: Duration,
}

#[derive(Debug)]
struct CachedReply {
    text: String,
    started_at: Instant,
}

impl ReplyCache {
    /// Create an empty cache with the given TTL.
    pub fn new(ttl: Duration) -> Self {
        Self { slot: None, ttl }
    }

    /// Write the slot, overwriting any prior entry, stamped now.
    pub fn set(&mut self, text: String) {
        self.slot = Some(CachedReply {
            text,
            started_at: Instant::now(),
        });
    }

    /// If the slot is present and unexpired, clear and return it;
    /// otherwise clear and return nothing.
    pub fn take(&mut self) -> Option<String> {
        let entry = self.slot.take()?;
        if entry.started_at.elapsed() < self.ttl {
            Some(entry.text)
        } else {
            None
        }
    }

    /// Replace the slot text without refreshing its timestamp.
    ///
    /// Used when a late `reply_ready` arrives after the interrupt that
    /// seeded the slot: the fuller reply is kept, but the TTL still
    /// measures from the interruption. An expired slot is discarded
    /// instead. Returns whether the text was applied.
    pub fn refresh_text(&mut self, text: String) -> bool {
        match self.slot.as_mut() {
            Some(entry) if entry.started_at.elapsed() < self.ttl => {
                entry.text = text;
                true
            }
            Some(_) => {
                self.slot = None;
                false
            }
            None => false,
        }
    }

    /// Unconditional clear.
    pub fn clear(&mut self) {
        self.slot = None;
    }

    /// Whether the slot currently holds an entry (expired or not).
    pub fn is_occupied(&self) -> bool {
        self.slot.is_some()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn take_returns_fresh_entry_and_clears() {
        let mut cache = ReplyCache::new(TTL);
        cache.set("hello there".to_owned());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.take(), Some("hello there".to_owned()));
        assert!(!cache.is_occupied());
        assert_eq!(cache.take(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn take_discards_expired_entry() {
        let mut cache = ReplyCache::new(TTL);
        cache.set("stale".to_owned());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.take(), None);
        assert!(!cache.is_occupied());
    }

    #[tokio::test(start_paused = true)]
    async fn set_overwrites_prior_slot() {
        let mut cache = ReplyCache::new(TTL);
        cache.set("first".to_owned());
        cache.set("second".to_owned());
        assert_eq!(cache.take(), Some("second".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_keeps_original_timestamp() {
        let mut cache = ReplyCache::new(TTL);
        cache.set(String::new());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(cache.refresh_text("late but full reply".to_owned()));

        // 3s + 3s exceeds the original stamp's TTL even though the refresh
        // happened only 3s ago.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(cache.take(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_discards_expired_slot() {
        let mut cache = ReplyCache::new(TTL);
        cache.set("old".to_owned());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!cache.refresh_text("too late".to_owned()));
        assert!(!cache.is_occupied());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_on_empty_slot_is_noop() {
        let mut cache = ReplyCache::new(TTL);
        assert!(!cache.refresh_text("nobody asked".to_owned()));
        assert!(!cache.is_occupied());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_is_unconditional() {
        let mut cache = ReplyCache::new(TTL);
        cache.set("gone".to_owned());
        cache.clear();
        assert_eq!(cache.take(), None);
    }
}
