//! The three-stage silence-timer cascade.
//!
//! All three stages are anchored to the same instant: the most recent
//! recognition event. Resetting cancels any pending stage and re-anchors
//! all three. A single task sleeps through the stages sequentially, so
//! at most one stage is ever pending per cascade generation.
//!
//! Fires carry the generation they belong to; the controller ignores
//! fires from a superseded generation. This is what makes a recognition
//! event arriving in the same tick as a fire win deterministically: the
//! event bumps the generation before the queued fire is processed.

use crate::config::TurnConfig;
use crate::messages::{CascadeStage, SessionEvent, TimerFire};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-session silence cascade.
pub struct SilenceCascade {
    inbox: mpsc::UnboundedSender<SessionEvent>,
    llm_delay: Duration,
    tts_delay: Duration,
    play_delay: Duration,
    generation: u64,
    pending: Option<CancellationToken>,
}

impl SilenceCascade {
    /// Create a disarmed cascade feeding the given controller inbox.
    pub fn new(config: &TurnConfig, inbox: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            inbox,
            llm_delay: Duration::from_millis(config.llm_delay_ms),
            tts_delay: Duration::from_millis(config.tts_delay_ms),
            play_delay: Duration::from_millis(config.play_delay_ms),
            generation: 0,
            pending: None,
        }
    }

    /// Cancel any pending stage and re-anchor all three stages to now.
    ///
    /// Issuing two resets back-to-back with no intervening fire is
    /// equivalent to one reset: the first generation's task is cancelled
    /// before it can fire.
    pub fn reset(&mut self) -> u64 {
        self.disarm();

        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        self.pending = Some(token.clone());

        let inbox = self.inbox.clone();
        let stages = [
            (self.llm_delay, CascadeStage::Llm),
            (self.tts_delay, CascadeStage::Tts),
            (self.play_delay, CascadeStage::Play),
        ];
        tokio::spawn(async move {
            let mut elapsed = Duration::ZERO;
            for (at, stage) in stages {
                let wait = at.saturating_sub(elapsed);
                tokio::select! {
                    () = token.cancelled() => return,
                    () = tokio::time::sleep(wait) => {}
                }
                elapsed = at;
                let fire = TimerFire { generation, stage };
                if inbox.send(SessionEvent::Timer(fire)).is_err() {
                    return;
                }
            }
        });

        generation
    }

    /// Cancel any pending stage without re-arming.
    ///
    /// The generation is bumped so fires already queued in the inbox are
    /// recognizably stale.
    pub fn disarm(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
            self.generation += 1;
        }
    }

    /// Whether a stage is currently pending.
    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// The current cascade generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a fire belongs to the current generation of an armed cascade.
    pub fn accepts(&self, fire: TimerFire) -> bool {
        self.is_armed() && fire.generation == self.generation
    }
}

impl Drop for SilenceCascade {
    fn drop(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn test_config() -> TurnConfig {
        TurnConfig::default()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<TimerFire> {
        let mut fires = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Timer(fire) = event {
                fires.push(fire);
            }
        }
        fires
    }

    /// Yield repeatedly so every ready task runs without advancing time.
    async fn settle() {
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }
    }

    /// Advance paused time, letting timers fire and tasks settle.
    async fn advance_ms(ms: u64) {
        let step = Duration::from_millis(10);
        let mut remaining = Duration::from_millis(ms);
        while remaining > Duration::ZERO {
            let chunk = remaining.min(step);
            tokio::time::advance(chunk).await;
            remaining -= chunk;
            settle().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_llm_stage_after_silence_window() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cascade = SilenceCascade::new(&test_config(), tx);
        let generation = cascade.reset();
        settle().await;

        advance_ms(499).await;
        assert!(drain(&mut rx).is_empty());

        advance_ms(2).await;
        let fires = drain(&mut rx);
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].stage, CascadeStage::Llm);
        assert_eq!(fires[0].generation, generation);
    }

    #[tokio::test(start_paused = true)]
    async fn stages_fire_in_order_from_one_anchor() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cascade = SilenceCascade::new(&test_config(), tx);
        cascade.reset();
        settle().await;

        advance_ms(2_100).await;
        let stages: Vec<CascadeStage> = drain(&mut rx).iter().map(|f| f.stage).collect();
        assert_eq!(
            stages,
            vec![CascadeStage::Llm, CascadeStage::Tts, CascadeStage::Play]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_cancels_pending_stage() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cascade = SilenceCascade::new(&test_config(), tx);
        cascade.reset();
        settle().await;

        advance_ms(400).await;
        let generation = cascade.reset();
        settle().await;

        // The original anchor's fire time passes without a fire.
        advance_ms(200).await;
        assert!(drain(&mut rx).is_empty());

        // The new anchor fires on its own schedule.
        advance_ms(310).await;
        let fires = drain(&mut rx);
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].generation, generation);
    }

    #[tokio::test(start_paused = true)]
    async fn back_to_back_resets_equal_one_reset() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cascade = SilenceCascade::new(&test_config(), tx);
        cascade.reset();
        let generation = cascade.reset();
        settle().await;

        advance_ms(510).await;
        let fires = drain(&mut rx);
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].generation, generation);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_fire_and_stales_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cascade = SilenceCascade::new(&test_config(), tx);
        let generation = cascade.reset();
        cascade.disarm();

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(!cascade.is_armed());
        assert!(!cascade.accepts(TimerFire {
            generation,
            stage: CascadeStage::Llm
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_fire_is_rejected() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut cascade = SilenceCascade::new(&test_config(), tx);
        let old = cascade.reset();
        let new = cascade.reset();

        assert!(!cascade.accepts(TimerFire {
            generation: old,
            stage: CascadeStage::Llm
        }));
        assert!(cascade.accepts(TimerFire {
            generation: new,
            stage: CascadeStage::Llm
        }));
        let _ = drain(&mut rx);
    }
}
