//! The response pipeline: LLM → TTS → playback, cancelable at any stage.
//!
//! The controller owns the pipeline for the duration of a turn; the
//! pipeline holds only a send-only handle to the controller's inbox.
//! Cancelling drops through every stage within the cancel budget, and
//! a reply that completes just after cancellation is still surfaced so
//! the controller can park it in the response cache.

use crate::audio::AudioOutput;
use crate::error::VoiceError;
use crate::llm::{ChatTurn, LanguageModel};
use crate::messages::{PipelineSignal, PlaybackEndReason, SessionEvent};
use crate::tts::SpeechSynthesizer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared service handles a pipeline runs against.
#[derive(Clone)]
pub struct PipelineServices {
    /// Language model collaborator.
    pub llm: Arc<dyn LanguageModel>,
    /// Speech synthesis collaborator.
    pub tts: Arc<dyn SpeechSynthesizer>,
    /// Playback half of the audio bridge.
    pub output: Arc<dyn AudioOutput>,
    /// Send-only handle into the controller inbox.
    pub inbox: mpsc::UnboundedSender<SessionEvent>,
}

/// Pipeline timing knobs, lifted from the orchestrator config.
#[derive(Debug, Clone, Copy)]
pub struct PipelineTiming {
    /// Upper bound between reply text and audible playback.
    pub play_ready_timeout: Duration,
    /// How long an untrusted upstream gets to acknowledge a cancel.
    pub cancel_budget: Duration,
    /// How long a cancelled LLM call may keep running in the background
    /// in the hope of salvaging its reply for the response cache. Past
    /// the cache TTL the text could never be served, so that is the cap.
    pub salvage_window: Duration,
}

impl PipelineTiming {
    /// Lift the relevant fields out of the config.
    pub fn new(turn: &crate::config::TurnConfig, cache: &crate::config::CacheConfig) -> Self {
        Self {
            play_ready_timeout: Duration::from_millis(turn.play_ready_timeout_ms),
            cancel_budget: Duration::from_millis(turn.cancel_budget_ms),
            salvage_window: Duration::from_millis(cache.ttl_ms),
        }
    }
}

/// A launched response pipeline for one turn.
pub struct ResponsePipeline {
    turn: u64,
    cancel: CancellationToken,
}

impl ResponsePipeline {
    /// Launch the full LLM → TTS → playback chain for a user utterance.
    pub fn launch(
        turn: u64,
        history: Vec<ChatTurn>,
        user_text: String,
        services: PipelineServices,
        timing: PipelineTiming,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run_generate(turn, history, user_text, services, timing, task_cancel).await;
        });
        Self { turn, cancel }
    }

    /// Launch TTS + playback for an already-known reply (cache serve).
    pub fn launch_cached(
        turn: u64,
        reply: String,
        services: PipelineServices,
        timing: PipelineTiming,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            run_speak(turn, reply, &services, timing, &task_cancel).await;
        });
        Self { turn, cancel }
    }

    /// Abort whatever stage is running.
    ///
    /// The token is observed at every suspension point, so the stages
    /// unwind without waiting on upstream acknowledgment.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The turn this pipeline was launched for.
    pub fn turn(&self) -> u64 {
        self.turn
    }
}

impl Drop for ResponsePipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Stage 1: LLM generation, then hand off to speech.
async fn run_generate(
    turn: u64,
    history: Vec<ChatTurn>,
    user_text: String,
    services: PipelineServices,
    timing: PipelineTiming,
    cancel: CancellationToken,
) {
    info!(turn, "pipeline launched for: {user_text}");

    let reply_future = services.llm.reply(&history, &user_text, &cancel);
    tokio::pin!(reply_future);

    let reply = tokio::select! {
        () = cancel.cancelled() => {
            // The stage is aborted, but the in-flight call is left to
            // finish in the background: a reply completing before the
            // cache TTL runs out can still be parked in the response
            // cache and served on the user's next pause.
            if let Ok(Ok(text)) =
                tokio::time::timeout(timing.salvage_window, &mut reply_future).await
                && !text.trim().is_empty()
            {
                debug!(turn, "salvaged reply that completed after cancel");
                let _ = services
                    .inbox
                    .send(SessionEvent::Pipeline(PipelineSignal::ReplyReady {
                        turn,
                        text,
                    }));
            }
            return;
        }
        result = &mut reply_future => match result {
            Ok(text) => text,
            Err(e) => {
                fail(&services, turn, &e);
                return;
            }
        },
    };

    let _ = services
        .inbox
        .send(SessionEvent::Pipeline(PipelineSignal::ReplyReady {
            turn,
            text: reply.clone(),
        }));

    run_speak(turn, reply, &services, timing, &cancel).await;
}

/// Stages 2 and 3: synthesize and play, bounded by the readiness gate.
async fn run_speak(
    turn: u64,
    text: String,
    services: &PipelineServices,
    timing: PipelineTiming,
    cancel: &CancellationToken,
) {
    let synth = services.tts.synthesize(&text, cancel);
    let audio = tokio::select! {
        () = cancel.cancelled() => return,
        result = tokio::time::timeout(timing.play_ready_timeout, synth) => match result {
            Ok(Ok(audio)) => audio,
            Ok(Err(e)) => {
                fail(services, turn, &e);
                return;
            }
            Err(_) => {
                // Discard the pending audio: the reply is stale by now.
                fail(
                    services,
                    turn,
                    &VoiceError::PlaybackTimeout(timing.play_ready_timeout.as_millis() as u64),
                );
                return;
            }
        },
    };

    let _ = services
        .inbox
        .send(SessionEvent::Pipeline(PipelineSignal::PlaybackBegin { turn }));

    let play = services.output.play(audio);
    tokio::pin!(play);
    let reason = tokio::select! {
        () = cancel.cancelled() => {
            services.output.stop_playback();
            match tokio::time::timeout(timing.cancel_budget, &mut play).await {
                Ok(Ok(reason)) => reason,
                _ => PlaybackEndReason::StoppedByInterrupt,
            }
        }
        result = &mut play => match result {
            Ok(reason) => reason,
            Err(e) => {
                fail(services, turn, &e);
                return;
            }
        },
    };

    let _ = services
        .inbox
        .send(SessionEvent::Pipeline(PipelineSignal::PlaybackEnd {
            turn,
            reason,
        }));
}

fn fail(services: &PipelineServices, turn: u64, error: &VoiceError) {
    warn!(turn, "pipeline failed: {error}");
    let _ = services
        .inbox
        .send(SessionEvent::Pipeline(PipelineSignal::Failed {
            turn,
            message: error.to_string(),
        }));
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::error::Result;
    use crate::messages::SynthesizedAudio;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubLlm {
        reply: String,
        delay: Duration,
    }

    #[async_trait]
    impl LanguageModel for StubLlm {
        async fn reply(
            &self,
            _history: &[ChatTurn],
            _user_text: &str,
            _cancel: &CancellationToken,
        ) -> Result<String> {
            // Deliberately ignores the token: models the untrusted upstream.
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.clone())
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LanguageModel for FailingLlm {
        async fn reply(
            &self,
            _history: &[ChatTurn],
            _user_text: &str,
            _cancel: &CancellationToken,
        ) -> Result<String> {
            Err(VoiceError::Pipeline("boom".to_owned()))
        }
    }

    struct StubTts {
        delay: Duration,
    }

    #[async_trait]
    impl SpeechSynthesizer for StubTts {
        async fn synthesize(
            &self,
            _text: &str,
            _cancel: &CancellationToken,
        ) -> Result<SynthesizedAudio> {
            tokio::time::sleep(self.delay).await;
            Ok(SynthesizedAudio {
                samples: vec![0.0; 240],
                sample_rate: 24_000,
            })
        }
    }

    struct StubOutput {
        play_duration: Duration,
        stopped: AtomicBool,
    }

    #[async_trait]
    impl AudioOutput for StubOutput {
        async fn play(&self, _audio: SynthesizedAudio) -> Result<PlaybackEndReason> {
            let tick = Duration::from_millis(10);
            let mut elapsed = Duration::ZERO;
            while elapsed < self.play_duration {
                if self.stopped.load(Ordering::Relaxed) {
                    return Ok(PlaybackEndReason::StoppedByInterrupt);
                }
                tokio::time::sleep(tick).await;
                elapsed += tick;
            }
            Ok(PlaybackEndReason::Completed)
        }

        fn stop_playback(&self) {
            self.stopped.store(true, Ordering::Relaxed);
        }
    }

    fn services(
        llm: Arc<dyn LanguageModel>,
        tts_delay: Duration,
        play_duration: Duration,
    ) -> (PipelineServices, mpsc::UnboundedReceiver<SessionEvent>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let services = PipelineServices {
            llm,
            tts: Arc::new(StubTts { delay: tts_delay }),
            output: Arc::new(StubOutput {
                play_duration,
                stopped: AtomicBool::new(false),
            }),
            inbox: inbox_tx,
        };
        (services, inbox_rx)
    }

    fn timing() -> PipelineTiming {
        PipelineTiming {
            play_ready_timeout: Duration::from_secs(5),
            cancel_budget: Duration::from_millis(200),
            salvage_window: Duration::from_secs(5),
        }
    }

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> PipelineSignal {
        match rx.recv().await.expect("signal") {
            SessionEvent::Pipeline(signal) => signal,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_signals_in_order() {
        let llm = Arc::new(StubLlm {
            reply: "hi there".to_owned(),
            delay: Duration::from_millis(100),
        });
        let (services, mut rx) = services(llm, Duration::from_millis(50), Duration::from_millis(80));
        let _pipeline = ResponsePipeline::launch(
            1,
            Vec::new(),
            "hello".to_owned(),
            services,
            timing(),
        );

        match next_signal(&mut rx).await {
            PipelineSignal::ReplyReady { turn, text } => {
                assert_eq!(turn, 1);
                assert_eq!(text, "hi there");
            }
            other => panic!("expected ReplyReady, got {other:?}"),
        }
        assert!(matches!(
            next_signal(&mut rx).await,
            PipelineSignal::PlaybackBegin { turn: 1 }
        ));
        match next_signal(&mut rx).await {
            PipelineSignal::PlaybackEnd { reason, .. } => {
                assert_eq!(reason, PlaybackEndReason::Completed);
            }
            other => panic!("expected PlaybackEnd, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_llm_salvages_late_reply() {
        let llm = Arc::new(StubLlm {
            reply: "late reply".to_owned(),
            delay: Duration::from_secs(3),
        });
        let (services, mut rx) = services(llm, Duration::ZERO, Duration::ZERO);
        let pipeline =
            ResponsePipeline::launch(2, Vec::new(), "q".to_owned(), services, timing());

        tokio::time::sleep(Duration::from_millis(150)).await;
        pipeline.cancel();

        // The reply completes ~2.9s after cancel, inside the salvage window.
        match next_signal(&mut rx).await {
            PipelineSignal::ReplyReady { turn, text } => {
                assert_eq!(turn, 2);
                assert_eq!(text, "late reply");
            }
            other => panic!("expected salvaged ReplyReady, got {other:?}"),
        }
        // Nothing else follows: no playback for a cancelled turn.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_llm_beyond_salvage_window_stays_silent() {
        let llm = Arc::new(StubLlm {
            reply: "too late".to_owned(),
            delay: Duration::from_secs(8),
        });
        let (services, mut rx) = services(llm, Duration::ZERO, Duration::ZERO);
        let pipeline =
            ResponsePipeline::launch(3, Vec::new(), "q".to_owned(), services, timing());

        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.cancel();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn llm_failure_signals_failed() {
        let (services, mut rx) = services(Arc::new(FailingLlm), Duration::ZERO, Duration::ZERO);
        let _pipeline =
            ResponsePipeline::launch(4, Vec::new(), "q".to_owned(), services, timing());

        assert!(matches!(
            next_signal(&mut rx).await,
            PipelineSignal::Failed { turn: 4, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tts_trips_the_readiness_gate() {
        let llm = Arc::new(StubLlm {
            reply: "reply".to_owned(),
            delay: Duration::ZERO,
        });
        // TTS slower than the 5s readiness window.
        let (services, mut rx) = services(llm, Duration::from_secs(8), Duration::ZERO);
        let _pipeline =
            ResponsePipeline::launch(5, Vec::new(), "q".to_owned(), services, timing());

        assert!(matches!(
            next_signal(&mut rx).await,
            PipelineSignal::ReplyReady { .. }
        ));
        match next_signal(&mut rx).await {
            PipelineSignal::Failed { turn, message } => {
                assert_eq!(turn, 5);
                assert!(message.contains("playback did not begin"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_playback_stops_and_reports() {
        let llm = Arc::new(StubLlm {
            reply: "reply".to_owned(),
            delay: Duration::ZERO,
        });
        let (services, mut rx) = services(llm, Duration::ZERO, Duration::from_secs(4));
        let pipeline =
            ResponsePipeline::launch(6, Vec::new(), "q".to_owned(), services, timing());

        assert!(matches!(
            next_signal(&mut rx).await,
            PipelineSignal::ReplyReady { .. }
        ));
        assert!(matches!(
            next_signal(&mut rx).await,
            PipelineSignal::PlaybackBegin { .. }
        ));

        pipeline.cancel();
        match next_signal(&mut rx).await {
            PipelineSignal::PlaybackEnd { reason, .. } => {
                assert_eq!(reason, PlaybackEndReason::StoppedByInterrupt);
            }
            other => panic!("expected PlaybackEnd, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cached_launch_skips_the_llm() {
        let (services, mut rx) = services(
            Arc::new(FailingLlm),
            Duration::from_millis(20),
            Duration::from_millis(30),
        );
        let _pipeline =
            ResponsePipeline::launch_cached(7, "parked reply".to_owned(), services, timing());

        assert!(matches!(
            next_signal(&mut rx).await,
            PipelineSignal::PlaybackBegin { turn: 7 }
        ));
        assert!(matches!(
            next_signal(&mut rx).await,
            PipelineSignal::PlaybackEnd {
                reason: PlaybackEndReason::Completed,
                ..
            }
        ));
    }
}
