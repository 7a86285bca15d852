//! The per-session turn controller.
//!
//! A single task owns all session state and drains one inbox of
//! recognition events, pipeline signals, timer fires, and client
//! commands. Every cross-component effect goes through this inbox, so
//! a transcription event can never race a pipeline signal.
//!
//! The event rules, in short:
//! - every non-empty recognition event re-anchors the silence cascade;
//! - the cascade's first stage firing in `Listening` starts a turn;
//! - two or more new words while generating or speaking is an
//!   interruption (one word is noise or echo residue);
//! - an interrupted-during-generation reply is parked in the response
//!   cache and served on the next silence if it is still fresh.

use crate::asr::RecognitionControl;
use crate::config::OrchestratorConfig;
use crate::conversation::{ConversationJournal, ConversationTurn};
use crate::error::VoiceError;
use crate::llm::ChatTurn;
use crate::messages::{
    CascadeStage, PipelineSignal, PlaybackEndReason, RecognitionEvent, SessionCommand,
    SessionEvent, SessionOutput, TimerFire, TurnState,
};
use crate::pipeline::{PipelineServices, PipelineTiming, ResponsePipeline};
use crate::turn::cache::ReplyCache;
use crate::turn::cascade::SilenceCascade;
use crate::turn::transcript::TranscriptState;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Upper bound on turns kept for LLM context; the client trims further.
const HISTORY_CAP: usize = 64;

/// External collaborators the controller drives.
pub struct ControllerDeps {
    /// Recognition adapter handle (restart/stop/epoch).
    pub recognition: Arc<dyn RecognitionControl>,
    /// Services handed to each launched pipeline. `services.inbox` must
    /// feed this controller's own inbox.
    pub services: PipelineServices,
    /// Turn persistence.
    pub journal: ConversationJournal,
    /// Outbound channel to the UI transport.
    pub outputs: mpsc::UnboundedSender<SessionOutput>,
}

/// What to do after handling one event.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Where an interrupt came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptSource {
    /// New words during `Generating` (rule R3).
    Generation,
    /// New words during `Speaking` (rule R4).
    Playback,
    /// `cancel_current_response` from the client.
    Explicit,
}

/// The per-session state machine.
pub struct TurnController {
    session_id: String,
    config: OrchestratorConfig,
    deps: ControllerDeps,
    inbox: mpsc::UnboundedReceiver<SessionEvent>,

    state: TurnState,
    transcript: TranscriptState,
    cascade: SilenceCascade,
    cache: ReplyCache,
    timing: PipelineTiming,

    /// Word-count snapshot taken when the agent last began responding.
    anchor: usize,
    pipeline: Option<ResponsePipeline>,
    turn_seq: u64,
    current: Option<ConversationTurn>,
    /// Turn whose interrupted reply seeded the cache slot.
    cached_turn: Option<u64>,
    /// Most recent `reply_ready` text for the in-flight turn.
    last_reply: Option<String>,
    history: Vec<ChatTurn>,
    tts_playing: bool,
    in_response_pipeline: bool,

    /// Debounced partial forwarding to the UI.
    pending_partial: Option<(String, bool)>,
    debounce_deadline: Option<Instant>,
    idle_deadline: Instant,
    /// When the last transient recognition error was seen.
    last_transient: Option<Instant>,
}

impl TurnController {
    /// Build a controller. `inbox_tx` is the sender half of `inbox_rx`
    /// and also feeds the cascade and launched pipelines.
    pub fn new(
        session_id: String,
        config: OrchestratorConfig,
        deps: ControllerDeps,
        inbox_tx: mpsc::UnboundedSender<SessionEvent>,
        inbox_rx: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        let cascade = SilenceCascade::new(&config.turn, inbox_tx);
        let cache = ReplyCache::new(Duration::from_millis(config.cache.ttl_ms));
        let timing = PipelineTiming::new(&config.turn, &config.cache);
        let idle_deadline = Instant::now() + Duration::from_secs(config.turn.idle_timeout_secs);
        Self {
            session_id,
            config,
            deps,
            inbox: inbox_rx,
            state: TurnState::Listening,
            transcript: TranscriptState::new(),
            cascade,
            cache,
            timing,
            anchor: 0,
            pipeline: None,
            turn_seq: 0,
            current: None,
            cached_turn: None,
            last_reply: None,
            history: Vec::new(),
            tts_playing: false,
            in_response_pipeline: false,
            pending_partial: None,
            debounce_deadline: None,
            idle_deadline,
            last_transient: None,
        }
    }

    /// Drain the inbox until the session ends.
    pub async fn run(mut self) {
        info!(session = %self.session_id, "turn controller started");
        self.emit(SessionOutput::ConversationCreated {
            session_id: self.session_id.clone(),
        });
        self.emit(SessionOutput::StateChanged { state: self.state });

        loop {
            let idle = tokio::time::sleep_until(self.idle_deadline);
            tokio::pin!(idle);

            let flow = tokio::select! {
                event = self.inbox.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => Flow::Stop,
                },
                () = wait_until(self.debounce_deadline) => {
                    self.flush_partial();
                    Flow::Continue
                }
                () = &mut idle => {
                    warn!(session = %self.session_id, "session idle timeout");
                    self.emit(SessionOutput::SessionError {
                        message: "session closed after idle timeout".to_owned(),
                        fatal: true,
                    });
                    Flow::Stop
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }

        self.shutdown().await;
    }

    async fn handle(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Recognition(ev) => {
                self.on_recognition(ev);
                Flow::Continue
            }
            SessionEvent::Timer(fire) => {
                self.on_timer(fire);
                Flow::Continue
            }
            SessionEvent::Pipeline(signal) => self.on_pipeline(signal).await,
            SessionEvent::RecognitionFailure { message, fatal } => {
                self.on_recognition_failure(message, fatal).await
            }
            SessionEvent::Command(SessionCommand::CancelResponse) => {
                if self.in_response_pipeline {
                    self.interrupt(InterruptSource::Explicit);
                } else {
                    debug!("cancel command while listening: nothing to cancel");
                }
                Flow::Continue
            }
            SessionEvent::Command(SessionCommand::Stop) => Flow::Stop,
        }
    }

    // ── Recognition events (rules R1, R3, R4) ─────────────────

    fn on_recognition(&mut self, ev: RecognitionEvent) {
        if ev.epoch != self.deps.recognition.epoch() {
            debug!(epoch = ev.epoch, "dropping recognition event from stale epoch");
            return;
        }
        self.touch_idle();
        if ev.text.is_empty() {
            return;
        }

        self.transcript.apply(&ev.text);

        // UI forwarding is debounced to the end of the revision burst;
        // controller state always updates immediately.
        self.pending_partial = Some((self.transcript.latest().to_owned(), ev.is_final));
        self.debounce_deadline =
            Some(Instant::now() + Duration::from_millis(self.config.turn.debounce_ms));

        match self.state {
            TurnState::Listening => {
                // R1: no refinement-vs-new-speech classification. The
                // cascade collapses whatever delivery pattern the engine
                // has; it only fires when events stop arriving.
                if self.transcript.latest().is_empty() {
                    // Pure re-emission of already-consumed words.
                    self.cascade.disarm();
                } else {
                    self.cascade.reset();
                }
            }
            TurnState::Generating | TurnState::Speaking => {
                let delta = self.transcript.word_count().saturating_sub(self.anchor);
                if delta >= self.config.turn.interrupt_word_delta {
                    let source = if self.state == TurnState::Generating {
                        InterruptSource::Generation
                    } else {
                        InterruptSource::Playback
                    };
                    info!(delta, "user interruption detected");
                    self.interrupt(source);
                } else {
                    debug!(delta, "ignoring sub-threshold speech during response");
                }
            }
        }
    }

    // ── Timer fires (rule R2, cache consultation R5) ──────────

    fn on_timer(&mut self, fire: TimerFire) {
        if !self.cascade.accepts(fire) {
            debug!(
                generation = fire.generation,
                "dropping stale cascade fire"
            );
            return;
        }

        match fire.stage {
            CascadeStage::Llm => {
                if self.state != TurnState::Listening {
                    // Impossible by construction (the cascade is disarmed
                    // outside Listening); log and drop rather than mutate.
                    error!(state = ?self.state, "cascade fired outside Listening");
                    return;
                }
                if !self.transcript.has_speech() {
                    debug!("silence fired with no speech buffered");
                    self.cascade.disarm();
                    return;
                }
                self.start_turn();
            }
            CascadeStage::Tts => {
                // Hook for speculative TTS pre-generation; intentionally inert.
                debug!("cascade reached speculative-synthesis stage");
            }
            CascadeStage::Play => {
                debug!("cascade reached its upper bound");
                self.cascade.disarm();
            }
        }
    }

    /// Rule R2: end of turn. Launch the pipeline (or serve the cache).
    fn start_turn(&mut self) {
        let user_text = self.transcript.latest().trim().to_owned();

        // Turn boundary: the words just consumed belong to this turn and
        // the anchor restarts at zero for interruption detection.
        self.transcript.mark_boundary();
        self.cascade.disarm();
        self.anchor = self.transcript.word_count();
        self.flush_partial();

        self.turn_seq += 1;
        let turn = self.turn_seq;
        self.current = Some(ConversationTurn::begin(
            &self.session_id,
            turn,
            user_text.clone(),
        ));
        self.last_reply = None;
        self.in_response_pipeline = true;

        self.emit(SessionOutput::UserMessage {
            text: user_text.clone(),
            timestamp: Utc::now(),
        });

        // R5: a fresh, unexpired interrupted reply beats fresh generation.
        let cached = self.cache.take().filter(|reply| !reply.trim().is_empty());
        self.cached_turn = None;

        if let Some(reply) = cached {
            info!(turn, "serving cached reply");
            if let Some(record) = self.current.as_mut() {
                record.served_from_cache = true;
                record.agent_text = reply.clone();
            }
            self.emit(SessionOutput::AiResponse {
                text: reply.clone(),
                timestamp: Utc::now(),
            });
            // Listening -> Speaking directly, bypassing Generating.
            self.set_state(TurnState::Speaking);
            self.pipeline = Some(ResponsePipeline::launch_cached(
                turn,
                reply,
                self.deps.services.clone(),
                self.timing,
            ));
        } else {
            info!(turn, "launching response pipeline");
            self.set_state(TurnState::Generating);
            self.pipeline = Some(ResponsePipeline::launch(
                turn,
                self.history.clone(),
                user_text,
                self.deps.services.clone(),
                self.timing,
            ));
        }
    }

    // ── Pipeline signals ──────────────────────────────────────

    async fn on_pipeline(&mut self, signal: PipelineSignal) -> Flow {
        let turn = signal.turn();
        let current_turn = self.pipeline.as_ref().map(ResponsePipeline::turn);

        if current_turn != Some(turn) {
            // A signal from a cancelled pipeline. The only one that still
            // matters is a reply that completed just after an interrupt:
            // it refreshes the cache slot if the slot is still fresh.
            if let PipelineSignal::ReplyReady { text, .. } = signal
                && self.cached_turn == Some(turn)
            {
                let applied = self.cache.refresh_text(text);
                debug!(turn, applied, "late reply routed to response cache");
            } else {
                debug!(turn, "dropping signal from superseded pipeline");
            }
            return Flow::Continue;
        }

        match signal {
            PipelineSignal::ReplyReady { text, .. } => {
                if self.state != TurnState::Generating {
                    error!(state = ?self.state, "reply_ready outside Generating");
                    return Flow::Continue;
                }
                self.last_reply = Some(text.clone());
                if let Some(record) = self.current.as_mut() {
                    record.agent_text = text.clone();
                }
                self.emit(SessionOutput::AiResponse {
                    text,
                    timestamp: Utc::now(),
                });
                Flow::Continue
            }
            PipelineSignal::PlaybackBegin { .. } => {
                self.tts_playing = true;
                if self.state == TurnState::Generating {
                    self.set_state(TurnState::Speaking);
                }
                self.emit(SessionOutput::SpeechStarted);
                Flow::Continue
            }
            PipelineSignal::PlaybackEnd { reason, .. } => match reason {
                PlaybackEndReason::Completed => {
                    self.emit(SessionOutput::SpeechEnded {
                        reason: PlaybackEndReason::Completed,
                    });
                    self.finish_turn().await
                }
                PlaybackEndReason::StoppedByInterrupt => {
                    // Interrupts null the pipeline before this signal can
                    // arrive; reaching here means playback stopped under
                    // us. Escape to Listening rather than wedge.
                    warn!(turn, "playback stopped outside an interrupt");
                    self.emit(SessionOutput::SpeechEnded {
                        reason: PlaybackEndReason::StoppedByInterrupt,
                    });
                    self.finish_turn().await
                }
                PlaybackEndReason::Error => self.pipeline_failed("playback error".to_owned()).await,
            },
            PipelineSignal::Failed { message, .. } => self.pipeline_failed(message).await,
        }
    }

    /// Normal end of a spoken turn: persist, remember, reset recognition.
    async fn finish_turn(&mut self) -> Flow {
        let played = self.tts_playing;
        self.tts_playing = false;
        self.in_response_pipeline = false;
        self.pipeline = None;

        if let Some(mut record) = self.current.take() {
            record.finished_at = Utc::now();
            self.push_history(&record);
            if let Err(e) = self.deps.journal.record(&record) {
                error!("journal write failed: {e}");
            }
        }
        self.last_reply = None;

        self.set_state(TurnState::Listening);

        if played {
            self.post_playback_reset().await
        } else {
            Flow::Continue
        }
    }

    /// Post-TTS recognition reset.
    ///
    /// Even with echo cancellation, the engine's language model keeps the
    /// prior utterance as context and re-emits it as the prefix of the
    /// next result; without a forced restart, turns accumulate
    /// ("hello" -> "hello how are you"). State is cleared before the
    /// restart so nothing stale survives, and stale-epoch events are
    /// rejected until the fresh session is live.
    async fn post_playback_reset(&mut self) -> Flow {
        self.transcript.clear();
        self.cascade.disarm();
        self.pending_partial = None;
        self.debounce_deadline = None;

        match self.deps.recognition.restart().await {
            Ok(()) => Flow::Continue,
            Err(VoiceError::RecognitionAuth(message)) => {
                self.emit(SessionOutput::SessionError {
                    message,
                    fatal: true,
                });
                Flow::Stop
            }
            Err(other) => {
                warn!("post-turn recognition restart failed: {other}");
                self.note_transient().await
            }
        }
    }

    /// Pipeline error: the user message was already emitted, the turn is
    /// marked and closed, and the next utterance supersedes. No retry.
    async fn pipeline_failed(&mut self, message: String) -> Flow {
        warn!("pipeline error: {message}");
        let played = self.tts_playing;
        self.tts_playing = false;
        self.in_response_pipeline = false;
        self.pipeline = None;
        self.last_reply = None;

        if let Some(mut record) = self.current.take() {
            record.error = true;
            record.finished_at = Utc::now();
            if let Err(e) = self.deps.journal.record(&record) {
                error!("journal write failed: {e}");
            }
        }

        if played {
            self.emit(SessionOutput::SpeechEnded {
                reason: PlaybackEndReason::Error,
            });
        }
        self.set_state(TurnState::Listening);
        if played {
            self.post_playback_reset().await
        } else {
            Flow::Continue
        }
    }

    // ── Interruption (rules R3, R4, and the explicit command) ─

    /// Cancel the in-flight response and return to Listening.
    ///
    /// Cache-before-cancel: during generation the most recent reply text
    /// (possibly empty) is parked first, so a reply completing inside the
    /// cancel budget still has a stamped slot to land in. The controller
    /// never waits for upstream acknowledgment.
    fn interrupt(&mut self, source: InterruptSource) {
        let during = match (source, self.state) {
            (InterruptSource::Explicit, TurnState::Generating) => InterruptSource::Generation,
            (InterruptSource::Explicit, TurnState::Speaking) => InterruptSource::Playback,
            (other, _) => other,
        };

        match during {
            InterruptSource::Generation => {
                let turn = self.pipeline.as_ref().map(ResponsePipeline::turn);
                self.cache.set(self.last_reply.clone().unwrap_or_default());
                self.cached_turn = turn;
                if let Some(record) = self.current.as_mut() {
                    record.interrupted_during_generation = true;
                }
            }
            InterruptSource::Playback => {
                // The reply was already delivered; nothing to cache.
                self.deps.services.output.stop_playback();
                if let Some(record) = self.current.as_mut() {
                    record.interrupted_during_playback = true;
                }
                if self.tts_playing {
                    self.emit(SessionOutput::SpeechEnded {
                        reason: PlaybackEndReason::StoppedByInterrupt,
                    });
                }
            }
            InterruptSource::Explicit => {}
        }

        if let Some(pipeline) = self.pipeline.take() {
            pipeline.cancel();
        }

        if let Some(mut record) = self.current.take() {
            record.finished_at = Utc::now();
            if during == InterruptSource::Playback {
                self.push_history(&record);
            }
            if let Err(e) = self.deps.journal.record(&record) {
                error!("journal write failed: {e}");
            }
        }

        self.tts_playing = false;
        self.in_response_pipeline = false;
        self.last_reply = None;
        self.set_state(TurnState::Listening);

        // The interrupting words are the next turn's speech: re-arm
        // against them. An explicit cancel has no new words to arm on.
        if self.transcript.has_speech() {
            self.cascade.reset();
        } else {
            self.cascade.disarm();
        }
        self.anchor = 0;
    }

    // ── Recognition failures (§ error contract) ───────────────

    async fn on_recognition_failure(&mut self, message: String, fatal: bool) -> Flow {
        if fatal {
            error!("fatal recognition failure: {message}");
            self.emit(SessionOutput::SessionError {
                message,
                fatal: true,
            });
            return Flow::Stop;
        }
        warn!("transient recognition failure: {message}");
        self.note_transient().await
    }

    /// One restart is attempted per transient error; a second failure
    /// inside the retry window closes the session.
    async fn note_transient(&mut self) -> Flow {
        let window = Duration::from_millis(self.config.recognition.transient_retry_window_ms);
        let now = Instant::now();
        if let Some(previous) = self.last_transient
            && now.duration_since(previous) < window
        {
            self.emit(SessionOutput::SessionError {
                message: "speech recognition failed repeatedly".to_owned(),
                fatal: true,
            });
            return Flow::Stop;
        }
        self.last_transient = Some(now);

        match self.deps.recognition.restart().await {
            Ok(()) => Flow::Continue,
            Err(VoiceError::RecognitionAuth(message)) => {
                self.emit(SessionOutput::SessionError {
                    message,
                    fatal: true,
                });
                Flow::Stop
            }
            Err(e) => {
                error!("recognition restart failed: {e}");
                self.emit(SessionOutput::SessionError {
                    message: "speech recognition failed repeatedly".to_owned(),
                    fatal: true,
                });
                Flow::Stop
            }
        }
    }

    // ── Plumbing ──────────────────────────────────────────────

    fn push_history(&mut self, record: &ConversationTurn) {
        if record.agent_text.trim().is_empty() {
            return;
        }
        self.history.push(ChatTurn {
            user: record.user_text.clone(),
            assistant: record.agent_text.clone(),
        });
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_CAP;
            self.history.drain(..excess);
        }
    }

    fn flush_partial(&mut self) {
        self.debounce_deadline = None;
        if let Some((text, is_final)) = self.pending_partial.take()
            && !text.is_empty()
        {
            self.emit(SessionOutput::TranscriptionUpdate { text, is_final });
        }
    }

    fn set_state(&mut self, state: TurnState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state transition");
            self.state = state;
            self.emit(SessionOutput::StateChanged { state });
        }
    }

    fn emit(&self, output: SessionOutput) {
        if self.deps.outputs.send(output).is_err() {
            debug!("output channel closed");
        }
    }

    fn touch_idle(&mut self) {
        self.idle_deadline =
            Instant::now() + Duration::from_secs(self.config.turn.idle_timeout_secs);
    }

    async fn shutdown(&mut self) {
        info!(session = %self.session_id, "turn controller shutting down");
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.cancel();
        }
        self.deps.services.output.stop_playback();
        self.cascade.disarm();
        if let Some(mut record) = self.current.take() {
            record.finished_at = Utc::now();
            record.error = true;
            if let Err(e) = self.deps.journal.record(&record) {
                error!("journal write failed: {e}");
            }
        }
        self.deps.recognition.stop().await;
    }
}

/// Sleep until the deadline, or forever when there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
