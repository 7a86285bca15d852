//! Message types passed between orchestrator components.
//!
//! Everything that crosses a component boundary — capture frames,
//! recognition results, pipeline signals, timer fires — is defined here
//! so the turn controller can drain a single typed inbox.

use chrono::{DateTime, Utc};
use std::time::Instant;

/// A chunk of raw audio from the capture path.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// Mono f32 samples at the bridge's capture rate.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// RMS energy of the frame. Diagnostic only; never used for turn-taking.
    pub rms: f32,
    /// Timestamp when this frame was captured.
    pub captured_at: Instant,
}

/// A progressive result from the recognition engine.
///
/// `text` is the full transcription since the engine session started,
/// not a delta; engines re-emit the same word prefix repeatedly.
#[derive(Debug, Clone)]
pub struct RecognitionEvent {
    /// Full transcription since the engine session started.
    pub text: String,
    /// Whether the engine considers this segment final.
    pub is_final: bool,
    /// Recognition session epoch this result belongs to.
    ///
    /// Results from an epoch older than the adapter's current one are
    /// dropped; after `restart()` no pre-restart text can reach the
    /// controller.
    pub epoch: u64,
    /// When the adapter received this result.
    pub received_at: Instant,
}

/// Synthesized audio from TTS, ready for playback.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// Mono f32 samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/// Why a playback attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEndReason {
    /// All samples were emitted.
    Completed,
    /// Playback was halted by a user interruption.
    StoppedByInterrupt,
    /// The output stream failed.
    Error,
}

/// Signals from the response pipeline back to the controller inbox.
///
/// Each signal carries the turn number the pipeline was launched for,
/// so signals from an already-cancelled pipeline are recognizably stale.
#[derive(Debug, Clone)]
pub enum PipelineSignal {
    /// Reply text is known; it may be logged and, on interruption, cached.
    ReplyReady { turn: u64, text: String },
    /// Audio actually started emitting through the bridge.
    PlaybackBegin { turn: u64 },
    /// Playback finished or was stopped.
    PlaybackEnd {
        turn: u64,
        reason: PlaybackEndReason,
    },
    /// The pipeline failed before playback completed.
    Failed { turn: u64, message: String },
}

impl PipelineSignal {
    /// The turn this signal belongs to.
    pub fn turn(&self) -> u64 {
        match self {
            Self::ReplyReady { turn, .. }
            | Self::PlaybackBegin { turn }
            | Self::PlaybackEnd { turn, .. }
            | Self::Failed { turn, .. } => *turn,
        }
    }
}

/// The three silence-timer stages of the cascade.
///
/// All are measured from the same anchor (the most recent recognition
/// event). Only `Llm` triggers a hard action; `Tts` and `Play` are
/// hooks kept for the cascade's upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStage {
    /// End-of-turn: launch the response pipeline.
    Llm,
    /// Speculative TTS pre-generation hook.
    Tts,
    /// Cascade upper bound.
    Play,
}

/// A cascade stage fired.
#[derive(Debug, Clone, Copy)]
pub struct TimerFire {
    /// Cascade generation the fire belongs to; stale generations are ignored.
    pub generation: u64,
    /// Which stage fired.
    pub stage: CascadeStage,
}

/// Commands from the client or UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Explicit interrupt (a "stop" button): cancel the current response.
    CancelResponse,
    /// Close the session.
    Stop,
}

/// Everything the turn controller's single-writer inbox can receive.
#[derive(Debug)]
pub enum SessionEvent {
    /// A progressive recognition result.
    Recognition(RecognitionEvent),
    /// The recognition adapter reported an error.
    RecognitionFailure { message: String, fatal: bool },
    /// A response-pipeline signal.
    Pipeline(PipelineSignal),
    /// A cascade stage fired.
    Timer(TimerFire),
    /// A client command.
    Command(SessionCommand),
}

/// Turn controller state for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    /// The user may speak; the cascade may or may not be armed.
    #[default]
    Listening,
    /// The pipeline is running LLM (possibly already TTS); no audio yet.
    Generating,
    /// TTS playback is being emitted through the bridge.
    Speaking,
}

impl TurnState {
    /// Wire name used in `state_changed` messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Listening => "listening",
            Self::Generating => "generating",
            Self::Speaking => "speaking",
        }
    }
}

/// Outbound session events, mirrored onto the UI channel by the server.
#[derive(Debug, Clone)]
pub enum SessionOutput {
    /// The session is live and ready for speech.
    ConversationCreated { session_id: String },
    /// The controller changed state.
    StateChanged { state: TurnState },
    /// Debounced mirror of recognition results for display.
    TranscriptionUpdate { text: String, is_final: bool },
    /// Emitted exactly once per turn, with the text used to launch the pipeline.
    UserMessage {
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// The pipeline produced its reply text.
    AiResponse {
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Playback began.
    SpeechStarted,
    /// Playback ended.
    SpeechEnded { reason: PlaybackEndReason },
    /// A fatal error; the session closes after this message.
    SessionError { message: String, fatal: bool },
}
