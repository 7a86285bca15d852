//! Error types for the voice-turn orchestrator.

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone/speaker unavailable or permission denied. Fatal for the session.
    #[error("audio device error: {0}")]
    AudioDevice(String),

    /// Speech recognition permission denied. Fatal for the session.
    #[error("recognition authorization denied: {0}")]
    RecognitionAuth(String),

    /// Recognition dropout mid-session; the controller retries with a restart.
    #[error("recognition transient error: {0}")]
    RecognitionTransient(String),

    /// Recognition failed again within the retry window. Fatal for the session.
    #[error("recognition fatal error: {0}")]
    RecognitionFatal(String),

    /// Upstream LLM or TTS failure inside the response pipeline.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// The pipeline never reported playback start within the readiness window.
    #[error("playback did not begin within {0} ms")]
    PlaybackTimeout(u64),

    /// An event arrived in a state where it is impossible. Logged and dropped.
    #[error("state error: {0}")]
    State(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Conversation journal error.
    #[error("journal error: {0}")]
    Journal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
