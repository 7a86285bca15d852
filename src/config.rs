//! Configuration types for the voice-turn orchestrator.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Acoustic echo cancellation settings.
    pub aec: AecConfig,
    /// Streaming recognition settings.
    pub recognition: RecognitionConfig,
    /// Turn-taking (silence cascade, interruption) settings.
    pub turn: TurnConfig,
    /// Response cache settings.
    pub cache: CacheConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// HTTP/WebSocket server settings.
    pub server: ServerConfig,
    /// Conversation journal settings.
    pub journal: JournalConfig,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VoiceError::Config(format!("failed to read config {}: {e}", path.display()))
        })?;
        toml::from_str(&raw).map_err(|e| {
            VoiceError::Config(format!("invalid config {}: {e}", path.display()))
        })
    }

    /// Write configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| VoiceError::Config(format!("config serialization failed: {e}")))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Default config file path (`<config_dir>/aria/config.toml`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aria")
            .join("config.toml")
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz (the rate the rest of the pipeline sees).
    pub input_sample_rate: u32,
    /// Playback sample rate in Hz.
    pub output_sample_rate: u32,
    /// Capture frame size in samples at the input rate.
    pub frame_size: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_size: 512,
            input_device: None,
            output_device: None,
        }
    }
}

/// Acoustic echo cancellation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AecConfig {
    /// Whether echo cancellation is enabled.
    ///
    /// Turn-taking assumes recognition events during TTS playback are real
    /// user speech. With AEC off that assumption fails and barge-in
    /// false-triggers on the orchestrator's own voice.
    pub enabled: bool,
    /// FFT size for the FDAF adaptive filter (must be a power of two).
    pub fft_size: usize,
    /// NLMS learning rate for the adaptive filter.
    pub step_size: f32,
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fft_size: 1024,
            step_size: 0.05,
        }
    }
}

/// Streaming recognition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// WebSocket URL of the streaming recognition engine.
    pub engine_url: String,
    /// Recognition locale, e.g. `en-US`.
    pub locale: String,
    /// Delay between tap detach and re-attach on restart, in ms.
    ///
    /// Frames buffered against the old engine session would otherwise
    /// leak into the new one.
    pub restart_flush_ms: u64,
    /// Window after a transient-error restart within which a second
    /// failure is treated as fatal, in ms.
    pub transient_retry_window_ms: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            engine_url: "ws://127.0.0.1:2700/recognize".to_owned(),
            locale: "en-US".to_owned(),
            restart_flush_ms: 50,
            transient_retry_window_ms: 2_000,
        }
    }
}

/// Turn-taking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Silence before end-of-turn fires, in ms (cascade stage 1).
    ///
    /// Engines with a slow result cadence (>500 ms between partials) need
    /// this raised to 800–1000 ms or every inter-word gap ends the turn.
    pub llm_delay_ms: u64,
    /// Cascade stage 2 (speculative TTS hook), in ms.
    pub tts_delay_ms: u64,
    /// Cascade stage 3 (upper bound), in ms.
    pub play_delay_ms: u64,
    /// Words beyond the anchor count that qualify as an interruption.
    ///
    /// A single extra word is noise or feedback residue, not intent.
    pub interrupt_word_delta: usize,
    /// Upper bound on waiting for the pipeline's playback-ready signal, in ms.
    pub play_ready_timeout_ms: u64,
    /// Poll interval inside the play-readiness gate, in ms.
    pub play_ready_poll_ms: u64,
    /// Budget for the pipeline to acknowledge a cancel, in ms.
    pub cancel_budget_ms: u64,
    /// Debounce window for forwarding partial transcriptions to the UI, in ms.
    pub debounce_ms: u64,
    /// Session idle timeout (no recognition events), in seconds.
    pub idle_timeout_secs: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            llm_delay_ms: 500,
            tts_delay_ms: 1_500,
            play_delay_ms: 2_000,
            interrupt_word_delta: 2,
            play_ready_timeout_ms: 5_000,
            play_ready_poll_ms: 100,
            cancel_budget_ms: 200,
            debounce_ms: 150,
            idle_timeout_secs: 180,
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long an interrupted reply stays servable, in ms.
    ///
    /// Long enough for the user to finish their interruption (empirically
    /// 2–4 s), short enough that the reply's context has not drifted.
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_ms: 5_000 }
    }
}

/// Language model configuration (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider base URL.
    pub api_url: String,
    /// Model identifier.
    pub api_model: String,
    /// API key (empty = no Authorization header).
    pub api_key: String,
    /// System prompt prepended to every conversation.
    pub system_prompt: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Nucleus sampling parameter.
    pub top_p: f32,
    /// Maximum tokens per reply.
    pub max_tokens: u32,
    /// Conversation turns kept in the rolling history.
    pub max_history_turns: usize,
    /// Whole-request timeout, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:11434".to_owned(),
            api_model: "llama3.2".to_owned(),
            api_key: String::new(),
            system_prompt: "You are a friendly voice companion. Reply in one or two \
                            short conversational sentences suitable for speech."
                .to_owned(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 256,
            max_history_turns: 16,
            request_timeout_secs: 30,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// TTS service base URL.
    pub api_url: String,
    /// Voice identifier.
    pub voice: String,
    /// Speaking rate multiplier.
    pub speed: f32,
    /// Whole-request timeout, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8880".to_owned(),
            voice: "af_heart".to_owned(),
            speed: 1.0,
            request_timeout_secs: 30,
        }
    }
}

/// HTTP/WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// HTTP port (health endpoint).
    pub http_port: u16,
    /// WebSocket port for session sockets.
    ///
    /// Both routes share one listener when the ports are equal, which is
    /// the default.
    pub ws_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            http_port: 8760,
            ws_port: 8760,
        }
    }
}

/// Conversation journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Whether turns are persisted at all (`--skip-journal` clears this).
    pub enabled: bool,
    /// Journal root directory (None = `<data_dir>/aria/conversations`).
    pub root_dir: Option<PathBuf>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_dir: None,
        }
    }
}

impl JournalConfig {
    /// Resolve the journal root, falling back to the platform data dir.
    #[must_use]
    pub fn resolved_root(&self) -> PathBuf {
        self.root_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("aria")
                .join("conversations")
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn defaults_match_turn_taking_constants() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.turn.llm_delay_ms, 500);
        assert_eq!(config.turn.tts_delay_ms, 1_500);
        assert_eq!(config.turn.play_delay_ms, 2_000);
        assert_eq!(config.turn.interrupt_word_delta, 2);
        assert_eq!(config.cache.ttl_ms, 5_000);
        assert_eq!(config.turn.idle_timeout_secs, 180);
        assert_eq!(config.recognition.restart_flush_ms, 50);
    }

    #[test]
    fn roundtrips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = OrchestratorConfig::default();
        config.turn.llm_delay_ms = 800;
        config.llm.api_model = "test-model".to_owned();
        config.save(&path).unwrap();

        let loaded = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(loaded.turn.llm_delay_ms, 800);
        assert_eq!(loaded.llm.api_model, "test-model");
        assert_eq!(loaded.audio.input_sample_rate, 16_000);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: OrchestratorConfig = toml::from_str(
            r#"
[turn]
llm_delay_ms = 1000
"#,
        )
        .unwrap();
        assert_eq!(parsed.turn.llm_delay_ms, 1_000);
        assert_eq!(parsed.turn.tts_delay_ms, 1_500);
        assert!(parsed.aec.enabled);
    }
}
