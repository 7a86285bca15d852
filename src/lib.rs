//! Aria: real-time voice-turn orchestrator for a conversational AI companion.
//!
//! Over one full-duplex audio session, a per-session state machine:
//! - consumes progressive speech-recognition results,
//! - detects end-of-turn with a cascade of silence timers,
//! - drives a cancelable LLM → TTS → playback pipeline,
//! - handles mid-pipeline interruption with a short-TTL reply cache,
//! - and coordinates echo cancellation so its own voice is never
//!   transcribed as user input.
//!
//! # Architecture
//!
//! Components talk through typed messages converging on one inbox per
//! session (single-writer state):
//! - **Audio bridge**: full-duplex capture/playback via `cpal`, FDAF AEC
//! - **Recognition adapter**: streaming ASR over WebSocket, epoch-tagged
//!   results, forced restarts between turns
//! - **Turn controller**: the Listening/Generating/Speaking state machine
//! - **Response pipeline**: LLM (SSE streaming) → TTS → playback
//! - **Response cache**: single-slot TTL hold for interrupted replies
//! - **Server**: axum WebSocket transport for the UI channel

pub mod asr;
pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod messages;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod tts;
pub mod turn;

pub use config::OrchestratorConfig;
pub use error::{Result, VoiceError};
pub use messages::TurnState;
pub use session::{Session, SessionRuntime};
pub use turn::TurnController;
