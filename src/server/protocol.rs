//! Wire envelopes for the client WebSocket channel.

use crate::messages::{PlaybackEndReason, SessionOutput, TurnState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Messages from the client into the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open the session.
    StartSession {
        /// Whether the client streams its own microphone capture via
        /// `audio_frame`; otherwise the core owns the microphone.
        #[serde(default)]
        remote_audio: bool,
    },
    /// Close the session.
    StopSession,
    /// Explicit interrupt (a "stop" button in the UI).
    CancelCurrentResponse,
    /// Raw capture from the client: base64 of PCM16 LE, 16 kHz mono.
    AudioFrame {
        pcm: String,
        #[serde(default = "default_audio_format")]
        format: String,
    },
}

fn default_audio_format() -> String {
    "pcm16".to_owned()
}

/// Messages from the core to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConversationCreated {
        session_id: String,
    },
    StateChanged {
        state: &'static str,
    },
    TranscriptionUpdate {
        text: String,
        is_final: bool,
    },
    UserMessage {
        text: String,
        timestamp: DateTime<Utc>,
    },
    AiResponse {
        text: String,
        timestamp: DateTime<Utc>,
    },
    SpeechStarted,
    SpeechEnded {
        reason: &'static str,
    },
    SessionError {
        message: String,
        fatal: bool,
    },
}

fn reason_str(reason: PlaybackEndReason) -> &'static str {
    match reason {
        PlaybackEndReason::Completed => "completed",
        PlaybackEndReason::StoppedByInterrupt => "stopped_by_interrupt",
        PlaybackEndReason::Error => "error",
    }
}

impl From<SessionOutput> for ServerMessage {
    fn from(output: SessionOutput) -> Self {
        match output {
            SessionOutput::ConversationCreated { session_id } => {
                Self::ConversationCreated { session_id }
            }
            SessionOutput::StateChanged { state } => Self::StateChanged {
                state: TurnState::as_str(state),
            },
            SessionOutput::TranscriptionUpdate { text, is_final } => {
                Self::TranscriptionUpdate { text, is_final }
            }
            SessionOutput::UserMessage { text, timestamp } => Self::UserMessage { text, timestamp },
            SessionOutput::AiResponse { text, timestamp } => Self::AiResponse { text, timestamp },
            SessionOutput::SpeechStarted => Self::SpeechStarted,
            SessionOutput::SpeechEnded { reason } => Self::SpeechEnded {
                reason: reason_str(reason),
            },
            SessionOutput::SessionError { message, fatal } => Self::SessionError { message, fatal },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn client_messages_parse_from_tagged_json() {
        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"start_session","remote_audio":true}"#).unwrap();
        assert!(matches!(
            parsed,
            ClientMessage::StartSession { remote_audio: true }
        ));

        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"cancel_current_response"}"#).unwrap();
        assert!(matches!(parsed, ClientMessage::CancelCurrentResponse));

        let parsed: ClientMessage =
            serde_json::from_str(r#"{"type":"audio_frame","pcm":"AAA="}"#).unwrap();
        match parsed {
            ClientMessage::AudioFrame { pcm, format } => {
                assert_eq!(pcm, "AAA=");
                assert_eq!(format, "pcm16");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn server_messages_serialize_with_snake_case_tags() {
        let json = serde_json::to_value(ServerMessage::StateChanged { state: "listening" }).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["state"], "listening");

        let json = serde_json::to_value(ServerMessage::SpeechEnded {
            reason: "completed",
        })
        .unwrap();
        assert_eq!(json["type"], "speech_ended");
    }

    #[test]
    fn session_outputs_map_onto_wire_messages() {
        let wire: ServerMessage = SessionOutput::SpeechEnded {
            reason: PlaybackEndReason::StoppedByInterrupt,
        }
        .into();
        match wire {
            ServerMessage::SpeechEnded { reason } => assert_eq!(reason, "stopped_by_interrupt"),
            other => panic!("unexpected message: {other:?}"),
        }

        let wire: ServerMessage = SessionOutput::StateChanged {
            state: TurnState::Generating,
        }
        .into();
        match wire {
            ServerMessage::StateChanged { state } => assert_eq!(state, "generating"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
