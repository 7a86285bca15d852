//! WebSocket client for a streaming recognition service.
//!
//! Wire protocol: one JSON `start` message configures the session for
//! low-latency word-level partials, binary frames carry PCM16 audio,
//! and the service answers with JSON result events where `text` is the
//! full transcription since the session started.

use crate::asr::{EngineResult, EngineSession, EngineUpdate, RecognitionEngine, UPDATE_CHANNEL_SIZE};
use crate::error::{Result, VoiceError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Audio frame channel size toward the socket writer.
const AUDIO_CHANNEL_SIZE: usize = 64;

/// A recognition engine reached over WebSocket.
pub struct WsRecognitionEngine {
    url: String,
    sample_rate: u32,
}

impl WsRecognitionEngine {
    /// Create an engine client for the given service URL.
    pub fn new(url: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            url: url.into(),
            sample_rate,
        }
    }
}

/// Result events from the service.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServiceEvent {
    Result {
        text: String,
        #[serde(default, rename = "final")]
        is_final: bool,
    },
    Error {
        message: String,
        #[serde(default)]
        fatal: bool,
    },
}

#[async_trait]
impl RecognitionEngine for WsRecognitionEngine {
    async fn open(&self, locale: &str) -> Result<EngineSession> {
        let url = url::Url::parse(&self.url).map_err(|e| {
            VoiceError::RecognitionFatal(format!("invalid engine URL '{}': {e}", self.url))
        })?;
        let (stream, _) = connect_async(url.as_str()).await.map_err(|e| match &e {
            tungstenite::Error::Http(response)
                if response.status() == 401 || response.status() == 403 =>
            {
                VoiceError::RecognitionAuth(format!("engine rejected connection: {e}"))
            }
            _ => VoiceError::RecognitionTransient(format!("engine connect failed: {e}")),
        })?;
        let (mut sink, mut source) = stream.split();

        // Configure for volatile word-level partials. Sentence-batched
        // delivery (3-4 s cadence) breaks the silence window entirely.
        let start = serde_json::json!({
            "type": "start",
            "locale": locale,
            "sample_rate": self.sample_rate,
            "partial_results": true,
            "latency": "low",
        });
        sink.send(Message::Text(start.to_string().into()))
            .await
            .map_err(|e| {
                VoiceError::RecognitionTransient(format!("engine start message failed: {e}"))
            })?;
        info!(locale, "recognition engine session opened");

        let cancel = CancellationToken::new();
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<f32>>(AUDIO_CHANNEL_SIZE);
        let (updates_tx, updates_rx) = mpsc::channel::<EngineUpdate>(UPDATE_CHANNEL_SIZE);

        // Writer: audio frames out, then a clean close on cancel.
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_cancel.cancelled() => {
                        let stop = serde_json::json!({"type": "stop"});
                        let _ = sink.send(Message::Text(stop.to_string().into())).await;
                        let _ = sink.close().await;
                        break;
                    }
                    frame = audio_rx.recv() => {
                        let Some(samples) = frame else { break };
                        let pcm = encode_pcm16(&samples);
                        if sink.send(Message::Binary(pcm.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Reader: result events in.
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    message = source.next() => message,
                };
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServiceEvent>(&text) {
                            Ok(ServiceEvent::Result { text, is_final }) => {
                                if updates_tx
                                    .send(EngineUpdate::Result(EngineResult { text, is_final }))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Ok(ServiceEvent::Error { message, fatal }) => {
                                let update = if fatal {
                                    EngineUpdate::Fatal(message)
                                } else {
                                    EngineUpdate::Transient(message)
                                };
                                if updates_tx.send(update).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!("ignoring unparseable engine message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        if !reader_cancel.is_cancelled() {
                            warn!("recognition engine closed the connection");
                            let _ = updates_tx
                                .send(EngineUpdate::Transient("connection closed".to_owned()))
                                .await;
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = updates_tx.send(EngineUpdate::Transient(e.to_string())).await;
                        break;
                    }
                }
            }
        });

        Ok(EngineSession {
            audio_tx,
            updates_rx,
            cancel,
        })
    }
}

/// Convert f32 samples to signed 16-bit little-endian PCM.
fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = (s.clamp(-1.0, 1.0) * 32_767.0) as i16;
        out.extend_from_slice(&clamped.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn pcm16_encoding_is_little_endian_and_clamped() {
        let encoded = encode_pcm16(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(encoded.len(), 8);
        assert_eq!(&encoded[0..2], &[0x00, 0x00]);
        assert_eq!(&encoded[2..4], &32_767i16.to_le_bytes());
        assert_eq!(&encoded[4..6], &(-32_767i16).to_le_bytes());
        // Over-range input clamps instead of wrapping.
        assert_eq!(&encoded[6..8], &32_767i16.to_le_bytes());
    }

    #[test]
    fn service_result_events_parse() {
        let parsed: ServiceEvent =
            serde_json::from_str(r#"{"type":"result","text":"hello there","final":false}"#)
                .unwrap();
        match parsed {
            ServiceEvent::Result { text, is_final } => {
                assert_eq!(text, "hello there");
                assert!(!is_final);
            }
            ServiceEvent::Error { .. } => panic!("wrong variant"),
        }
    }

    #[test]
    fn service_error_events_default_to_transient() {
        let parsed: ServiceEvent =
            serde_json::from_str(r#"{"type":"error","message":"hiccup"}"#).unwrap();
        match parsed {
            ServiceEvent::Error { message, fatal } => {
                assert_eq!(message, "hiccup");
                assert!(!fatal);
            }
            ServiceEvent::Result { .. } => panic!("wrong variant"),
        }
    }
}
