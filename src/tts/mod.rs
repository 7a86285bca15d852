//! Text-to-speech client.
//!
//! Speaks the common `/v1/audio/speech` HTTP shape: POST text, receive a
//! WAV body. Decoding happens here so the rest of the crate only ever
//! sees mono f32 buffers.

use crate::config::TtsConfig;
use crate::error::{Result, VoiceError};
use crate::messages::SynthesizedAudio;
use async_trait::async_trait;
use std::io::Cursor;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// An audio-producing speech synthesizer.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize speech for the given text.
    ///
    /// Implementations must observe `cancel`: a pending request is
    /// aborted when the token fires.
    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<SynthesizedAudio>;
}

/// TTS backend speaking the `/v1/audio/speech` protocol.
pub struct HttpTts {
    config: TtsConfig,
    client: reqwest::Client,
}

impl HttpTts {
    /// Create a client from config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| VoiceError::Pipeline(format!("TTS client init failed: {e}")))?;
        info!("TTS configured: {} voice={}", config.api_url, config.voice);
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn speech_url(&self) -> String {
        let base = self
            .config
            .api_url
            .strip_suffix("/v1")
            .unwrap_or(&self.config.api_url)
            .trim_end_matches('/');
        format!("{base}/v1/audio/speech")
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpTts {
    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<SynthesizedAudio> {
        let body = serde_json::json!({
            "input": text,
            "voice": self.config.voice,
            "speed": self.config.speed,
            "response_format": "wav",
        });

        let request = self.client.post(self.speech_url()).json(&body).send();
        let response = tokio::select! {
            () = cancel.cancelled() => {
                return Err(VoiceError::Pipeline("TTS request cancelled".to_owned()));
            }
            response = request => response
                .map_err(|e| VoiceError::Pipeline(format!("TTS request failed: {e}")))?,
        };

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(VoiceError::Pipeline(format!(
                "TTS returned {status}: {detail}"
            )));
        }

        let bytes = tokio::select! {
            () = cancel.cancelled() => {
                return Err(VoiceError::Pipeline("TTS download cancelled".to_owned()));
            }
            bytes = response.bytes() => bytes
                .map_err(|e| VoiceError::Pipeline(format!("TTS body error: {e}")))?,
        };

        let audio = decode_wav(&bytes)?;
        debug!(
            "TTS synthesized {:.2}s of audio",
            audio.samples.len() as f32 / audio.sample_rate as f32
        );
        Ok(audio)
    }
}

/// Decode a WAV body into mono f32 samples.
///
/// Multi-channel audio is averaged down; 16-bit and float formats are
/// accepted.
pub fn decode_wav(bytes: &[u8]) -> Result<SynthesizedAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| VoiceError::Pipeline(format!("TTS returned invalid WAV: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| VoiceError::Pipeline(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = f32::from(i16::MAX);
            reader
                .into_samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| VoiceError::Pipeline(format!("WAV decode error: {e}")))?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    if samples.is_empty() {
        return Err(VoiceError::Pipeline("TTS returned empty audio".to_owned()));
    }

    Ok(SynthesizedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn wav_bytes(spec: hound::WavSpec, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn mono_i16_wav_decodes() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 24_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, &[0, i16::MAX, i16::MIN + 1]);

        let audio = decode_wav(&bytes).unwrap();
        assert_eq!(audio.sample_rate, 24_000);
        assert_eq!(audio.samples.len(), 3);
        assert!((audio.samples[1] - 1.0).abs() < 1e-4);
        assert!((audio.samples[2] + 1.0).abs() < 1e-4);
    }

    #[test]
    fn stereo_wav_is_averaged_to_mono() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 24_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, &[16_384, -16_384, 8_192, 8_192]);

        let audio = decode_wav(&bytes).unwrap();
        assert_eq!(audio.samples.len(), 2);
        assert!(audio.samples[0].abs() < 1e-4);
        assert!((audio.samples[1] - 0.25).abs() < 1e-2);
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(decode_wav(b"not a wav").is_err());
    }

    #[test]
    fn empty_wav_is_rejected() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 24_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, &[]);
        assert!(decode_wav(&bytes).is_err());
    }

    #[test]
    fn speech_url_joins_cleanly() {
        let tts = HttpTts::new(&TtsConfig {
            api_url: "http://host:8880/v1".to_owned(),
            ..TtsConfig::default()
        })
        .unwrap();
        assert_eq!(tts.speech_url(), "http://host:8880/v1/audio/speech");
    }
}
