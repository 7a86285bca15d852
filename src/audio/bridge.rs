//! Full-duplex audio bridge over cpal.
//!
//! One bridge per session: microphone capture (or remote PCM ingest)
//! on one side, TTS playback on the other, with the echo canceller
//! sitting between them so playback never reaches the recognition tap.

use crate::audio::aec::{EchoCanceller, EchoReference};
use crate::audio::{AudioOutput, CaptureTap, frame_rms};
use crate::config::{AecConfig, AudioConfig};
use crate::error::{Result, VoiceError};
use crate::messages::{CaptureFrame, PlaybackEndReason, SynthesizedAudio};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Internal channel size between the capture callback and the processor.
const CAPTURE_CHANNEL_SIZE: usize = 64;

/// Full-duplex audio bridge with echo cancellation.
pub struct AudioBridge {
    audio_config: AudioConfig,
    aec_config: AecConfig,
    /// Where processed capture frames are routed, when a tap is attached.
    tap: Arc<Mutex<Option<mpsc::Sender<CaptureFrame>>>>,
    /// Raw frames from the capture callback or remote ingest.
    raw_tx: mpsc::Sender<CaptureFrame>,
    raw_rx: Mutex<Option<mpsc::Receiver<CaptureFrame>>>,
    /// Speaker audio reference for the echo canceller.
    reference: EchoReference,
    /// Stop flag of the in-flight playback, if any.
    playing: Arc<Mutex<Option<Arc<AtomicBool>>>>,
    /// Cancels the capture and processing tasks.
    running: Mutex<Option<CancellationToken>>,
}

impl AudioBridge {
    /// Create a stopped bridge.
    pub fn new(audio_config: AudioConfig, aec_config: AecConfig) -> Self {
        let (raw_tx, raw_rx) = mpsc::channel(CAPTURE_CHANNEL_SIZE);
        let reference = EchoReference::new(
            audio_config.output_sample_rate,
            audio_config.input_sample_rate,
        );
        Self {
            audio_config,
            aec_config,
            tap: Arc::new(Mutex::new(None)),
            raw_tx,
            raw_rx: Mutex::new(Some(raw_rx)),
            reference,
            playing: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    /// Start the audio graph: local microphone capture plus the
    /// processing task that applies AEC and feeds the tap.
    ///
    /// Idempotent: a second call while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available.
    pub fn start(&self) -> Result<()> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| VoiceError::AudioDevice("bridge state lock poisoned".into()))?;
        if running.is_some() {
            debug!("audio bridge already started");
            return Ok(());
        }

        // Fail session start here, not inside the capture task, when no
        // usable input device exists.
        let host = cpal::default_host();
        if host.default_input_device().is_none() {
            return Err(VoiceError::AudioDevice("no default input device".into()));
        }

        let cancel = CancellationToken::new();
        self.spawn_processor(cancel.clone())?;

        let config = self.audio_config.clone();
        let raw_tx = self.raw_tx.clone();
        let capture_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_capture(config, raw_tx, capture_cancel).await {
                error!("capture failed: {e}");
            }
        });

        *running = Some(cancel);
        Ok(())
    }

    /// Start only the processing task, for sessions where the client
    /// streams capture over the wire instead of a local microphone.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge was already consumed.
    pub fn start_remote(&self) -> Result<()> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| VoiceError::AudioDevice("bridge state lock poisoned".into()))?;
        if running.is_some() {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        self.spawn_processor(cancel.clone())?;
        *running = Some(cancel);
        Ok(())
    }

    /// Tear down the audio graph and detach the tap. Idempotent.
    pub fn stop(&self) {
        if let Ok(mut running) = self.running.lock()
            && let Some(cancel) = running.take()
        {
            cancel.cancel();
        }
        self.detach();
        self.stop_playback();
    }

    /// Feed remotely captured audio: signed 16-bit LE PCM, 16 kHz mono.
    ///
    /// Frames are converted to f32 and join the same processing path as
    /// local capture.
    pub fn ingest_pcm16(&self, bytes: &[u8]) {
        if bytes.len() < 2 {
            return;
        }
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32_768.0)
            .collect();
        let rms = frame_rms(&samples);
        let frame = CaptureFrame {
            samples,
            sample_rate: 16_000,
            rms,
            captured_at: Instant::now(),
        };
        if self.raw_tx.try_send(frame).is_err() {
            debug!("remote capture frame dropped (channel full or bridge stopped)");
        }
    }

    /// Spawn the task that applies AEC and routes frames to the tap.
    fn spawn_processor(&self, cancel: CancellationToken) -> Result<()> {
        let mut raw_rx = self
            .raw_rx
            .lock()
            .map_err(|_| VoiceError::AudioDevice("bridge state lock poisoned".into()))?
            .take()
            .ok_or_else(|| VoiceError::AudioDevice("bridge capture path already consumed".into()))?;

        let mut canceller = if self.aec_config.enabled {
            Some(EchoCanceller::new(&self.aec_config, self.reference.clone())?)
        } else {
            warn!("AEC disabled: barge-in may false-trigger on the orchestrator's own voice");
            None
        };
        let tap = Arc::clone(&self.tap);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    frame = raw_rx.recv() => {
                        let Some(mut frame) = frame else { break };
                        if let Some(canceller) = canceller.as_mut() {
                            canceller.process(&mut frame);
                        }
                        let sender = match tap.lock() {
                            Ok(guard) => guard.clone(),
                            Err(_) => None,
                        };
                        if let Some(sender) = sender
                            && sender.try_send(frame).is_err()
                        {
                            debug!("capture tap full or closed, frame dropped");
                        }
                    }
                }
            }
            debug!("audio processing task stopped");
        });
        Ok(())
    }
}

impl CaptureTap for AudioBridge {
    fn attach(&self, tx: mpsc::Sender<CaptureFrame>) {
        if let Ok(mut tap) = self.tap.lock() {
            *tap = Some(tx);
        }
    }

    fn detach(&self) {
        if let Ok(mut tap) = self.tap.lock() {
            *tap = None;
        }
    }
}

#[async_trait]
impl AudioOutput for AudioBridge {
    async fn play(&self, audio: SynthesizedAudio) -> Result<PlaybackEndReason> {
        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut playing = self
                .playing
                .lock()
                .map_err(|_| VoiceError::AudioDevice("playback lock poisoned".into()))?;
            // A prior playback still registered here is stopped first.
            if let Some(previous) = playing.replace(Arc::clone(&stop)) {
                previous.store(true, Ordering::Relaxed);
            }
        }

        let (done_tx, done_rx) = oneshot::channel();
        let config = self.audio_config.clone();
        let reference = self.reference.clone();
        let stop_flag = Arc::clone(&stop);

        // cpal streams stay on their creation thread; the blocking task
        // owns the stream for the whole playback.
        tokio::task::spawn_blocking(move || {
            let result = run_playback(&config, &reference, audio, &stop_flag);
            let _ = done_tx.send(result);
        });

        let result = done_rx
            .await
            .map_err(|_| VoiceError::AudioDevice("playback task dropped".into()))?;

        if let Ok(mut playing) = self.playing.lock()
            && playing
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &stop))
        {
            *playing = None;
        }
        result
    }

    fn stop_playback(&self) {
        if let Ok(playing) = self.playing.lock()
            && let Some(stop) = playing.as_ref()
        {
            stop.store(true, Ordering::Relaxed);
        }
        // Echoes of the truncated audio are no longer expected at the mic.
        self.reference.reset();
    }
}

/// Capture loop: owns the cpal input stream until cancelled.
async fn run_capture(
    config: AudioConfig,
    tx: mpsc::Sender<CaptureFrame>,
    cancel: CancellationToken,
) -> Result<()> {
    let host = cpal::default_host();
    let device = if let Some(ref name) = config.input_device {
        host.input_devices()
            .map_err(|e| VoiceError::AudioDevice(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VoiceError::AudioDevice(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("no default input device".into()))?
    };

    let default_config = device
        .default_input_config()
        .map_err(|e| VoiceError::AudioDevice(format!("no default input config: {e}")))?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let target_rate = config.input_sample_rate;
    let frame_len = config.frame_size.max(1) as usize;
    let mut pending: VecDeque<f32> = VecDeque::with_capacity(frame_len * 4);

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };
                let samples = if native_rate != target_rate {
                    resample_rates(&mono, native_rate, target_rate)
                } else {
                    mono
                };
                pending.extend(samples);

                while pending.len() >= frame_len {
                    let frame: Vec<f32> = pending.drain(..frame_len).collect();
                    let rms = frame_rms(&frame);
                    let frame = CaptureFrame {
                        samples: frame,
                        sample_rate: target_rate,
                        rms,
                        captured_at: Instant::now(),
                    };
                    // try_send keeps the audio thread non-blocking.
                    let _ = tx.try_send(frame);
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::AudioDevice(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| VoiceError::AudioDevice(format!("failed to start input stream: {e}")))?;

    info!(
        "capture started: native {}Hz -> {}Hz, frame {} samples",
        native_rate, target_rate, frame_len
    );
    cancel.cancelled().await;
    drop(stream);
    info!("capture stopped");
    Ok(())
}

/// Blocking playback of one buffer; returns how it ended.
fn run_playback(
    config: &AudioConfig,
    reference: &EchoReference,
    audio: SynthesizedAudio,
    stop: &AtomicBool,
) -> Result<PlaybackEndReason> {
    let host = cpal::default_host();
    let device = if let Some(ref name) = config.output_device {
        host.output_devices()
            .map_err(|e| VoiceError::AudioDevice(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VoiceError::AudioDevice(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| VoiceError::AudioDevice("no default output device".into()))?
    };

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: config.output_sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let samples = if audio.sample_rate == config.output_sample_rate {
        audio.samples
    } else {
        resample_rates(&audio.samples, audio.sample_rate, config.output_sample_rate)
    };

    let total = samples.len();
    let shared = Arc::new(Mutex::new((samples, 0usize)));
    let callback_state = Arc::clone(&shared);
    let callback_reference = reference.clone();
    let finished = Arc::new(AtomicBool::new(false));
    let callback_finished = Arc::clone(&finished);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let Ok(mut state) = callback_state.lock() else {
                    return;
                };
                let (samples, position) = &mut *state;
                let start = *position;
                for sample in data.iter_mut() {
                    if *position < samples.len() {
                        *sample = samples[*position];
                        *position += 1;
                    } else {
                        *sample = 0.0;
                        callback_finished.store(true, Ordering::Relaxed);
                    }
                }
                // What just went to the speaker becomes the echo reference.
                callback_reference.feed(&samples[start..*position]);
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::AudioDevice(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| VoiceError::AudioDevice(format!("failed to start output stream: {e}")))?;
    debug!("playback started ({total} samples)");

    loop {
        std::thread::sleep(Duration::from_millis(10));
        if stop.load(Ordering::Relaxed) {
            drop(stream);
            return Ok(PlaybackEndReason::StoppedByInterrupt);
        }
        if finished.load(Ordering::Relaxed) {
            drop(stream);
            return Ok(PlaybackEndReason::Completed);
        }
    }
}

/// Average interleaved channels down to mono.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation rate conversion for speech-band audio.
fn resample_rates(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let s = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        out.push(s as f32);
    }
    out
}
