//! Acoustic echo cancellation for the full-duplex bridge.
//!
//! The turn controller assumes that recognition events arriving during
//! TTS playback are real user speech. That only holds if the bridge's
//! own output is removed from the capture path first; otherwise the
//! interruption logic triggers on the orchestrator's voice. An FDAF
//! adaptive filter subtracts the speaker signal (tracked via a shared
//! reference buffer fed by the playback callback) from each microphone
//! frame before it reaches the recognition tap.

use crate::config::AecConfig;
use crate::error::{Result, VoiceError};
use crate::messages::CaptureFrame;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// How much reference audio to retain, in seconds at the capture rate.
const REFERENCE_SECS: usize = 2;

/// Shared buffer of speaker audio, resampled to the capture rate.
///
/// The playback callback feeds emitted samples in; the capture path
/// drains frames of matching size. Cloning shares the same buffer.
#[derive(Clone)]
pub struct EchoReference {
    samples: Arc<Mutex<VecDeque<f32>>>,
    playback_rate: u32,
    capture_rate: u32,
}

impl EchoReference {
    /// Create a reference buffer bridging the playback and capture rates.
    pub fn new(playback_rate: u32, capture_rate: u32) -> Self {
        let capacity = capture_rate as usize * REFERENCE_SECS;
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            playback_rate,
            capture_rate,
        }
    }

    /// Feed speaker samples (at the playback rate) into the buffer.
    pub fn feed(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let resampled = resample_linear(samples, self.playback_rate, self.capture_rate);
        let cap = self.capture_rate as usize * REFERENCE_SECS;
        let Ok(mut buf) = self.samples.lock() else {
            return;
        };
        let tail_start = resampled.len().saturating_sub(cap);
        for &s in &resampled[tail_start..] {
            if buf.len() == cap {
                buf.pop_front();
            }
            buf.push_back(s);
        }
    }

    /// Drain exactly `n` samples, zero-filling if the buffer runs dry.
    fn drain(&self, n: usize) -> Vec<f32> {
        let Ok(mut buf) = self.samples.lock() else {
            return vec![0.0; n];
        };
        (0..n).map(|_| buf.pop_front().unwrap_or(0.0)).collect()
    }

    /// Discard all buffered reference audio (on playback stop).
    pub fn reset(&self) {
        if let Ok(mut buf) = self.samples.lock() {
            buf.clear();
        }
    }
}

/// FDAF adaptive filter applied frame-by-frame to the capture path.
pub struct EchoCanceller {
    filter: fdaf_aec::FdafAec,
    reference: EchoReference,
    block_size: usize,
}

impl EchoCanceller {
    /// Create a canceller from config and a shared reference buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `fft_size` is not a non-zero power of two.
    pub fn new(config: &AecConfig, reference: EchoReference) -> Result<Self> {
        if config.fft_size == 0 || !config.fft_size.is_power_of_two() {
            return Err(VoiceError::AudioDevice(format!(
                "AEC fft_size must be a non-zero power of two, got {}",
                config.fft_size
            )));
        }
        Ok(Self {
            filter: fdaf_aec::FdafAec::new(config.fft_size, config.step_size),
            reference,
            block_size: config.fft_size / 2,
        })
    }

    /// Subtract the echo estimate from a capture frame, in place.
    ///
    /// Sub-block remainders pass through unfiltered; with the default
    /// frame and FFT sizes the frame length is an exact multiple.
    pub fn process(&mut self, frame: &mut CaptureFrame) {
        let mic = &frame.samples;
        if mic.is_empty() {
            return;
        }

        let mut cleaned = Vec::with_capacity(mic.len());
        let mut offset = 0;
        while offset + self.block_size <= mic.len() {
            let mic_block = &mic[offset..offset + self.block_size];
            let ref_block = self.reference.drain(self.block_size);
            cleaned.extend_from_slice(&self.filter.process(&ref_block, mic_block));
            offset += self.block_size;
        }
        if offset < mic.len() {
            cleaned.extend_from_slice(&mic[offset..]);
        }

        frame.samples = cleaned;
        frame.rms = super::frame_rms(&frame.samples);
    }
}

/// Linear-interpolation resampler; speech energy sits well below the
/// Nyquist limit at both rates, so no anti-alias filter is needed.
fn resample_linear(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
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
