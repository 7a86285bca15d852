//! Full-duplex audio: capture, playback, and echo cancellation.

pub mod aec;
pub mod bridge;

use crate::error::Result;
use crate::messages::{CaptureFrame, PlaybackEndReason, SynthesizedAudio};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Output half of the audio bridge, as seen by the response pipeline.
///
/// `play` resolves when playback finishes naturally or is stopped;
/// `stop_playback` must be callable from any thread and takes effect
/// immediately.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Schedule a full audio buffer for playback and await its end.
    async fn play(&self, audio: SynthesizedAudio) -> Result<PlaybackEndReason>;

    /// Halt any in-flight playback; its `play` future resolves as stopped.
    fn stop_playback(&self);
}

/// Capture half of the audio bridge, as seen by the recognition adapter.
///
/// At most one tap is attached at a time. Frames captured while no tap
/// is attached are dropped, which is what flushes stale audio across a
/// recognition restart.
pub trait CaptureTap: Send + Sync {
    /// Route capture frames into the given channel.
    fn attach(&self, tx: mpsc::Sender<CaptureFrame>);

    /// Stop routing frames; buffered frames on the old channel are dropped.
    fn detach(&self);
}

/// Compute RMS energy of a frame. Diagnostic only.
pub(crate) fn frame_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
