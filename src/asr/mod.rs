//! Streaming speech recognition: engine seam and session adapter.
//!
//! The engine itself is a black box reached over the wire; this module
//! owns everything around it: attaching the capture tap, tagging results
//! with a session epoch, and the forced-restart dance that keeps one
//! turn's audio and language-model context from leaking into the next.

pub mod ws_engine;

use crate::audio::CaptureTap;
use crate::config::RecognitionConfig;
use crate::error::{Result, VoiceError};
use crate::messages::{RecognitionEvent, SessionEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Channel sizes between the tap, the engine, and the adapter.
const FRAME_CHANNEL_SIZE: usize = 64;
/// Engine update channel size.
pub const UPDATE_CHANNEL_SIZE: usize = 32;

/// A raw progressive result from the engine.
#[derive(Debug, Clone)]
pub struct EngineResult {
    /// Full transcription since the engine session started.
    pub text: String,
    /// Whether the engine considers the segment final.
    pub is_final: bool,
}

/// Everything an engine session can report.
#[derive(Debug)]
pub enum EngineUpdate {
    /// A progressive or final result.
    Result(EngineResult),
    /// A recoverable dropout; the adapter keeps running.
    Transient(String),
    /// Authorization or another unrecoverable failure.
    Fatal(String),
}

/// A live engine session: audio in, updates out.
pub struct EngineSession {
    /// Mono f32 frames at the configured capture rate.
    pub audio_tx: mpsc::Sender<Vec<f32>>,
    /// Progressive results and errors.
    pub updates_rx: mpsc::Receiver<EngineUpdate>,
    /// Cancelling this token ends the session.
    pub cancel: CancellationToken,
}

/// A streaming recognition engine.
///
/// Implementations must deliver volatile word-level partials rather than
/// sentence-batched results; a median inter-result gap above the silence
/// window makes end-of-turn detection impossible.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    /// Open a fresh engine session for the locale.
    async fn open(&self, locale: &str) -> Result<EngineSession>;
}

/// Controller-facing handle to the adapter.
#[async_trait]
pub trait RecognitionControl: Send + Sync {
    /// Forcibly end the current engine session and start a fresh one.
    async fn restart(&self) -> Result<()>;

    /// Permanently end recognition for this session.
    async fn stop(&self);

    /// Current session epoch; events tagged with an older epoch are stale.
    fn epoch(&self) -> u64;
}

struct ActiveSession {
    cancel: CancellationToken,
}

/// Wraps a [`RecognitionEngine`], routing capture frames in and epoch-tagged
/// [`RecognitionEvent`]s out to the controller inbox.
pub struct RecognitionAdapter {
    engine: Arc<dyn RecognitionEngine>,
    tap: Arc<dyn CaptureTap>,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    config: RecognitionConfig,
    epoch: Arc<AtomicU64>,
    session: Mutex<Option<ActiveSession>>,
}

impl RecognitionAdapter {
    /// Create a stopped adapter.
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        tap: Arc<dyn CaptureTap>,
        inbox: mpsc::UnboundedSender<SessionEvent>,
        config: RecognitionConfig,
    ) -> Self {
        Self {
            engine,
            tap,
            inbox,
            config,
            epoch: Arc::new(AtomicU64::new(0)),
            session: Mutex::new(None),
        }
    }

    /// Begin recognition. No-op if already running.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine session cannot be opened; an
    /// authorization failure is fatal for the session.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            debug!("recognition already running");
            return Ok(());
        }
        *session = Some(self.open_session().await?);
        Ok(())
    }

    async fn open_session(&self) -> Result<ActiveSession> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let engine_session = self.engine.open(&self.config.locale).await?;
        let cancel = engine_session.cancel.clone();

        // Frame forwarder: capture tap -> engine.
        let (frames_tx, mut frames_rx) = mpsc::channel(FRAME_CHANNEL_SIZE);
        self.tap.attach(frames_tx);
        let audio_tx = engine_session.audio_tx.clone();
        let forward_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = forward_cancel.cancelled() => break,
                    frame = frames_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if audio_tx.send(frame.samples).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Result pump: engine -> controller inbox, tagged with this epoch.
        let inbox = self.inbox.clone();
        let current_epoch = Arc::clone(&self.epoch);
        let mut updates_rx = engine_session.updates_rx;
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let update = tokio::select! {
                    () = pump_cancel.cancelled() => break,
                    update = updates_rx.recv() => update,
                };
                let Some(update) = update else { break };
                match update {
                    EngineUpdate::Result(result) => {
                        if current_epoch.load(Ordering::SeqCst) != epoch {
                            debug!("dropping stale recognition result (epoch {epoch})");
                            continue;
                        }
                        let event = RecognitionEvent {
                            text: result.text,
                            is_final: result.is_final,
                            epoch,
                            received_at: Instant::now(),
                        };
                        if inbox.send(SessionEvent::Recognition(event)).is_err() {
                            break;
                        }
                    }
                    EngineUpdate::Transient(message) => {
                        warn!("recognition transient error: {message}");
                        let _ = inbox.send(SessionEvent::RecognitionFailure {
                            message,
                            fatal: false,
                        });
                    }
                    EngineUpdate::Fatal(message) => {
                        let _ = inbox.send(SessionEvent::RecognitionFailure {
                            message,
                            fatal: true,
                        });
                        break;
                    }
                }
            }
        });

        info!(epoch, "recognition session started");
        Ok(ActiveSession { cancel })
    }

    async fn close_current(&self, session: Option<ActiveSession>) {
        // Stale the epoch first so results already in flight are dropped.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.tap.detach();
        if let Some(active) = session {
            active.cancel.cancel();
        }
    }
}

#[async_trait]
impl RecognitionControl for RecognitionAdapter {
    async fn restart(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let previous = session.take();
        self.close_current(previous).await;

        // Frames buffered between detach and re-attach belong to the old
        // session; give them time to drain before tapping again.
        tokio::time::sleep(Duration::from_millis(self.config.restart_flush_ms)).await;

        match self.open_session().await {
            Ok(active) => {
                *session = Some(active);
                Ok(())
            }
            Err(e) => Err(match e {
                VoiceError::RecognitionAuth(m) => VoiceError::RecognitionAuth(m),
                other => VoiceError::RecognitionTransient(other.to_string()),
            }),
        }
    }

    async fn stop(&self) {
        let mut session = self.session.lock().await;
        let previous = session.take();
        self.close_current(previous).await;
        info!("recognition stopped");
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}
