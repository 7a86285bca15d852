//! Session lifetime: wiring one live connection to its own controller.
//!
//! The runtime holds the collaborators shared across sessions (LLM and
//! TTS clients are connection-pooled); each opened session gets its own
//! audio bridge, recognition adapter, inbox, and controller task.

use crate::asr::ws_engine::WsRecognitionEngine;
use crate::asr::{RecognitionAdapter, RecognitionControl, RecognitionEngine};
use crate::audio::bridge::AudioBridge;
use crate::audio::{AudioOutput, CaptureTap};
use crate::config::OrchestratorConfig;
use crate::conversation::ConversationJournal;
use crate::error::Result;
use crate::llm::{HttpLlm, LanguageModel};
use crate::messages::{SessionCommand, SessionEvent, SessionOutput};
use crate::pipeline::PipelineServices;
use crate::tts::{HttpTts, SpeechSynthesizer};
use crate::turn::{ControllerDeps, TurnController};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Collaborators shared by every session.
pub struct SessionRuntime {
    config: OrchestratorConfig,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn SpeechSynthesizer>,
    engine: Arc<dyn RecognitionEngine>,
    journal: ConversationJournal,
}

impl SessionRuntime {
    /// Build the shared runtime from config.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be constructed.
    pub fn new(config: OrchestratorConfig, journal: ConversationJournal) -> Result<Self> {
        let llm: Arc<dyn LanguageModel> = Arc::new(HttpLlm::new(&config.llm)?);
        let tts: Arc<dyn SpeechSynthesizer> = Arc::new(HttpTts::new(&config.tts)?);
        let engine: Arc<dyn RecognitionEngine> = Arc::new(WsRecognitionEngine::new(
            config.recognition.engine_url.clone(),
            config.audio.input_sample_rate,
        ));
        Ok(Self {
            config,
            llm,
            tts,
            engine,
            journal,
        })
    }

    /// Runtime with injected collaborators (tests, alternative backends).
    pub fn with_services(
        config: OrchestratorConfig,
        journal: ConversationJournal,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn SpeechSynthesizer>,
        engine: Arc<dyn RecognitionEngine>,
    ) -> Self {
        Self {
            config,
            llm,
            tts,
            engine,
            journal,
        }
    }

    /// Shared configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Open a session: audio bridge up, recognition started, controller
    /// task running.
    ///
    /// `remote_capture` selects whether the client streams microphone
    /// audio over the wire instead of the core owning a local device.
    ///
    /// # Errors
    ///
    /// Returns an error if audio cannot start or recognition authorization
    /// is denied; both are fatal for the session.
    pub async fn open_session(&self, remote_capture: bool) -> Result<Session> {
        let id = Uuid::new_v4().to_string();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let (outputs_tx, outputs_rx) = mpsc::unbounded_channel::<SessionOutput>();

        let bridge = Arc::new(AudioBridge::new(
            self.config.audio.clone(),
            self.config.aec.clone(),
        ));
        if remote_capture {
            bridge.start_remote()?;
        } else {
            bridge.start()?;
        }

        let adapter = Arc::new(RecognitionAdapter::new(
            Arc::clone(&self.engine),
            Arc::clone(&bridge) as Arc<dyn CaptureTap>,
            inbox_tx.clone(),
            self.config.recognition.clone(),
        ));
        adapter.start().await?;

        let deps = ControllerDeps {
            recognition: Arc::clone(&adapter) as Arc<dyn RecognitionControl>,
            services: PipelineServices {
                llm: Arc::clone(&self.llm),
                tts: Arc::clone(&self.tts),
                output: Arc::clone(&bridge) as Arc<dyn AudioOutput>,
                inbox: inbox_tx.clone(),
            },
            journal: self.journal.clone(),
            outputs: outputs_tx,
        };

        let controller = TurnController::new(
            id.clone(),
            self.config.clone(),
            deps,
            inbox_tx.clone(),
            inbox_rx,
        );
        tokio::spawn(controller.run());

        info!(session = %id, remote_capture, "session opened");
        Ok(Session {
            id,
            inbox: inbox_tx,
            outputs: outputs_rx,
            bridge,
        })
    }
}

/// A live session as seen by the transport layer.
pub struct Session {
    /// Session identifier.
    pub id: String,
    /// Event inbox (commands from the client land here).
    pub inbox: mpsc::UnboundedSender<SessionEvent>,
    /// Outbound session events for the client.
    pub outputs: mpsc::UnboundedReceiver<SessionOutput>,
    /// The session's audio bridge, for remote capture ingest.
    pub bridge: Arc<AudioBridge>,
}

impl Session {
    /// Ask the controller to stop and tear down audio.
    pub fn close(&self) {
        let _ = self.inbox.send(SessionEvent::Command(SessionCommand::Stop));
        self.bridge.stop();
    }
}
