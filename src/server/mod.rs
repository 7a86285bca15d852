//! HTTP/WebSocket transport: one session per socket.

pub mod protocol;

use crate::messages::{SessionCommand, SessionEvent};
use crate::session::SessionRuntime;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use protocol::{ClientMessage, ServerMessage};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared server state.
#[derive(Clone)]
struct AppState {
    runtime: Arc<SessionRuntime>,
}

/// Run the transport until the listener fails or the process exits.
///
/// When the WebSocket port differs from the HTTP port, `/ws` gets its
/// own listener; by default both routes share one.
///
/// # Errors
///
/// Returns an error if a listener cannot bind.
pub async fn run_server(runtime: Arc<SessionRuntime>) -> anyhow::Result<()> {
    let server = runtime.config().server.clone();
    let state = AppState { runtime };

    if server.ws_port != server.http_port {
        let ws_app = Router::new()
            .route("/ws", get(ws_upgrade))
            .with_state(state.clone());
        let ws_addr = format!("{}:{}", server.host, server.ws_port);
        let ws_listener = tokio::net::TcpListener::bind(&ws_addr).await?;
        info!("session sockets on ws://{}/ws", ws_listener.local_addr()?);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(ws_listener, ws_app).await {
                warn!("websocket listener failed: {e}");
            }
        });
    }

    let addr = format!("{}:{}", server.host, server.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    info!("orchestrator listening on http://{local_addr} (ws on /ws)");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ws_upgrade(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state.runtime))
}

/// Drive one client socket: wait for `start_session`, then pump messages
/// both ways until either side closes.
async fn handle_socket(mut socket: WebSocket, runtime: Arc<SessionRuntime>) {
    // First meaningful message must open the session.
    let remote_audio = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match parse_client(&text) {
                Some(ClientMessage::StartSession { remote_audio }) => break remote_audio,
                Some(other) => {
                    debug!("ignoring pre-session message: {other:?}");
                }
                None => {}
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("socket error before session start: {e}");
                return;
            }
        }
    };

    let mut session = match runtime.open_session(remote_audio).await {
        Ok(session) => session,
        Err(e) => {
            warn!("session open failed: {e}");
            let message = ServerMessage::SessionError {
                message: e.to_string(),
                fatal: true,
            };
            let _ = send_json(&mut socket, &message).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    info!(session = %session.id, "websocket session established");

    loop {
        tokio::select! {
            output = session.outputs.recv() => {
                let Some(output) = output else {
                    // Controller ended (fatal error or idle timeout).
                    break;
                };
                let message = ServerMessage::from(output);
                if send_json(&mut socket, &message).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Some(message) = parse_client(&text) else { continue };
                        if dispatch_client(&session, message) {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        // Raw binary frames are accepted as PCM16 directly.
                        session.bridge.ingest_pcm16(&bytes);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("socket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    session.close();
    let _ = socket.send(Message::Close(None)).await;
    info!(session = %session.id, "websocket session closed");
}

/// Returns `true` when the session should end.
fn dispatch_client(session: &crate::session::Session, message: ClientMessage) -> bool {
    match message {
        ClientMessage::StartSession { .. } => {
            debug!("duplicate start_session ignored");
            false
        }
        ClientMessage::StopSession => true,
        ClientMessage::CancelCurrentResponse => {
            let _ = session
                .inbox
                .send(SessionEvent::Command(SessionCommand::CancelResponse));
            false
        }
        ClientMessage::AudioFrame { pcm, format } => {
            if format != "pcm16" {
                warn!("unsupported audio format '{format}', frame dropped");
                return false;
            }
            match BASE64.decode(pcm.as_bytes()) {
                Ok(bytes) => session.bridge.ingest_pcm16(&bytes),
                Err(e) => debug!("bad audio frame payload: {e}"),
            }
            false
        }
    }
}

fn parse_client(text: &str) -> Option<ClientMessage> {
    match serde_json::from_str(text) {
        Ok(message) => Some(message),
        Err(e) => {
            debug!("unparseable client message: {e}");
            None
        }
    }
}

async fn send_json(
    socket: &mut WebSocket,
    message: &ServerMessage,
) -> std::result::Result<(), axum::Error> {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!("outbound message serialization failed: {e}");
            Ok(())
        }
    }
}
