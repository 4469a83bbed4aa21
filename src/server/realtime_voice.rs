//! Real-time voice WebSocket handler.
//!
//! Upgrades the HTTP connection, accepts a `dialogue::ProtocolRouter`
//! session, and drives it from the raw axum `WebSocket` split halves: text
//! frames go to `ProtocolRouter::handle_text`, binary (Opus) frames to
//! `ProtocolRouter::handle_binary`. The router owns everything past this
//! point — VAD, STT, the chat engine, TTS, and playback pacing.

use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Query, State},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tracing::{error, info, warn};

use crate::agent::llm::OpenRouterClient;
use crate::config::Config;
use crate::dialogue::chat_engine::{ChatEngine, ChatEngineConfig};
use crate::dialogue::controller::{ChannelTransport, DialogueController, SessionCloser};
use crate::dialogue::opus::OpusCodec;
use crate::dialogue::protocol::ProtocolRouter;
use crate::dialogue::stt::SttAdapterFactory;
use crate::dialogue::tts::TtsAdapterFactory;
use crate::dialogue::vad::SpeechModel;

use super::ServerState;

#[derive(Debug, Deserialize)]
pub struct RealtimeVoiceQuery {
    /// Matches the `deviceId` query param embedded devices send on connect
    /// (§A.6 External Interfaces); absent for browser/web clients.
    #[serde(default, rename = "deviceId")]
    pub device_id: Option<String>,
}

/// One process-wide `ProtocolRouter`: it owns the `SessionRegistry`, the
/// inactivity watcher task, and the STT/TTS adapter caches, so it must
/// outlive any single connection.
static ROUTER: OnceCell<Arc<ProtocolRouter>> = OnceCell::const_new();

async fn router(state: &ServerState) -> Arc<ProtocolRouter> {
    ROUTER
        .get_or_init(|| build_router(state.config.clone()))
        .await
        .clone()
}

async fn build_router(config: Arc<Config>) -> Arc<ProtocolRouter> {
    let dialogue_config = config.dialogue.clone();

    let speech_model = match &dialogue_config.vad_model_path {
        Some(path) => match SpeechModel::load(path.clone()) {
            Ok(model) => Some(Arc::new(Mutex::new(model))),
            Err(err) => {
                error!(%err, path = %path.display(), "failed to load VAD model, speech detection disabled");
                None
            }
        },
        None => None,
    };

    let stt_factory = Arc::new(SttAdapterFactory::new(dialogue_config.vosk_model_path.clone()));
    let tts_factory = Arc::new(TtsAdapterFactory::new(dialogue_config.audio_path.clone()));

    let client = OpenRouterClient::from_keyring().unwrap_or_else(|err| {
        warn!(%err, "no OpenRouter API key configured, dialogue chat calls will fail until one is set");
        OpenRouterClient::new(String::new())
    });
    let chat_engine = Arc::new(ChatEngine::new(
        Arc::new(client),
        ChatEngineConfig { model: config.openrouter.default_model.clone(), max_iterations: 8, max_tokens: 1024, temperature: 0.7 },
    ));

    let codec = Arc::new(OpusCodec::new().expect("opus codec init"));

    // `ConfigStore`/`DeviceStore`/`MessageStore`/`RoleStore` persistence is
    // out of scope (§A.1 Out of scope): every device session runs with the
    // default `Role` and an in-memory-only conversation window.
    let controller =
        DialogueController::new(stt_factory, tts_factory, chat_engine, speech_model, codec, None, None, None, dialogue_config.clone());

    ProtocolRouter::new(controller, None, None, dialogue_config)
}

/// Adapts the axum `WebSocket` sender half to `ChannelTransport`, via an
/// mpsc relay so `ProtocolRouter`/`DialogueController` never touch the
/// socket directly (mirrors the teacher's `OutboundMessage` sender task).
struct WsTransport {
    tx: mpsc::Sender<OutboundMessage>,
}

enum OutboundMessage {
    Json(Value),
    Binary(Vec<u8>),
}

#[async_trait::async_trait]
impl ChannelTransport for WsTransport {
    async fn send_json(&self, value: Value) -> anyhow::Result<()> {
        self.tx.send(OutboundMessage::Json(value)).await.map_err(|_| anyhow::anyhow!("channel closed"))
    }

    async fn send_binary(&self, frame: Vec<u8>) -> anyhow::Result<()> {
        self.tx.send(OutboundMessage::Binary(frame)).await.map_err(|_| anyhow::anyhow!("channel closed"))
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
    Query(query): Query<RealtimeVoiceQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_voice_session(socket, state, query.device_id))
}

async fn handle_voice_session(ws: WebSocket, state: ServerState, device_id: Option<String>) {
    info!(device_id = ?device_id, "real-time voice session connected");

    let router = router(&state).await;
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(64);

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(v) => ws_tx.send(Message::Text(v.to_string().into())).await,
                OutboundMessage::Binary(d) => ws_tx.send(Message::Binary(d.into())).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    let transport: Arc<dyn ChannelTransport> = Arc::new(WsTransport { tx });
    let session = router.accept().await;

    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => {
                router.handle_text(&session, &transport, &text, device_id.as_deref()).await;
            }
            Message::Binary(data) => {
                router.handle_binary(&session, &transport, &data).await;
            }
            Message::Close(_) => {
                info!(session_id = %session.session_id, "voice session disconnected");
                break;
            }
            _ => {}
        }
    }

    router.close_session(&session.session_id).await;
    sender_task.abort();
}
