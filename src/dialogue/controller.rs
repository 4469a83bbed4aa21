//! Binds the dialogue components to one session: routes inbound audio and
//! text, handles wake-word and exit-intent, and owns the per-turn
//! Synthesizer/Player pairing (§A.4.12).
//!
//! `DialogueController` does not own `SessionRegistry` — that belongs to
//! `ProtocolRouter` (§A.4.13) — so session teardown is expressed through the
//! `SessionCloser` callback rather than a direct dependency.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::dialogue::chat_engine::ChatEngine;
use crate::dialogue::config::DialogueConfig;
use crate::dialogue::mcp::{DeviceMcpBridge, JsonRpcResponse, McpTransport};
use crate::dialogue::memory::{load_window, ChatMessage, Conversation, MessageRole, MessageType};
use crate::dialogue::opus::OpusCodec;
use crate::dialogue::player::{Player, PlayerSessionHooks, PlayerSink};
use crate::dialogue::session::{ConfigStore, IotDevice, IotMethod, IotProperty, MessageStore, PersistedTurn, Role, RoleStore, Session};
use crate::dialogue::stt::{SttAdapter, SttAdapterFactory, SttConfig};
use crate::dialogue::synthesizer::{SynthesisRetryPolicy, Synthesizer};
use crate::dialogue::tools::{Tool, ToolContext, ToolHandler, ToolOutcome};
use crate::dialogue::tts::{TtsAdapter, TtsAdapterFactory, TtsConfig};
use crate::dialogue::vad::{SpeechModel, VadSegmenter, VadStatus, VadThresholds, PCM_SAMPLE_RATE_HZ};

/// STT stream idle budget; a device that opens an audio stream and never
/// closes it does not hang the worker forever (§5 Timeouts).
const STT_STREAM_TIMEOUT: Duration = Duration::from_secs(90);

/// Appended when the token stream itself errors mid-turn (§4.6).
const FALLBACK_APOLOGY: &str = "抱歉，我在处理您的请求时遇到问题。";

/// Seed text for a wake-word ("detect") turn: no STT ran, so there is no
/// real user utterance to echo back — this stands in for it.
const WAKE_WORD_SEED: &str = "你好";

const GOODBYE_TEMPLATES: &[&str] = &[
    "好的，再见，有需要随时叫我。",
    "再见啦，祝你今天愉快！",
    "拜拜，下次再聊。",
];

const EXIT_KEYWORDS: &[&str] = &["拜拜", "再见", "退下吧", "goodbye", "bye bye"];

fn detect_exit_intent(text: &str) -> bool {
    EXIT_KEYWORDS.iter().any(|kw| text.contains(kw))
}

fn pick_goodbye_template() -> &'static str {
    use rand::Rng;
    let idx = rand::rng().random_range(0..GOODBYE_TEMPLATES.len());
    GOODBYE_TEMPLATES[idx]
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Raw transport abstraction for one device/browser connection. Carries
/// both the text (JSON) and binary (Opus) halves of the channel described
/// in §A.6.1.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send_json(&self, value: Value) -> anyhow::Result<()>;
    async fn send_binary(&self, frame: Vec<u8>) -> anyhow::Result<()>;
    fn is_open(&self) -> bool;
}

/// Closes a session by id. Implemented by `ProtocolRouter`, which alone
/// owns the `SessionRegistry` and the device-state-transition policy of
/// §C.1.
#[async_trait]
pub trait SessionCloser: Send + Sync {
    async fn close_session(&self, session_id: &str);
}

/// Adapts a `ChannelTransport` to the narrower `PlayerSink` contract.
struct TransportPlayerSink {
    transport: Arc<dyn ChannelTransport>,
    session_id: String,
}

#[async_trait]
impl PlayerSink for TransportPlayerSink {
    async fn send_sentence_start(&self, text: Option<&str>) {
        let _ = self.transport.send_json(json!({"type": "tts", "state": "sentence_start", "text": text})).await;
    }

    async fn send_opus_frame(&self, frame: &[u8]) {
        let _ = self.transport.send_binary(frame.to_vec()).await;
    }

    async fn send_emotion(&self, emotion: Option<&str>) {
        let _ = self
            .transport
            .send_json(json!({"type": "llm", "session_id": self.session_id, "emotion": emotion.unwrap_or("neutral"), "text": ""}))
            .await;
    }

    async fn send_stop(&self) {
        let _ = self.transport.send_json(json!({"type": "tts", "state": "stop"})).await;
    }
}

/// Adapts a `ChannelTransport` to `McpTransport`, wrapping every JSON-RPC
/// frame in the `{type:"mcp", session_id, payload}` envelope (§4.11).
struct TransportMcpTransport {
    transport: Arc<dyn ChannelTransport>,
    session_id: String,
}

#[async_trait]
impl McpTransport for TransportMcpTransport {
    async fn send_json(&self, value: Value) -> anyhow::Result<()> {
        self.transport.send_json(json!({"type": "mcp", "session_id": self.session_id, "payload": value})).await
    }
}

/// Adapts `ChannelTransport` + `Session` + `SessionCloser` to the hooks a
/// `Player` needs.
struct TransportSessionHooks {
    transport: Arc<dyn ChannelTransport>,
    session: Arc<Session>,
    closer: Arc<dyn SessionCloser>,
    message_store: Option<Arc<dyn MessageStore>>,
    device_id: Option<String>,
    role_id: i64,
}

#[async_trait]
impl PlayerSessionHooks for TransportSessionHooks {
    fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    fn close_after_chat(&self) -> bool {
        self.session.close_after_chat()
    }

    fn clear_wakeup_response(&self) {
        self.session.set_in_wakeup_response(false);
    }

    async fn close_session(&self) {
        self.closer.close_session(&self.session.session_id).await;
    }

    fn update_last_activity(&self) {
        self.session.touch();
    }

    fn assistant_time_ms(&self) -> Option<i64> {
        let t = self.session.assistant_time_ms();
        if t == 0 {
            None
        } else {
            Some(t)
        }
    }

    fn assistant_audio_path(&self, time_ms: i64) -> PathBuf {
        self.session.assistant_audio_path(time_ms, "wav")
    }

    async fn persist_assistant_audio_path(&self, time_ms: i64, path: &str) {
        if let (Some(store), Some(device_id)) = (&self.message_store, &self.device_id) {
            if let Err(err) = store.update_audio_path(device_id, self.role_id, time_ms, path).await {
                error!(%err, "failed to persist assistant audio path");
            }
        }
    }
}

/// Binds STT/TTS factories, the shared VAD model, the chat engine and the
/// opaque persistence stores to produce per-session dialogue behavior.
pub struct DialogueController {
    stt_factory: Arc<SttAdapterFactory>,
    tts_factory: Arc<TtsAdapterFactory>,
    chat_engine: Arc<ChatEngine>,
    /// `None` when no `vad_model_path` is configured — sessions still
    /// accept audio frames but VAD never reports speech (§6.4).
    speech_model: Option<Arc<Mutex<SpeechModel>>>,
    codec: Arc<OpusCodec>,
    config_store: Option<Arc<dyn ConfigStore>>,
    message_store: Option<Arc<dyn MessageStore>>,
    role_store: Option<Arc<dyn RoleStore>>,
    config: DialogueConfig,
}

impl DialogueController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stt_factory: Arc<SttAdapterFactory>,
        tts_factory: Arc<TtsAdapterFactory>,
        chat_engine: Arc<ChatEngine>,
        speech_model: Option<Arc<Mutex<SpeechModel>>>,
        codec: Arc<OpusCodec>,
        config_store: Option<Arc<dyn ConfigStore>>,
        message_store: Option<Arc<dyn MessageStore>>,
        role_store: Option<Arc<dyn RoleStore>>,
        config: DialogueConfig,
    ) -> Arc<Self> {
        Arc::new(Self { stt_factory, tts_factory, chat_engine, speech_model, codec, config_store, message_store, role_store, config })
    }

    /// Build an `McpTransport` bound to this session's channel, for the
    /// caller (`ProtocolRouter`) to install as the session's `McpHolder`.
    pub fn mcp_transport(&self, transport: Arc<dyn ChannelTransport>, session_id: &str) -> Arc<dyn McpTransport> {
        Arc::new(TransportMcpTransport { transport, session_id: session_id.to_string() })
    }

    async fn resolve_stt(&self, role: &Role) -> Arc<dyn SttAdapter> {
        let (Some(config_id), Some(store)) = (role.stt_config_id, &self.config_store) else {
            return self.stt_factory.default_adapter().await;
        };
        match store.by_id(config_id).await {
            Ok(Some(cfg)) => {
                let stt_config = SttConfig { provider: Some(cfg.provider), config_id: Some(cfg.id), api_url: cfg.api_url };
                self.stt_factory.get(Some(&stt_config)).await
            }
            Ok(None) => self.stt_factory.default_adapter().await,
            Err(err) => {
                error!(%err, "failed to load stt config, falling back to default");
                self.stt_factory.default_adapter().await
            }
        }
    }

    async fn resolve_tts(&self, role: &Role) -> Arc<dyn TtsAdapter> {
        let config = match (role.tts_config_id, &self.config_store) {
            (Some(id), Some(store)) => match store.by_id(id).await {
                Ok(Some(cfg)) => Some(TtsConfig { provider: Some(cfg.provider), config_id: Some(cfg.id), api_url: cfg.api_url }),
                Ok(None) => None,
                Err(err) => {
                    error!(%err, "failed to load tts config, falling back to default");
                    None
                }
            },
            _ => None,
        };
        self.tts_factory.get(config.as_ref(), &role.voice_name, role.tts_pitch, role.tts_speed).await
    }

    /// Hydrate the session's memory window on first use (§4.8).
    async fn ensure_conversation(&self, session: &Arc<Session>) {
        if session.conversation.lock().await.is_some() {
            return;
        }
        let role = session.role.read().await.clone();
        let device = session.device.read().await.clone();
        let max_messages = self.config.max_window_messages;

        let conversation = match (&device, &self.message_store) {
            (Some(device), Some(store)) => {
                match load_window(store.as_ref(), &device.device_id, role.role_id, non_empty(&role.system_prompt), max_messages).await {
                    Ok(conversation) => conversation,
                    Err(err) => {
                        error!(%err, "failed to hydrate conversation window, starting empty");
                        Conversation::new(non_empty(&role.system_prompt), max_messages)
                    }
                }
            }
            _ => Conversation::new(non_empty(&role.system_prompt), max_messages),
        };
        *session.conversation.lock().await = Some(conversation);
    }

    /// Install built-in tools that close over session state: `exit-session`,
    /// `new-chat`, `change-role` (§4.9).
    pub async fn register_builtin_tools(&self, session: &Arc<Session>) {
        let mut tools = session.tools.lock().await;

        let exit_session = session.clone();
        tools.register(Tool::new(
            "exit-session",
            "End the current conversation session after responding to the user.",
            json!({"type": "object", "properties": {}}),
            true,
            false,
            Arc::new(move |_args: Value, _ctx: ToolContext| {
                let exit_session = exit_session.clone();
                async move {
                    exit_session.set_close_after_chat();
                    Ok(ToolOutcome::text("好的，再见。"))
                }
            }),
        ));

        let new_chat_session = session.clone();
        tools.register(Tool::new(
            "new-chat",
            "Clear conversation history and start a fresh chat.",
            json!({"type": "object", "properties": {}}),
            true,
            true,
            Arc::new(move |_args: Value, _ctx: ToolContext| {
                let new_chat_session = new_chat_session.clone();
                async move {
                    new_chat_session.request_conversation_reset();
                    Ok(ToolOutcome::text("好的，已经开始新的对话。"))
                }
            }),
        ));

        if let Some(role_store) = self.role_store.clone() {
            let change_role_session = session.clone();
            tools.register(Tool::new(
                "change-role",
                "Switch the assistant to a different configured role by id.",
                json!({"type": "object", "properties": {"role_id": {"type": "integer"}}, "required": ["role_id"]}),
                true,
                true,
                Arc::new(move |args: Value, _ctx: ToolContext| {
                    let role_store = role_store.clone();
                    let change_role_session = change_role_session.clone();
                    async move {
                        let Some(role_id) = args.get("role_id").and_then(|v| v.as_i64()) else {
                            return Ok(ToolOutcome::text("缺少 role_id 参数"));
                        };
                        match role_store.by_id(role_id).await? {
                            Some(role) => {
                                change_role_session.set_role(role).await;
                                change_role_session.request_conversation_reset();
                                Ok(ToolOutcome::text("角色已切换。"))
                            }
                            None => Ok(ToolOutcome::text("未找到该角色。")),
                        }
                    }
                }),
            ));
        }
    }

    /// Route one decoded Opus frame through VAD (§4.1/§4.2/§4.12 binary path).
    pub async fn process_audio_data(
        self: &Arc<Self>,
        session: &Arc<Session>,
        transport: &Arc<dyn ChannelTransport>,
        closer: &Arc<dyn SessionCloser>,
        opus_bytes: &[u8],
    ) {
        session.touch();
        let pcm = self.codec.decode(opus_bytes);
        if pcm.is_empty() {
            return;
        }

        let Some(speech_model) = &self.speech_model else { return };
        let result = {
            let mut vad_guard = session.vad.lock().await;
            let Some(vad) = vad_guard.as_mut() else { return };
            vad.add_opus_frame(opus_bytes);
            let mut model = speech_model.lock().await;
            vad.process(&mut model, &pcm)
        };

        match result.status {
            VadStatus::SpeechStart => {
                self.on_speech_start(session, transport, closer).await;
                self.forward_audio_chunk(session, result.data).await;
            }
            VadStatus::SpeechContinue => {
                self.forward_audio_chunk(session, result.data).await;
            }
            VadStatus::SpeechEnd => {
                self.forward_audio_chunk(session, result.data).await;
                self.capture_turn_audio(session).await;
                self.close_audio_stream(session).await;
            }
            VadStatus::NoSpeech | VadStatus::Error => {}
        }
    }

    /// On speech onset: abort any in-dialog synthesizer (barge-in), then
    /// open a fresh audio stream and hand it to a streaming STT task that
    /// finalizes the turn once the device signals SPEECH_END.
    async fn on_speech_start(self: &Arc<Self>, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>, closer: &Arc<dyn SessionCloser>) {
        let in_dialog = {
            let synthesizer = session.synthesizer.lock().await;
            synthesizer.as_ref().map(|s| s.is_dialog() && !s.is_aborted()).unwrap_or(false)
        };
        if in_dialog {
            self.abort_dialogue(session, transport, "vad").await;
        }

        session.stt_cancelled.store(false, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        *session.audio_tx.lock().await = Some(tx);

        let role = session.role.read().await.clone();
        let stt = self.resolve_stt(&role).await;

        let controller = self.clone();
        let session = session.clone();
        let transport = transport.clone();
        let closer = closer.clone();
        tokio::spawn(async move {
            let text = match tokio::time::timeout(STT_STREAM_TIMEOUT, stt.stream_recognize(rx)).await {
                Ok(Ok(text)) => text,
                Ok(Err(err)) => {
                    error!(%err, "stt recognition failed");
                    session.last_capture.lock().await.take();
                    return;
                }
                Err(_) => {
                    warn!(session_id = %session.session_id, "stt stream timed out");
                    session.last_capture.lock().await.take();
                    return;
                }
            };
            if text.trim().is_empty() || session.stt_cancelled.load(Ordering::SeqCst) {
                session.last_capture.lock().await.take();
                return;
            }
            controller.finalize_turn(&session, &transport, &closer, text, true, true).await;
        });
    }

    async fn forward_audio_chunk(&self, session: &Arc<Session>, chunk: Option<Vec<u8>>) {
        let Some(chunk) = chunk else { return };
        if chunk.is_empty() {
            return;
        }
        let guard = session.audio_tx.lock().await;
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(chunk).await;
        }
    }

    /// Drop the stream-close sentinel; the STT worker's `stream_recognize`
    /// observes the channel closing and returns its final transcript.
    async fn close_audio_stream(&self, session: &Arc<Session>) {
        session.audio_tx.lock().await.take();
    }

    /// Snapshot the VAD segmenter's captured PCM for the segment that just
    /// ended, before the next SPEECH_START can clear it out from under a
    /// still-running STT task (§4.12, §6.3).
    async fn capture_turn_audio(&self, session: &Arc<Session>) {
        let vad_guard = session.vad.lock().await;
        let Some(vad) = vad_guard.as_ref() else { return };
        let pcm: Vec<u8> = vad.captured_pcm().concat();
        drop(vad_guard);
        *session.last_capture.lock().await = Some(pcm);
    }

    /// Write the captured turn audio to a mono 16kHz WAV file at the
    /// device/role/timestamp path dictated by §6.3, returning the path as a
    /// string for persistence in the message record. Returns `None` if no
    /// audio was captured (e.g. a text/detect turn) or the write failed.
    async fn write_turn_audio(&self, session: &Arc<Session>, device_id: &str, role_id: i64, turn_ms: i64) -> Option<String> {
        let pcm = session.last_capture.lock().await.take()?;
        if pcm.is_empty() {
            return None;
        }
        let path = session.audio_path(device_id, role_id, turn_ms, "user", "wav");
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                error!(%err, path = %parent.display(), "failed to create audio directory");
                return None;
            }
        }
        let write_path = path.clone();
        let result = tokio::task::spawn_blocking(move || write_wav_file(&write_path, &pcm)).await;
        match result {
            Ok(Ok(())) => Some(path.display().to_string()),
            Ok(Err(err)) => {
                error!(%err, path = %path.display(), "failed to write turn audio");
                None
            }
            Err(err) => {
                error!(%err, "audio write task panicked");
                None
            }
        }
    }

    /// Text `listen` frame (§4.12, §6.1).
    pub async fn handle_listen(
        self: &Arc<Self>,
        session: &Arc<Session>,
        transport: &Arc<dyn ChannelTransport>,
        closer: &Arc<dyn SessionCloser>,
        state: &str,
        text: Option<&str>,
    ) {
        session.touch();
        match state {
            "start" => {
                session.streaming.store(true, Ordering::SeqCst);
                let role = session.role.read().await.clone();
                let thresholds = VadThresholds {
                    speech_th: role.vad.speech_th,
                    silence_th: role.vad.silence_th,
                    energy_th: role.vad.energy_th,
                    silence_timeout_ms: role.vad.silence_timeout_ms,
                };
                let segmenter = VadSegmenter::new(self.config.vad_prebuffer_ms, self.config.vad_tail_keep_ms, thresholds);
                *session.vad.lock().await = Some(segmenter);
            }
            "stop" => {
                session.streaming.store(false, Ordering::SeqCst);
                self.capture_turn_audio(session).await;
                self.close_audio_stream(session).await;
                session.vad.lock().await.take();
            }
            "text" => {
                if let Some(text) = text {
                    if !text.trim().is_empty() {
                        session.last_capture.lock().await.take();
                        self.finalize_turn(session, transport, closer, text.to_string(), true, false).await;
                    }
                }
            }
            "detect" => {
                session.set_in_wakeup_response(true);
                session.last_capture.lock().await.take();
                self.finalize_turn(session, transport, closer, WAKE_WORD_SEED.to_string(), false, false).await;
            }
            other => {
                warn!(state = other, "unknown listen state, dropping frame");
            }
        }
    }

    /// Text `iot` frame: merge property state updates and/or (re)register
    /// tools from freshly declared descriptors (§4.12, §6.1).
    pub async fn handle_iot(&self, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>, payload: &Value) {
        session.touch();

        if let Some(states) = payload.get("states").and_then(|v| v.as_array()) {
            let mut iot = session.iot.write().await;
            for state in states {
                let Some(name) = state.get("name").and_then(|v| v.as_str()) else { continue };
                let Some(new_state) = state.get("state").and_then(|v| v.as_object()) else { continue };
                if let Some(device) = iot.devices.get_mut(name) {
                    for (prop, value) in new_state {
                        if let Some(existing) = device.properties.get_mut(prop) {
                            existing.value = value.clone();
                        }
                    }
                }
            }
        }

        if let Some(descriptors) = payload.get("descriptors").and_then(|v| v.as_array()) {
            {
                let mut iot = session.iot.write().await;
                for descriptor in descriptors {
                    let Some(name) = descriptor.get("name").and_then(|v| v.as_str()) else { continue };
                    iot.devices.insert(name.to_string(), parse_iot_device(descriptor));
                }
            }
            self.register_iot_tools(session, transport).await;
        }
    }

    async fn register_iot_tools(&self, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>) {
        let iot = session.iot.read().await.clone();
        let mut tools = session.tools.lock().await;

        for (device_name, device) in iot.devices.iter() {
            for (prop_name, prop) in &device.properties {
                let current_value = Arc::new(RwLock::new(prop.value.clone()));
                tools.register_iot_property(device_name, prop_name, current_value);
            }

            for (method_name, method) in &device.methods {
                let transport = transport.clone();
                let session_id = session.session_id.clone();
                let device_name = device_name.clone();
                let method_name = method_name.clone();
                let response_success = format!("{device_name} {method_name} 已执行");
                let handler: Arc<dyn ToolHandler> = Arc::new(move |args: Value, _ctx: ToolContext| {
                    let transport = transport.clone();
                    let session_id = session_id.clone();
                    let device_name = device_name.clone();
                    let method_name = method_name.clone();
                    let response_success = response_success.clone();
                    async move {
                        let command = json!({
                            "type": "iot",
                            "session_id": session_id,
                            "commands": [{"name": device_name, "method": method_name, "parameters": args}],
                        });
                        let _ = transport.send_json(command).await;
                        Ok(ToolOutcome::text(response_success))
                    }
                });
                tools.register_iot_method(device_name, method_name, method.parameters.clone(), String::new(), handler);
            }
        }
    }

    /// Text `mcp` frame: a JSON-RPC response from the device, routed back
    /// to whichever `send_request` is awaiting it (§4.11).
    pub async fn handle_mcp(&self, session: &Arc<Session>, payload: Value) {
        let bridge = session.mcp.lock().await.clone();
        let Some(bridge) = bridge else {
            warn!(session_id = %session.session_id, "mcp frame received with no bridge installed");
            return;
        };
        match serde_json::from_value::<JsonRpcResponse>(payload) {
            Ok(response) => bridge.handle_response(response).await,
            Err(err) => warn!(%err, "failed to parse mcp response frame"),
        }
    }

    /// Register device-hosted MCP tools once the bridge has completed
    /// `initialize` (called by `ProtocolRouter` after `hello` when
    /// `features.mcp` is set).
    pub async fn register_mcp_tools(&self, session: &Arc<Session>) {
        let bridge = session.mcp.lock().await.clone();
        let Some(bridge) = bridge else { return };
        match bridge.list_tools().await {
            Ok(mcp_tools) => {
                let mut tools = session.tools.lock().await;
                for tool in mcp_tools {
                    let bridge = bridge.clone();
                    let name = tool.name.clone();
                    let handler: Arc<dyn ToolHandler> = Arc::new(move |args: Value, _ctx: ToolContext| {
                        let bridge = bridge.clone();
                        let name = name.clone();
                        async move {
                            let result = bridge.call_tool(&name, args).await?;
                            let message = result.get("content").map(|c| c.to_string()).unwrap_or_else(|| result.to_string());
                            Ok(ToolOutcome { message, data: Some(result) })
                        }
                    });
                    tools.register_mcp_tool(&tool.name, tool.description, tool.input_schema, handler);
                }
            }
            Err(err) => error!(%err, "failed to list mcp tools"),
        }
    }

    /// Text `goodbye` frame: reset VAD, abort any dialogue, close the
    /// session (§4.12).
    pub async fn handle_goodbye(&self, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>, closer: &Arc<dyn SessionCloser>) {
        session.vad.lock().await.take();
        self.abort_dialogue(session, transport, "goodbye").await;
        closer.close_session(&session.session_id).await;
    }

    /// Text `abort` frame, and the internal barge-in path from
    /// `on_speech_start` (§5 Cancellation).
    pub async fn abort_dialogue(&self, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>, reason: &str) {
        info!(session_id = %session.session_id, reason, "aborting dialogue");
        session.stt_cancelled.store(true, Ordering::SeqCst);
        session.abort_dialog().await;
        if let Some(vad) = session.vad.lock().await.as_mut() {
            vad.reset();
        }
        self.close_audio_stream(session).await;
        let _ = transport.send_json(json!({"type": "tts", "state": "stop"})).await;
    }

    /// Goodbye message for a detected exit intent: synthesized and played
    /// directly (there is no in-flight Synthesizer/Player pair yet for this
    /// turn), then the session is closed (§4.12, Scenario B).
    async fn handle_exit_intent(&self, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>, closer: &Arc<dyn SessionCloser>) {
        let message = pick_goodbye_template();
        let _ = transport.send_json(json!({"type": "tts", "state": "sentence_start", "text": message})).await;

        let role = session.role.read().await.clone();
        let tts = self.resolve_tts(&role).await;
        match tts.text_to_speech(message).await {
            Ok(path) => match tokio::fs::read(&path).await {
                Ok(pcm) => {
                    for frame in self.codec.encode_stream(&pcm, false) {
                        let _ = transport.send_binary(frame).await;
                    }
                }
                Err(err) => error!(%err, "failed to read synthesized goodbye audio"),
            },
            Err(err) => error!(%err, "goodbye synthesis failed"),
        }

        let _ = transport.send_json(json!({"type": "tts", "state": "stop"})).await;
        session.set_close_after_chat();
        closer.close_session(&session.session_id).await;
    }

    /// Finalize one user turn: persist it, run exit-intent detection, and
    /// either say goodbye or stream a reply through a fresh
    /// Synthesizer/Player pair (§4.10, §4.12).
    async fn finalize_turn(
        self: &Arc<Self>,
        session: &Arc<Session>,
        transport: &Arc<dyn ChannelTransport>,
        closer: &Arc<dyn SessionCloser>,
        user_text: String,
        announce_stt: bool,
        persist_audio: bool,
    ) {
        let turn_ms = session.begin_turn();
        if announce_stt {
            let _ = transport.send_json(json!({"type": "stt", "text": user_text})).await;
        }
        let _ = transport.send_json(json!({"type": "tts", "state": "start"})).await;

        let device = session.device.read().await.clone();
        let role = session.role.read().await.clone();

        if let (Some(device), Some(store)) = (&device, &self.message_store) {
            let mut message = ChatMessage::new(MessageRole::User, user_text.clone(), turn_ms);
            if persist_audio {
                if let Some(path) = self.write_turn_audio(session, &device.device_id, role.role_id, turn_ms).await {
                    message = message.with_audio_path(path);
                }
            }
            let turn = PersistedTurn { device_id: device.device_id.clone(), role_id: role.role_id, message };
            if let Err(err) = store.add(turn).await {
                error!(%err, "failed to persist user turn");
            }
        }

        if detect_exit_intent(&user_text) {
            self.handle_exit_intent(session, transport, closer).await;
            return;
        }

        self.ensure_conversation(session).await;

        let tts = self.resolve_tts(&role).await;
        let sink = Arc::new(TransportPlayerSink { transport: transport.clone(), session_id: session.session_id.clone() });
        let hooks = Arc::new(TransportSessionHooks {
            transport: transport.clone(),
            session: session.clone(),
            closer: closer.clone(),
            message_store: self.message_store.clone(),
            device_id: device.as_ref().map(|d| d.device_id.clone()),
            role_id: role.role_id,
        });
        let player = Player::new(sink.clone(), hooks, self.codec.clone());
        let retry_policy = SynthesisRetryPolicy { max_retry_count: self.config.tts_max_retry_count, retry_delay_ms: self.config.tts_retry_delay_ms };
        let emotion_sink = sink.clone();
        let synthesizer = Arc::new(Synthesizer::spawn(tts, player.clone(), retry_policy, Arc::new(move || {
            let emotion_sink = emotion_sink.clone();
            tokio::spawn(async move {
                emotion_sink.send_emotion(Some("happy")).await;
            });
        })));
        session.replace_dialog_pair(synthesizer.clone(), player.clone()).await;
        player.play();

        let ctx = ToolContext { session_id: session.session_id.clone(), device_id: device.as_ref().map(|d| d.device_id.clone()) };

        // Check the conversation out of its mutex for the duration of the
        // chat engine's tool loop instead of holding the guard across it:
        // a `new-chat`/`change-role` tool call re-enters this same session
        // and `tokio::sync::Mutex` is not reentrant (§4.9, §4.10).
        let mut conversation = session.conversation.lock().await.take().expect("conversation hydrated by ensure_conversation");
        conversation.add(ChatMessage::new(MessageRole::User, user_text, turn_ms));

        let tools_guard = session.tools.lock().await;
        let synthesizer_for_stream = synthesizer.clone();
        let on_sentence: Arc<dyn Fn(String) + Send + Sync> = Arc::new(move |sentence: String| {
            synthesizer_for_stream.append_sentence(sentence, Some(turn_ms));
        });

        let result = self.chat_engine.chat_stream(&mut conversation, &tools_guard, &ctx, on_sentence).await;
        drop(tools_guard);

        if session.take_conversation_reset_requested() {
            conversation.clear();
        }

        match result {
            Ok(turn_result) => {
                if turn_result.rolled_back {
                    conversation.add(ChatMessage::rollback());
                    if let (Some(device), Some(store)) = (&device, &self.message_store) {
                        if let Err(err) = store.update_type(&device.device_id, role.role_id, turn_ms, MessageType::FunctionCall).await {
                            error!(%err, "failed to mark user turn as function_call");
                        }
                    }
                } else {
                    conversation.add(ChatMessage::new(MessageRole::Assistant, turn_result.final_response.clone(), turn_ms));
                }
                *session.conversation.lock().await = Some(conversation);

                if let (Some(device), Some(store)) = (&device, &self.message_store) {
                    let message_type = if turn_result.rolled_back { MessageType::FunctionCall } else { MessageType::Normal };
                    let message = ChatMessage::new(MessageRole::Assistant, turn_result.final_response, turn_ms).with_message_type(message_type);
                    let persisted = PersistedTurn { device_id: device.device_id.clone(), role_id: role.role_id, message };
                    if let Err(err) = store.add(persisted).await {
                        error!(%err, "failed to persist assistant turn");
                    }
                }
            }
            Err(err) => {
                error!(%err, "chat engine turn failed");
                *session.conversation.lock().await = Some(conversation);
                synthesizer.append_sentence(FALLBACK_APOLOGY, Some(turn_ms));
            }
        }

        synthesizer.set_last();
    }
}

/// Encode little-endian 16-bit PCM bytes as a mono WAV file.
fn write_wav_file(path: &std::path::Path, pcm: &[u8]) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: PCM_SAMPLE_RATE_HZ,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for chunk in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
    }
    writer.finalize()?;
    Ok(())
}

fn parse_iot_device(descriptor: &Value) -> IotDevice {
    let mut properties = HashMap::new();
    if let Some(props) = descriptor.get("properties").and_then(|v| v.as_object()) {
        for (name, def) in props {
            let value_type = def.get("type").and_then(|v| v.as_str()).unwrap_or("string").to_string();
            let description = def.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let value = def.get("value").cloned().unwrap_or(Value::Null);
            properties.insert(name.clone(), IotProperty { value_type, description, value });
        }
    }

    let mut methods = HashMap::new();
    if let Some(meths) = descriptor.get("methods").and_then(|v| v.as_object()) {
        for (name, def) in meths {
            let description = def.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            let parameters = def.get("parameters").cloned().unwrap_or_else(|| json!({"type": "object", "properties": {}}));
            methods.insert(name.clone(), IotMethod { description, parameters });
        }
    }

    IotDevice { properties, methods }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::chat_engine::ChatEngineConfig;

    #[test]
    fn detects_exit_intent_in_chinese_and_english() {
        assert!(detect_exit_intent("拜拜啦"));
        assert!(detect_exit_intent("ok goodbye"));
        assert!(!detect_exit_intent("今天天气怎么样"));
    }

    #[test]
    fn goodbye_template_is_always_from_the_configured_list() {
        for _ in 0..20 {
            assert!(GOODBYE_TEMPLATES.contains(&pick_goodbye_template()));
        }
    }

    #[test]
    fn non_empty_maps_blank_system_prompt_to_none() {
        assert_eq!(non_empty(""), None);
        assert_eq!(non_empty("be nice"), Some("be nice".to_string()));
    }

    #[test]
    fn parse_iot_device_reads_properties_and_methods() {
        let descriptor = json!({
            "name": "lamp",
            "properties": {"power": {"type": "boolean", "description": "on/off", "value": false}},
            "methods": {"turn_on": {"description": "turn on the lamp", "parameters": {"type": "object"}}}
        });
        let device = parse_iot_device(&descriptor);
        assert!(device.properties.contains_key("power"));
        assert!(device.methods.contains_key("turn_on"));
    }

    struct RecordingTransport {
        sent_json: Mutex<Vec<Value>>,
        sent_binary: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self { sent_json: Mutex::new(Vec::new()), sent_binary: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl ChannelTransport for RecordingTransport {
        async fn send_json(&self, value: Value) -> anyhow::Result<()> {
            self.sent_json.lock().await.push(value);
            Ok(())
        }
        async fn send_binary(&self, frame: Vec<u8>) -> anyhow::Result<()> {
            self.sent_binary.lock().await.push(frame);
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
    }

    impl RecordingTransport {
        async fn sent_json(&self) -> Vec<Value> {
            self.sent_json.lock().await.clone()
        }
    }

    #[tokio::test]
    async fn session_abort_dialog_is_idempotent_before_a_fresh_tts_stop_is_sent() {
        // Mirrors what `DialogueController::abort_dialogue` does: cancel the
        // dialog pair (Player::stop sets its `stopped` gate so the drain
        // loop emits no `stop` of its own), then send exactly one fresh
        // `tts stop` frame from the caller.
        let transport = Arc::new(RecordingTransport::new());
        let session = Session::new("s1", std::path::PathBuf::from("/tmp"));

        session.abort_dialog().await;
        session.abort_dialog().await; // idempotent: no dialog pair installed yet
        let _ = transport.send_json(json!({"type": "tts", "state": "stop"})).await;

        let frames = transport.sent_json().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["state"], "stop");
    }

    #[test]
    fn write_wav_file_round_trips_pcm_samples() {
        let dir = std::env::temp_dir().join(format!("xiaozhi-core-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("turn.wav");
        let pcm: Vec<u8> = vec![1, 0, 2, 0, 3, 0];

        write_wav_file(&path, &pcm).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, PCM_SAMPLE_RATE_HZ);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn capture_turn_audio_is_a_noop_without_an_installed_vad() {
        let session = Session::new("s1", std::path::PathBuf::from("/tmp"));
        let controller = test_controller();
        controller.capture_turn_audio(&session).await;
        assert!(session.last_capture.lock().await.is_none());
    }

    #[tokio::test]
    async fn on_speech_start_clears_stt_cancelled_after_a_barge_in_abort() {
        let session = Session::new("s1", std::path::PathBuf::from("/tmp"));
        session.stt_cancelled.store(true, Ordering::SeqCst);
        let transport: Arc<dyn ChannelTransport> = Arc::new(RecordingTransport::new());
        let closer: Arc<dyn SessionCloser> = Arc::new(NoopCloser);
        let controller = test_controller();

        controller.on_speech_start(&session, &transport, &closer).await;

        assert!(!session.stt_cancelled.load(Ordering::SeqCst));
    }

    struct NoopCloser;
    #[async_trait]
    impl SessionCloser for NoopCloser {
        async fn close_session(&self, _session_id: &str) {}
    }

    fn test_controller() -> Arc<DialogueController> {
        DialogueController::new(
            Arc::new(SttAdapterFactory::new(None)),
            Arc::new(TtsAdapterFactory::new(std::env::temp_dir())),
            Arc::new(ChatEngine::new(
                Arc::new(crate::agent::llm::OpenRouterClient::new("test-key".to_string())),
                ChatEngineConfig { model: "test".to_string(), max_iterations: 1, max_tokens: 1, temperature: 0.0 },
            )),
            None,
            Arc::new(OpusCodec::new().unwrap()),
            None,
            None,
            None,
            DialogueConfig::default(),
        )
    }
}
