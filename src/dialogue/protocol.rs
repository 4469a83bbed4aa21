//! Parses device text frames, dispatches to `DialogueController`, and owns
//! session lifecycle: binding, the inactivity watcher, and teardown (§A.4.13).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::dialogue::config::DialogueConfig;
use crate::dialogue::controller::{ChannelTransport, DialogueController, SessionCloser};
use crate::dialogue::mcp::DeviceMcpBridge;
use crate::dialogue::session::{DeviceState, DeviceStore, DeviceUpdate, RoleStore, Session, SessionRegistry};

const INACTIVITY_TICK: Duration = Duration::from_secs(10);

/// Fixed outbound audio parameters echoed on every `hello` reply (§6.1).
fn audio_params() -> Value {
    json!({"channels": 1, "format": "opus", "sample_rate": 16000, "frame_duration": 60})
}

pub struct ProtocolRouter {
    registry: Arc<SessionRegistry>,
    controller: Arc<DialogueController>,
    device_store: Option<Arc<dyn DeviceStore>>,
    role_store: Option<Arc<dyn RoleStore>>,
    config: DialogueConfig,
    /// Dedupes verification-code issuance while a hardware device remains
    /// unbound (§7 Binding).
    captcha_in_progress: Mutex<HashSet<String>>,
}

impl ProtocolRouter {
    pub fn new(
        controller: Arc<DialogueController>,
        device_store: Option<Arc<dyn DeviceStore>>,
        role_store: Option<Arc<dyn RoleStore>>,
        config: DialogueConfig,
    ) -> Arc<Self> {
        let router = Arc::new(Self {
            registry: SessionRegistry::new(),
            controller,
            device_store,
            role_store,
            config,
            captcha_in_progress: Mutex::new(HashSet::new()),
        });
        router.clone().spawn_inactivity_watcher();
        router
    }

    fn spawn_inactivity_watcher(self: Arc<Self>) {
        if !self.config.check_inactive_session {
            return;
        }
        let timeout_ms = (self.config.inactive_timeout_seconds * 1000) as i64;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(INACTIVITY_TICK);
            loop {
                ticker.tick().await;
                for session in self.registry.all().await {
                    if session.idle_for_ms() <= timeout_ms {
                        continue;
                    }
                    warn!(session_id = %session.session_id, "session idle timeout, closing");
                    self.close_session(&session.session_id).await;
                }
            }
        });
    }

    /// Register a newly-accepted channel and return its `Session`. The
    /// caller's transport/reader loop drives `handle_text`/`handle_binary`
    /// until the channel closes.
    pub async fn accept(self: &Arc<Self>) -> Arc<Session> {
        let session = Session::new(uuid::Uuid::new_v4().to_string(), self.config.audio_path.clone());
        self.registry.insert(session.clone()).await;
        self.controller.register_builtin_tools(&session).await;
        info!(session_id = %session.session_id, "session accepted");
        session
    }

    pub async fn handle_binary(self: &Arc<Self>, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>, frame: &[u8]) {
        let closer: Arc<dyn SessionCloser> = self.clone();
        self.controller.process_audio_data(session, transport, &closer, frame).await;
    }

    pub async fn handle_text(self: &Arc<Self>, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>, raw: &str, device_id: Option<&str>) {
        let frame: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "dropping malformed text frame");
                return;
            }
        };
        let Some(frame_type) = frame.get("type").and_then(|v| v.as_str()) else {
            warn!("dropping text frame with no type discriminator");
            return;
        };

        let closer: Arc<dyn SessionCloser> = self.clone();

        match frame_type {
            "hello" => self.handle_hello(session, transport, &frame, device_id).await,
            "listen" => {
                if !self.ensure_bound(session, transport).await {
                    return;
                }
                let state = frame.get("state").and_then(|v| v.as_str()).unwrap_or("");
                let text = frame.get("text").and_then(|v| v.as_str());
                self.controller.handle_listen(session, transport, &closer, state, text).await;
            }
            "iot" => {
                if !self.ensure_bound(session, transport).await {
                    return;
                }
                self.controller.handle_iot(session, transport, &frame).await;
            }
            "abort" => {
                let reason = frame.get("reason").and_then(|v| v.as_str()).unwrap_or("client");
                self.controller.abort_dialogue(session, transport, reason).await;
            }
            "goodbye" => {
                self.controller.handle_goodbye(session, transport, &closer).await;
            }
            "mcp" => {
                if let Some(payload) = frame.get("payload").cloned() {
                    self.controller.handle_mcp(session, payload).await;
                }
            }
            other => {
                warn!(frame_type = other, "dropping text frame with unknown type");
            }
        }
    }

    async fn handle_hello(&self, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>, frame: &Value, device_id: Option<&str>) {
        session.touch();
        let _ = transport
            .send_json(json!({
                "type": "hello",
                "transport": "websocket",
                "session_id": session.session_id,
                "audio_params": audio_params(),
            }))
            .await;

        if let Some(device_id) = device_id {
            self.bind_device(session, transport, device_id).await;
        }

        let wants_mcp = frame.pointer("/features/mcp").and_then(|v| v.as_bool()).unwrap_or(false);
        if wants_mcp {
            self.initialize_mcp(session, transport).await;
        }
    }

    async fn initialize_mcp(&self, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>) {
        let mcp_transport = self.controller.mcp_transport(transport.clone(), &session.session_id);
        let bridge = Arc::new(DeviceMcpBridge::new(mcp_transport, self.config.mcp_max_tools_count, self.config.server_domain.clone(), self.config.server_port));
        *session.mcp.lock().await = Some(bridge.clone());

        match bridge.initialize(&session.session_id).await {
            Ok(()) => self.controller.register_mcp_tools(session).await,
            Err(err) => error!(session_id = %session.session_id, %err, "mcp initialize failed"),
        }
    }

    /// Attempt to bind `device_id` to this session: reuse the persisted
    /// device/role if known, auto-bind a virtual device, or start the
    /// verification-code subflow for an unknown hardware device (§7).
    async fn bind_device(&self, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>, device_id: &str) {
        let Some(device_store) = &self.device_store else { return };

        match device_store.by_id(device_id).await {
            Ok(Some(device)) => {
                if let Some(evicted) = self.registry.bind_device(device_id, &session.session_id).await {
                    info!(device_id, evicted_session = %evicted.session_id, "device rebound, closing earlier session");
                    self.close_session(&evicted.session_id).await;
                }
                self.load_role(session, device.role_id).await;
                session.set_device(Some(device)).await;
                self.captcha_in_progress.lock().await.remove(device_id);
            }
            Ok(None) if device_id.starts_with("user_chat_") => {
                let device = crate::dialogue::session::DeviceDescriptor {
                    device_id: device_id.to_string(),
                    user_id: 0,
                    role_id: 0,
                    device_type: "virtual".to_string(),
                    state: DeviceState::Online,
                };
                if let Err(err) = device_store.add(device.clone()).await {
                    error!(device_id, %err, "failed to auto-register virtual device");
                    return;
                }
                self.registry.bind_device(device_id, &session.session_id).await;
                session.set_device(Some(device)).await;
            }
            Ok(None) => {
                let mut in_progress = self.captcha_in_progress.lock().await;
                if in_progress.contains(device_id) {
                    return;
                }
                in_progress.insert(device_id.to_string());
                drop(in_progress);
                self.issue_verification_code(session, transport, device_id).await;
            }
            Err(err) => error!(device_id, %err, "device lookup failed"),
        }
    }

    async fn issue_verification_code(&self, session: &Arc<Session>, transport: &Arc<dyn ChannelTransport>, device_id: &str) {
        let Some(device_store) = &self.device_store else { return };
        match device_store.generate_code(device_id, &session.session_id, "hardware").await {
            Ok(code) => {
                let spoken = code.chars().map(|c| c.to_string()).collect::<Vec<_>>().join(" ");
                let _ = transport
                    .send_json(json!({"type": "tts", "state": "sentence_start", "text": format!("请说出校验码 {spoken}")}))
                    .await;
            }
            Err(err) => error!(device_id, %err, "failed to generate verification code"),
        }
    }

    async fn load_role(&self, session: &Arc<Session>, role_id: i64) {
        let Some(role_store) = &self.role_store else { return };
        match role_store.by_id(role_id).await {
            Ok(Some(role)) => session.set_role(role).await,
            Ok(None) => warn!(role_id, "role not found, keeping default"),
            Err(err) => error!(role_id, %err, "failed to load role"),
        }
    }

    /// §7 Binding: block further listen/iot processing until a device is
    /// bound (session.device is set).
    async fn ensure_bound(&self, session: &Arc<Session>, _transport: &Arc<dyn ChannelTransport>) -> bool {
        session.device.read().await.is_some()
    }
}

#[async_trait]
impl SessionCloser for ProtocolRouter {
    /// Full teardown per §4.13's "Any → on channel close" transition: remove
    /// from the registry, tear down the dialog pair, clear memory, and
    /// persist the device-state transition.
    async fn close_session(&self, session_id: &str) {
        let Some(session) = self.registry.remove(session_id).await else { return };
        session.abort_dialog().await;
        session.vad.lock().await.take();
        session.audio_tx.lock().await.take();
        session.conversation.lock().await.take();
        session.mcp.lock().await.take();

        if let (Some(device), Some(store)) = (session.device.read().await.clone(), &self.device_store) {
            self.captcha_in_progress.lock().await.remove(&device.device_id);
            let new_state = if matches!(device.state, DeviceState::Online) { DeviceState::Standby } else { DeviceState::Offline };
            if let Err(err) = store.update(&device.device_id, DeviceUpdate { role_id: None, state: Some(new_state) }).await {
                error!(device_id = %device.device_id, %err, "failed to persist device state transition on session close");
            }
        }
        info!(session_id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::chat_engine::{ChatEngine, ChatEngineConfig};
    use crate::dialogue::opus::OpusCodec;
    use crate::dialogue::session::{DeviceDescriptor, ProviderConfig};
    use crate::dialogue::stt::SttAdapterFactory;
    use crate::dialogue::tts::TtsAdapterFactory;
    use tokio::sync::RwLock;

    fn test_config() -> DialogueConfig {
        DialogueConfig { check_inactive_session: false, ..Default::default() }
    }

    struct RecordingTransport {
        sent_json: Mutex<Vec<Value>>,
    }
    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent_json: Mutex::new(Vec::new()) })
        }
    }
    #[async_trait]
    impl ChannelTransport for RecordingTransport {
        async fn send_json(&self, value: Value) -> anyhow::Result<()> {
            self.sent_json.lock().await.push(value);
            Ok(())
        }
        async fn send_binary(&self, _frame: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
    }

    struct FakeDeviceStore {
        devices: RwLock<std::collections::HashMap<String, DeviceDescriptor>>,
    }
    #[async_trait]
    impl DeviceStore for FakeDeviceStore {
        async fn by_id(&self, device_id: &str) -> anyhow::Result<Option<DeviceDescriptor>> {
            Ok(self.devices.read().await.get(device_id).cloned())
        }
        async fn update(&self, device_id: &str, update: DeviceUpdate) -> anyhow::Result<()> {
            if let Some(device) = self.devices.write().await.get_mut(device_id) {
                if let Some(state) = update.state {
                    device.state = state;
                }
            }
            Ok(())
        }
        async fn add(&self, device: DeviceDescriptor) -> anyhow::Result<()> {
            self.devices.write().await.insert(device.device_id.clone(), device);
            Ok(())
        }
        async fn generate_code(&self, _device_id: &str, _session_id: &str, _device_type: &str) -> anyhow::Result<String> {
            Ok("1234".to_string())
        }
    }

    async fn test_router(device_store: Option<Arc<dyn DeviceStore>>) -> Arc<ProtocolRouter> {
        let stt_factory = Arc::new(SttAdapterFactory::new(None));
        let tts_factory = Arc::new(TtsAdapterFactory::new(std::env::temp_dir()));
        let client = Arc::new(crate::agent::llm::OpenRouterClient::new("test-key".to_string()));
        let chat_engine = Arc::new(ChatEngine::new(
            client,
            ChatEngineConfig { model: "test".to_string(), max_iterations: 4, max_tokens: 512, temperature: 0.7 },
        ));
        let codec = Arc::new(OpusCodec::new().expect("codec init"));
        // No `vad_model_path` configured in these tests: VAD stays disabled.
        let controller = DialogueController::new(stt_factory, tts_factory, chat_engine, None, codec, None, None, None, test_config());
        ProtocolRouter::new(controller, device_store, None, test_config())
    }

    #[derive(Default)]
    struct NoProviderConfigs;
    #[async_trait]
    impl crate::dialogue::session::ConfigStore for NoProviderConfigs {
        async fn by_id(&self, _id: i64) -> anyhow::Result<Option<ProviderConfig>> {
            Ok(None)
        }
        async fn by_model_type(&self, _kind: &str) -> anyhow::Result<Vec<ProviderConfig>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn closing_an_unknown_session_is_a_noop() {
        let router = ProtocolRouter::new(
            DialogueController::new(
                Arc::new(SttAdapterFactory::new(None)),
                Arc::new(TtsAdapterFactory::new(std::env::temp_dir())),
                Arc::new(ChatEngine::new(
                    Arc::new(crate::agent::llm::OpenRouterClient::new("k".to_string())),
                    ChatEngineConfig { model: "m".to_string(), max_iterations: 1, max_tokens: 1, temperature: 0.0 },
                )),
                None,
                Arc::new(OpusCodec::new().unwrap()),
                None,
                None,
                None,
                test_config(),
            ),
            None,
            None,
            test_config(),
        );
        router.close_session("no-such-session").await;
    }

    #[tokio::test]
    async fn virtual_device_auto_binds_on_hello() {
        let store: Arc<dyn DeviceStore> = Arc::new(FakeDeviceStore { devices: RwLock::new(std::collections::HashMap::new()) });
        let router = test_router(Some(store.clone())).await;
        let transport = RecordingTransport::new();
        let session = router.accept().await;

        router.bind_device(&session, &(transport.clone() as Arc<dyn ChannelTransport>), "user_chat_42").await;

        assert!(session.device.read().await.is_some());
        assert!(store.by_id("user_chat_42").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_hardware_device_triggers_verification_code_once() {
        let store: Arc<dyn DeviceStore> = Arc::new(FakeDeviceStore { devices: RwLock::new(std::collections::HashMap::new()) });
        let router = test_router(Some(store)).await;
        let transport = RecordingTransport::new();
        let session = router.accept().await;

        let transport_dyn: Arc<dyn ChannelTransport> = transport.clone();
        router.bind_device(&session, &transport_dyn, "AA:BB:CC:DD:EE:FF").await;
        router.bind_device(&session, &transport_dyn, "AA:BB:CC:DD:EE:FF").await;

        assert!(session.device.read().await.is_none());
        // Second attempt is deduped by `captcha_in_progress`: only one
        // verification-code frame is sent.
        assert_eq!(transport.sent_json.lock().await.len(), 1);
    }
}
