//! Per-connection session state and the registry that enforces one live
//! session per device (§A.3 Session/DeviceDescriptor/Role/IotDescriptor,
//! invariant 1).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::TimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::info;

use crate::dialogue::mcp::DeviceMcpBridge;
use crate::dialogue::memory::{ChatMessage, Conversation};
use crate::dialogue::player::Player;
use crate::dialogue::synthesizer::Synthesizer;
use crate::dialogue::tools::ToolRegistry;
use crate::dialogue::vad::VadSegmenter;

/// `{0: offline, 1: online, 2: standby}` (§3 DeviceDescriptor.state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Offline = 0,
    Online = 1,
    Standby = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// MAC-format for hardware devices, `user_chat_<uid>` for virtual ones.
    pub device_id: String,
    pub user_id: i64,
    pub role_id: i64,
    pub device_type: String,
    pub state: DeviceState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadThresholdsConfig {
    pub speech_th: f32,
    pub silence_th: f32,
    pub energy_th: f32,
    pub silence_timeout_ms: u64,
}

impl Default for VadThresholdsConfig {
    fn default() -> Self {
        Self { speech_th: 0.4, silence_th: 0.3, energy_th: 0.001, silence_timeout_ms: 800 }
    }
}

/// Snapshot of a role's dialogue-relevant configuration, bound to the
/// session at hello time (§3 Role entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub role_id: i64,
    pub llm_config_id: Option<i64>,
    pub stt_config_id: Option<i64>,
    pub tts_config_id: Option<i64>,
    pub voice_name: String,
    pub tts_pitch: f32,
    pub tts_speed: f32,
    pub temperature: f32,
    pub top_p: f32,
    pub vad: VadThresholdsConfig,
    pub memory_type: String,
    pub system_prompt: String,
}

impl Default for Role {
    fn default() -> Self {
        Self {
            role_id: 0,
            llm_config_id: None,
            stt_config_id: None,
            tts_config_id: None,
            voice_name: crate::dialogue::tts::DEFAULT_VOICE.to_string(),
            tts_pitch: 1.0,
            tts_speed: 1.0,
            temperature: 0.7,
            top_p: 1.0,
            vad: VadThresholdsConfig::default(),
            memory_type: "window".to_string(),
            system_prompt: String::new(),
        }
    }
}

/// `name → {properties, methods}` (§3 IotDescriptor), session-scoped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IotDescriptor {
    pub devices: HashMap<String, IotDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IotDevice {
    #[serde(default)]
    pub properties: HashMap<String, IotProperty>,
    #[serde(default)]
    pub methods: HashMap<String, IotMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IotProperty {
    #[serde(rename = "type")]
    pub value_type: String,
    pub description: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IotMethod {
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// One live device connection. Owns at most one `Synthesizer`/`Player`
/// pair at a time (§3 invariant: both are cancelled before a replacement
/// pair is installed).
pub struct Session {
    pub session_id: String,
    pub device: RwLock<Option<DeviceDescriptor>>,
    pub role: RwLock<Role>,
    pub iot: RwLock<IotDescriptor>,
    pub streaming: AtomicBool,
    pub mode: RwLock<SessionMode>,
    close_after_chat: AtomicBool,
    in_wakeup_response: AtomicBool,
    last_activity: AtomicI64,
    assistant_time_ms: AtomicI64,
    pub synthesizer: Mutex<Option<Arc<Synthesizer>>>,
    pub player: Mutex<Option<Arc<Player>>>,
    pub mcp: Mutex<Option<Arc<DeviceMcpBridge>>>,
    pub audio_root: PathBuf,
    /// Per-session VAD segmenter, installed by `listen.start` and torn down
    /// on `listen.stop`/`abort`/`goodbye` (§4.12 DialogueController routes).
    pub vad: Mutex<Option<VadSegmenter>>,
    /// Sender half of the current STT worker's audio stream; dropping it
    /// is the stream-close sentinel the worker's `stream_recognize` waits on.
    pub audio_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Memory-window conversation, lazily hydrated from the `MessageStore`
    /// on first bind.
    pub conversation: Mutex<Option<Conversation>>,
    /// Session-scoped tool table: built-in + iot + mcp (§4.9).
    pub tools: Mutex<ToolRegistry>,
    /// Snapshot of the PCM captured for the most recently ended speech
    /// segment, taken at SPEECH_END before the VAD segmenter's own buffer
    /// can be cleared by the next SPEECH_START (§4.12, §6.3).
    pub last_capture: Mutex<Option<Vec<u8>>>,
    /// Set by `abort_dialogue`/`handle_goodbye` to tell an in-flight STT
    /// task spawned by `on_speech_start` to drop its result instead of
    /// finalizing a turn for speech that was just cancelled. Cleared again
    /// when the next speech segment starts (§4.12, §5 Cancellation).
    pub stt_cancelled: AtomicBool,
    /// Set by the `new-chat`/`change-role` built-in tools (§4.9) to ask
    /// `DialogueController::finalize_turn` to clear the conversation once
    /// the chat engine's tool loop returns. The tools cannot clear
    /// `conversation` directly: `finalize_turn` has it checked out for the
    /// duration of the loop, and `conversation`'s mutex is not reentrant.
    conversation_reset_pending: AtomicBool,
    /// Sync mirror of `device`/`role`'s identifying fields, kept in step by
    /// `set_device`/`set_role` so `PlayerSessionHooks::assistant_audio_path`
    /// (a non-async trait method) can read them without blocking on the
    /// async `RwLock`s.
    device_id_cache: std::sync::Mutex<Option<String>>,
    role_id_cache: AtomicI64,
    created_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Auto,
    Manual,
    Realtime,
}

impl Session {
    pub fn new(session_id: impl Into<String>, audio_root: PathBuf) -> Arc<Self> {
        let now_ms = now_millis();
        Arc::new(Self {
            session_id: session_id.into(),
            device: RwLock::new(None),
            role: RwLock::new(Role::default()),
            iot: RwLock::new(IotDescriptor::default()),
            streaming: AtomicBool::new(false),
            mode: RwLock::new(SessionMode::Auto),
            close_after_chat: AtomicBool::new(false),
            in_wakeup_response: AtomicBool::new(false),
            last_activity: AtomicI64::new(now_ms),
            assistant_time_ms: AtomicI64::new(0),
            synthesizer: Mutex::new(None),
            player: Mutex::new(None),
            mcp: Mutex::new(None),
            audio_root,
            vad: Mutex::new(None),
            audio_tx: Mutex::new(None),
            conversation: Mutex::new(None),
            tools: Mutex::new(ToolRegistry::new()),
            last_capture: Mutex::new(None),
            stt_cancelled: AtomicBool::new(false),
            conversation_reset_pending: AtomicBool::new(false),
            device_id_cache: std::sync::Mutex::new(None),
            role_id_cache: AtomicI64::new(0),
            created_at: Instant::now(),
        })
    }

    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::SeqCst);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    pub fn idle_for_ms(&self) -> i64 {
        now_millis() - self.last_activity_ms()
    }

    pub fn set_close_after_chat(&self) {
        self.close_after_chat.store(true, Ordering::SeqCst);
    }

    pub fn close_after_chat(&self) -> bool {
        self.close_after_chat.load(Ordering::SeqCst)
    }

    pub fn set_in_wakeup_response(&self, value: bool) {
        self.in_wakeup_response.store(value, Ordering::SeqCst);
    }

    pub fn in_wakeup_response(&self) -> bool {
        self.in_wakeup_response.load(Ordering::SeqCst)
    }

    /// Ask the next `finalize_turn` to clear conversation history once its
    /// chat engine call returns (§4.9 `new-chat`/`change-role`).
    pub fn request_conversation_reset(&self) {
        self.conversation_reset_pending.store(true, Ordering::SeqCst);
    }

    /// Consume the pending-reset request, if any.
    pub fn take_conversation_reset_requested(&self) -> bool {
        self.conversation_reset_pending.swap(false, Ordering::SeqCst)
    }

    /// Freeze a new turn's timestamp. Every persisted row for this turn
    /// uses the returned value (§3 invariant 5).
    pub fn begin_turn(&self) -> i64 {
        let t = now_millis();
        self.assistant_time_ms.store(t, Ordering::SeqCst);
        t
    }

    pub fn assistant_time_ms(&self) -> i64 {
        self.assistant_time_ms.load(Ordering::SeqCst)
    }

    /// `{audio_root}/{device_id_sanitized}/{role_id}/{isoTimestampNoColons}-{who}.{ext}`
    /// (§6.3). `who` is `"user"` or `"assistant"`; `ext` is `"wav"` or `"opus"`.
    pub fn audio_path(&self, device_id: &str, role_id: i64, time_ms: i64, who: &str, ext: &str) -> PathBuf {
        let device_dir = sanitize_path_component(device_id);
        let ts = chrono::Utc
            .timestamp_millis_opt(time_ms)
            .single()
            .unwrap_or_else(chrono::Utc::now)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            .replace(':', "");
        self.audio_root
            .join(device_dir)
            .join(role_id.to_string())
            .join(format!("{ts}-{who}.{ext}"))
    }

    /// Bind a device, keeping the sync cache in step for
    /// `assistant_audio_path`.
    pub async fn set_device(&self, device: Option<DeviceDescriptor>) {
        *self.device_id_cache.lock().unwrap() = device.as_ref().map(|d| d.device_id.clone());
        *self.device.write().await = device;
    }

    /// Bind a role, keeping the sync cache in step for
    /// `assistant_audio_path`.
    pub async fn set_role(&self, role: Role) {
        self.role_id_cache.store(role.role_id, Ordering::SeqCst);
        *self.role.write().await = role;
    }

    /// The path for the assistant's synthesized reply audio, using whatever
    /// device/role was bound most recently (§6.3). Falls back to a device id
    /// of `"unbound"` if no device has bound yet (text-only/unbound turns).
    pub fn assistant_audio_path(&self, time_ms: i64, ext: &str) -> PathBuf {
        let device_id = self.device_id_cache.lock().unwrap().clone().unwrap_or_else(|| "unbound".to_string());
        let role_id = self.role_id_cache.load(Ordering::SeqCst);
        self.audio_path(&device_id, role_id, time_ms, "assistant", ext)
    }

    /// Cancel and drop any existing Synthesizer/Player before a fresh
    /// pair replaces them.
    pub async fn replace_dialog_pair(&self, synthesizer: Arc<Synthesizer>, player: Arc<Player>) {
        if let Some(old) = self.synthesizer.lock().await.take() {
            old.cancel();
        }
        if let Some(old) = self.player.lock().await.take() {
            old.stop().await;
        }
        player.set_dialog_status(synthesizer.clone()).await;
        *self.synthesizer.lock().await = Some(synthesizer);
        *self.player.lock().await = Some(player);
    }

    pub async fn abort_dialog(&self) {
        if let Some(s) = self.synthesizer.lock().await.as_ref() {
            s.cancel();
        }
        if let Some(p) = self.player.lock().await.as_ref() {
            p.stop().await;
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Replace anything but alphanumerics/`-`/`_` with `_`, so a MAC-format
/// device id (`aa:bb:cc:dd:ee:ff`) is safe to use as a path component.
fn sanitize_path_component(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Registry of live sessions. Enforces invariant 1: a device id maps to at
/// most one live session; a later `bind` evicts the earlier session for
/// that device.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    device_index: RwLock<HashMap<String, String>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, session: Arc<Session>) {
        self.sessions.write().await.insert(session.session_id.clone(), session);
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Bind `device_id` to `session_id`, evicting whatever session was
    /// previously bound to that device (returned so the caller can close
    /// it) (§3 invariant 1).
    pub async fn bind_device(&self, device_id: &str, session_id: &str) -> Option<Arc<Session>> {
        let previous_session_id = {
            let mut index = self.device_index.write().await;
            index.insert(device_id.to_string(), session_id.to_string())
        };
        let Some(previous_session_id) = previous_session_id else { return None };
        if previous_session_id == session_id {
            return None;
        }
        let sessions = self.sessions.read().await;
        let evicted = sessions.get(&previous_session_id).cloned();
        if evicted.is_some() {
            info!(device_id, evicted_session = %previous_session_id, new_session = session_id, "device rebound, evicting earlier session");
        }
        evicted
    }

    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(session_id);
        if removed.is_some() {
            let mut index = self.device_index.write().await;
            index.retain(|_, sid| sid != session_id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }
}

// ---------------------------------------------------------------------
// Persistence boundary traits (§6.2). These are deliberately opaque: the
// core only needs the shapes below, never the concrete row format used by
// whatever HTTP/DB layer owns config, device, role and message rows.
// ---------------------------------------------------------------------

/// One model/voice/provider record as handed back by `ConfigStore`
/// (§3 Role entity's `llm_config_id`/`stt_config_id`/`tts_config_id`).
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub id: i64,
    pub provider: String,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub app_id: Option<String>,
    pub ak: Option<String>,
    pub sk: Option<String>,
    pub config_name: String,
    pub model_type: String,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn by_id(&self, id: i64) -> anyhow::Result<Option<ProviderConfig>>;
    async fn by_model_type(&self, kind: &str) -> anyhow::Result<Vec<ProviderConfig>>;
}

/// Partial update applied to a persisted device row.
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub role_id: Option<i64>,
    pub state: Option<DeviceState>,
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn by_id(&self, device_id: &str) -> anyhow::Result<Option<DeviceDescriptor>>;
    async fn update(&self, device_id: &str, update: DeviceUpdate) -> anyhow::Result<()>;
    async fn add(&self, device: DeviceDescriptor) -> anyhow::Result<()>;
    /// Issue (and persist) a one-shot verification code for an unbound
    /// hardware device, returning the code to be read back as audio.
    async fn generate_code(&self, device_id: &str, session_id: &str, device_type: &str) -> anyhow::Result<String>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn by_id(&self, role_id: i64) -> anyhow::Result<Option<Role>>;
    async fn query(&self, user_id: i64) -> anyhow::Result<Vec<Role>>;
}

/// One turn ready to be appended to persisted chat history
/// (§6.2 `MessageStore.add`).
#[derive(Debug, Clone)]
pub struct PersistedTurn {
    pub device_id: String,
    pub role_id: i64,
    pub message: ChatMessage,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn add(&self, turn: PersistedTurn) -> anyhow::Result<()>;
    async fn update_type(&self, device_id: &str, role_id: i64, time_ms: i64, message_type: crate::dialogue::memory::MessageType) -> anyhow::Result<()>;
    async fn update_audio_path(&self, device_id: &str, role_id: i64, time_ms: i64, audio_path: &str) -> anyhow::Result<()>;
    async fn find(&self, device_id: &str, role_id: i64, limit: usize) -> anyhow::Result<Vec<ChatMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binding_a_device_twice_evicts_the_earlier_session() {
        let registry = SessionRegistry::new();
        let s1 = Session::new("s1", PathBuf::from("/tmp"));
        let s2 = Session::new("s2", PathBuf::from("/tmp"));
        registry.insert(s1.clone()).await;
        registry.insert(s2.clone()).await;

        let evicted = registry.bind_device("dev-1", "s1").await;
        assert!(evicted.is_none());
        let evicted = registry.bind_device("dev-1", "s2").await;
        assert_eq!(evicted.unwrap().session_id, "s1");
    }

    #[tokio::test]
    async fn removing_a_session_clears_its_device_binding() {
        let registry = SessionRegistry::new();
        let s1 = Session::new("s1", PathBuf::from("/tmp"));
        registry.insert(s1.clone()).await;
        registry.bind_device("dev-1", "s1").await;
        registry.remove("s1").await;
        let evicted = registry.bind_device("dev-1", "s1").await;
        assert!(evicted.is_none());
    }

    #[test]
    fn begin_turn_freezes_assistant_time() {
        let session = Session::new("s1", PathBuf::from("/tmp"));
        let t1 = session.begin_turn();
        assert_eq!(session.assistant_time_ms(), t1);
    }

    #[test]
    fn audio_path_nests_device_role_and_timestamp() {
        let session = Session::new("s1", PathBuf::from("/audio"));
        let path = session.audio_path("AA:BB:CC:DD:EE:FF", 7, 1_700_000_000_000, "user", "wav");
        let path = path.to_string_lossy();
        assert!(path.starts_with("/audio/AA_BB_CC_DD_EE_FF/7/"));
        assert!(path.ends_with("-user.wav"));
        assert!(!path.contains(':'));
    }

    #[tokio::test]
    async fn assistant_audio_path_falls_back_to_unbound_device() {
        let session = Session::new("s1", PathBuf::from("/audio"));
        let path = session.assistant_audio_path(1_700_000_000_000, "wav");
        assert!(path.to_string_lossy().contains("/unbound/0/"));
    }

    #[tokio::test]
    async fn set_device_and_set_role_update_the_sync_cache() {
        let session = Session::new("s1", PathBuf::from("/audio"));
        session
            .set_device(Some(DeviceDescriptor {
                device_id: "dev-1".to_string(),
                user_id: 1,
                role_id: 9,
                device_type: "hardware".to_string(),
                state: DeviceState::Online,
            }))
            .await;
        session.set_role(Role { role_id: 9, ..Role::default() }).await;

        let path = session.assistant_audio_path(1_700_000_000_000, "wav");
        assert!(path.to_string_lossy().contains("/dev-1/9/"));
    }
}
