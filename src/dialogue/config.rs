//! Configuration surface enumerated for the dialogue core (§A.6).
//!
//! Merged into the crate-wide `Config` as `Config::dialogue`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    /// Root directory for generated audio artifacts.
    #[serde(default = "default_audio_path")]
    pub audio_path: PathBuf,

    /// Whether to reap idle sessions.
    #[serde(default = "default_true")]
    pub check_inactive_session: bool,
    #[serde(default = "default_inactive_timeout")]
    pub inactive_timeout_seconds: u64,

    #[serde(default = "default_tts_timeout_ms")]
    pub tts_timeout_ms: u64,
    #[serde(default = "default_tts_max_retry_count")]
    pub tts_max_retry_count: u32,
    #[serde(default = "default_tts_retry_delay_ms")]
    pub tts_retry_delay_ms: u64,
    #[serde(default = "default_tts_max_concurrent_per_session")]
    pub tts_max_concurrent_per_session: usize,

    #[serde(default = "default_vad_prebuffer_ms")]
    pub vad_prebuffer_ms: u64,
    #[serde(default = "default_vad_tail_keep_ms")]
    pub vad_tail_keep_ms: u64,
    #[serde(default)]
    pub vad_audio_enhancement_enabled: bool,

    #[serde(default = "default_mcp_max_tools_count")]
    pub mcp_max_tools_count: usize,

    #[serde(default = "default_websocket_path")]
    pub websocket_path: String,
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub server_domain: Option<String>,

    #[serde(default)]
    pub vosk_model_path: Option<PathBuf>,
    #[serde(default)]
    pub vad_model_path: Option<PathBuf>,

    /// Memory window default size (user+assistant pairs).
    #[serde(default = "default_max_window_messages")]
    pub max_window_messages: usize,
}

fn default_audio_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("xiaozhi-core")
        .join("audio")
}
fn default_true() -> bool { true }
fn default_inactive_timeout() -> u64 { 20 }
fn default_tts_timeout_ms() -> u64 { 60_000 }
fn default_tts_max_retry_count() -> u32 { 1 }
fn default_tts_retry_delay_ms() -> u64 { 1000 }
fn default_tts_max_concurrent_per_session() -> usize { 1 }
fn default_vad_prebuffer_ms() -> u64 { 500 }
fn default_vad_tail_keep_ms() -> u64 { 300 }
fn default_mcp_max_tools_count() -> usize { 32 }
fn default_websocket_path() -> String { "/xiaozhi/v1/".to_string() }
fn default_server_host() -> String { "0.0.0.0".to_string() }
fn default_server_port() -> u16 { 8000 }
fn default_max_window_messages() -> usize { 16 }

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            audio_path: default_audio_path(),
            check_inactive_session: default_true(),
            inactive_timeout_seconds: default_inactive_timeout(),
            tts_timeout_ms: default_tts_timeout_ms(),
            tts_max_retry_count: default_tts_max_retry_count(),
            tts_retry_delay_ms: default_tts_retry_delay_ms(),
            tts_max_concurrent_per_session: default_tts_max_concurrent_per_session(),
            vad_prebuffer_ms: default_vad_prebuffer_ms(),
            vad_tail_keep_ms: default_vad_tail_keep_ms(),
            vad_audio_enhancement_enabled: false,
            mcp_max_tools_count: default_mcp_max_tools_count(),
            websocket_path: default_websocket_path(),
            server_host: default_server_host(),
            server_port: default_server_port(),
            server_domain: None,
            vosk_model_path: None,
            vad_model_path: None,
            max_window_messages: default_max_window_messages(),
        }
    }
}
