//! Xiaozhi Core - real-time IoT voice-assistant dialogue engine
//!
//! - `dialogue`: the protocol state machine, VAD, STT/TTS adapters, chat
//!   engine and MCP device tool bridge that make up the dialogue core
//! - `agent::llm`: the OpenAI-compatible chat-completion client the dialogue
//!   core's `ChatEngine` drives
//! - `security`: OS keyring-backed storage for the OpenRouter API key
//! - `server`: the axum WebSocket endpoint devices connect to
//!
//! # Example
//!
//! ```ignore
//! use xiaozhi_core::config::Config;
//! use xiaozhi_core::start_server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::load()?);
//!     start_server(config).await
//! }
//! ```

pub mod agent;
pub mod config;
pub mod security;
pub mod server;
pub mod dialogue;

pub use agent::llm::OpenRouterClient;
pub use config::Config;
pub use security::{delete_api_key, get_api_key, set_api_key};
pub use server::{start as start_server, ServerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - real-time IoT voice-assistant dialogue engine", NAME, VERSION)
}
