//! Typed error kinds for the dialogue core.
//!
//! Workers never let these cross a session boundary: callers translate a
//! `DialogueError` into either a user-visible TTS utterance or a logged,
//! silent drop. See `ChatEngine`/`Synthesizer` for the translation points.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DialogueError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("device not bound")]
    Unbound,

    #[error("provider transient error ({provider}): {message}")]
    ProviderTransient { provider: String, message: String },

    #[error("provider fatal error ({provider}): {message}")]
    ProviderFatal { provider: String, message: String },

    #[error("mcp request timed out")]
    McpTimeout,

    #[error("mcp error: {0}")]
    Mcp(String),

    #[error("vad error: {0}")]
    Vad(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DialogueResult<T> = Result<T, DialogueError>;
