//! Real-time dialogue core: protocol state machine, VAD, STT/TTS adapters,
//! sentence synthesis pipeline, tool dispatch, and conversation memory for
//! one IoT device session.
//!
//! The data flow for a single session is:
//!
//! ```text
//! device --bin(Opus)--> OpusCodec --PCM--> VadSegmenter --chunks--> SttAdapter --text-->
//!   DialogueController --user msg--> ChatEngine --tokens--> Sentencer --sentences--> Synthesizer --audio--> Player --Opus--> device
//!                                           \--tool_calls--> ToolRegistry (--> DeviceMcpBridge)
//! ```

pub mod opus;
pub mod vad;
pub mod stt;
pub mod tts;
pub mod sentencer;
pub mod memory;
pub mod tools;
pub mod mcp;
pub mod synthesizer;
pub mod player;
pub mod chat_engine;
pub mod session;
pub mod controller;
pub mod protocol;
pub mod config;
pub mod error;

pub use error::{DialogueError, DialogueResult};
pub use session::{Session, SessionRegistry, DeviceDescriptor, DeviceState, Role, IotDescriptor};
pub use protocol::ProtocolRouter;
