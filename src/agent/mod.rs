//! Agent module: the OpenAI-compatible LLM client used by the dialogue core's
//! `ChatEngine` (`crate::dialogue::chat_engine`) to drive chat completions.

pub mod llm;
