//! Sliding-window conversation memory with rollback (§A.3, §A.4.8, §C.3/§C.4).

use crate::agent::llm::{ChatMessage as LlmChatMessage, ToolCall};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Normal,
    FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub time_ms: i64,
    pub audio_path: Option<String>,
    pub message_type: MessageType,
}

/// A single turn in a `Conversation` (§3 ChatMessage entity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: Option<String>,
    pub name: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
    pub metadata: MessageMetadata,
}

/// Sentinel compared by content+role, not a side-channel flag — rollback
/// removes the most recently added entry (§C.3).
const ROLLBACK_SENTINEL: &str = "__rollback__";

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, time_ms: i64) -> Self {
        Self {
            role,
            content: Some(content.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            metadata: MessageMetadata { time_ms, audio_path: None, message_type: MessageType::Normal },
        }
    }

    pub fn rollback() -> Self {
        Self {
            role: MessageRole::System,
            content: Some(ROLLBACK_SENTINEL.to_string()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            metadata: MessageMetadata { time_ms: 0, audio_path: None, message_type: MessageType::Normal },
        }
    }

    fn is_rollback(&self) -> bool {
        self.role == MessageRole::System && self.content.as_deref() == Some(ROLLBACK_SENTINEL)
    }

    pub fn with_audio_path(mut self, path: impl Into<String>) -> Self {
        self.metadata.audio_path = Some(path.into());
        self
    }

    pub fn with_message_type(mut self, t: MessageType) -> Self {
        self.metadata.message_type = t;
        self
    }

    /// Render for the chat-model request payload.
    pub fn to_llm_message(&self) -> LlmChatMessage {
        LlmChatMessage {
            role: Some(Value::String(self.role.as_str().to_string())),
            content: self.content.as_ref().map(|c| Value::String(c.clone())),
            reasoning_details: None,
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
            name: self.name.clone(),
            reasoning: None,
            refusal: None,
        }
    }
}

/// A memory-window chat history bound to one session.
pub struct Conversation {
    system_prompt: Option<String>,
    messages: Vec<ChatMessage>,
    max_messages: usize,
}

impl Conversation {
    pub fn new(system_prompt: Option<String>, max_messages: usize) -> Self {
        Self { system_prompt, messages: Vec::new(), max_messages }
    }

    /// Hydrate from persisted history (ascending create-time, user before
    /// assistant within the same millisecond — §C.4).
    pub fn with_history(system_prompt: Option<String>, max_messages: usize, mut history: Vec<ChatMessage>) -> Self {
        history.sort_by_key(|m| (m.metadata.time_ms, if m.role == MessageRole::User { 0 } else { 1 }));
        Self { system_prompt, messages: history, max_messages }
    }

    /// Add a message, or — if it is the rollback sentinel — discard the most
    /// recently added message instead.
    pub fn add(&mut self, message: ChatMessage) {
        if message.is_rollback() {
            self.messages.pop();
            return;
        }
        self.messages.push(message);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop the oldest user+assistant pair once the window overflows.
    fn enforce_window(&mut self) {
        while self.messages.len() > self.max_messages + 1 {
            if self.messages.len() >= 2 {
                self.messages.remove(0);
                self.messages.remove(0);
            } else {
                break;
            }
        }
    }

    /// Serialize for the chat-model request: system prompt first (not
    /// stored in the list), then the window-trimmed history.
    pub fn messages(&mut self) -> Vec<LlmChatMessage> {
        self.enforce_window();
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            if !prompt.is_empty() {
                out.push(LlmChatMessage {
                    role: Some(Value::String("system".to_string())),
                    content: Some(Value::String(prompt.clone())),
                    reasoning_details: None,
                    tool_calls: None,
                    tool_call_id: None,
                    name: None,
                    reasoning: None,
                    refusal: None,
                });
            }
        }
        out.extend(self.messages.iter().map(ChatMessage::to_llm_message));
        out
    }
}

/// Loads the last N normal user/assistant messages for (device, role) from
/// any `MessageStore` and hydrates a windowed `Conversation` from them.
pub async fn load_window(
    store: &dyn crate::dialogue::session::MessageStore,
    device_id: &str,
    role_id: i64,
    system_prompt: Option<String>,
    max_messages: usize,
) -> anyhow::Result<Conversation> {
    let history = store.find(device_id, role_id, max_messages).await?;
    let history: Vec<ChatMessage> = history
        .into_iter()
        .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
        .collect();
    Ok(Conversation::with_history(system_prompt, max_messages, history))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: MessageRole, text: &str, t: i64) -> ChatMessage {
        ChatMessage::new(role, text, t)
    }

    #[test]
    fn rollback_removes_most_recent_message() {
        let mut conv = Conversation::new(None, 16);
        conv.add(msg(MessageRole::User, "hi", 1));
        conv.add(ChatMessage::rollback());
        assert!(conv.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_pair_atomically() {
        let mut conv = Conversation::new(None, 1); // max 1 pair => 2 messages kept + 1 extra allowed
        conv.add(msg(MessageRole::User, "a", 1));
        conv.add(msg(MessageRole::Assistant, "b", 2));
        conv.add(msg(MessageRole::User, "c", 3));
        conv.add(msg(MessageRole::Assistant, "d", 4));
        let serialized = conv.messages();
        assert!(serialized.len() <= 2);
    }

    #[test]
    fn system_prompt_prepended_but_not_stored() {
        let mut conv = Conversation::new(Some("be nice".to_string()), 16);
        conv.add(msg(MessageRole::User, "hi", 1));
        assert_eq!(conv.len(), 1); // system prompt not counted in stored messages
        let serialized = conv.messages();
        assert_eq!(serialized.len(), 2);
    }
}
