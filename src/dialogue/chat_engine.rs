//! Orchestrates one user turn: memory, the LLM, tool dispatch, and
//! sentence emission for synthesis (§A.4.8).
//!
//! Streaming here always degrades to the non-streaming ReAct loop when the
//! session has any registered tools, because the underlying LLM client's
//! SSE path (`stream_complete`) carries no `tools` field — a session with
//! an empty `ToolRegistry` streams token-by-token instead.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::Value;
use tracing::{error, warn};

use crate::agent::llm::OpenRouterClient;
use crate::dialogue::memory::{ChatMessage, Conversation, MessageRole};
use crate::dialogue::sentencer::Sentencer;
use crate::dialogue::tools::{ToolContext, ToolRegistry};

const MAX_CONSECUTIVE_DUPES: usize = 2;

pub struct ChatEngineConfig {
    pub model: String,
    pub max_iterations: usize,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Outcome of a completed (non-streaming) turn.
pub struct ChatTurnResult {
    pub final_response: String,
    pub iterations: usize,
    pub tool_calls_made: usize,
    /// Set when a rollback-flagged tool fired during this turn — the
    /// caller must roll the user message back out of memory instead of
    /// persisting the assistant reply.
    pub rolled_back: bool,
}

pub struct ChatEngine {
    client: Arc<OpenRouterClient>,
    config: ChatEngineConfig,
}

impl ChatEngine {
    pub fn new(client: Arc<OpenRouterClient>, config: ChatEngineConfig) -> Self {
        Self { client, config }
    }

    /// Full ReAct loop: call the model, execute any tool calls against
    /// `tools`, feed results back, repeat until a plain-text reply or the
    /// iteration/dedup guard fires. A `return_direct` tool's outcome short
    /// circuits the loop immediately without a further model call.
    pub async fn chat(&self, conversation: &mut Conversation, tools: &ToolRegistry, ctx: &ToolContext) -> anyhow::Result<ChatTurnResult> {
        let tool_defs = tools.to_tool_definitions();

        if tool_defs.is_empty() {
            let messages = conversation.messages();
            let final_response = self.client.complete(&self.config.model, messages, Some(self.config.max_tokens)).await?;
            return Ok(ChatTurnResult { final_response, iterations: 1, tool_calls_made: 0, rolled_back: false });
        }

        let mut iteration = 0usize;
        let mut total_tool_calls = 0usize;
        let mut final_response = String::new();
        let mut rolled_back = false;
        let mut seen_calls: HashSet<String> = HashSet::new();
        let mut consecutive_dupes = 0usize;

        loop {
            iteration += 1;
            if iteration > self.config.max_iterations {
                warn!(iterations = iteration - 1, "chat engine hit max tool iterations");
                break;
            }

            let messages = conversation.messages();
            let response = self
                .client
                .complete_with_tools(&self.config.model, messages, tool_defs.clone(), Some(self.config.max_tokens))
                .await?;

            let has_tool_calls = response.tool_calls.as_ref().map(|tc| !tc.is_empty()).unwrap_or(false);
            if !has_tool_calls {
                final_response = extract_text(&response.content);
                break;
            }

            let tool_calls = response.tool_calls.clone().unwrap_or_default();
            total_tool_calls += tool_calls.len();

            conversation.add(ChatMessage {
                role: MessageRole::Assistant,
                content: response.content.as_ref().and_then(|v| v.as_str()).map(|s| s.to_string()),
                name: None,
                tool_calls: Some(tool_calls.clone()),
                tool_call_id: None,
                metadata: crate::dialogue::memory::MessageMetadata {
                    time_ms: chrono::Utc::now().timestamp_millis(),
                    audio_path: None,
                    message_type: crate::dialogue::memory::MessageType::FunctionCall,
                },
            });

            let call_keys: Vec<String> = tool_calls.iter().map(|tc| format!("{}:{}", tc.function.name, tc.function.arguments)).collect();
            let all_dupes = !call_keys.is_empty() && call_keys.iter().all(|k| seen_calls.contains(k));
            if all_dupes {
                consecutive_dupes += 1;
                if consecutive_dupes >= MAX_CONSECUTIVE_DUPES {
                    warn!("chat engine stopping: model repeating identical tool calls");
                    break;
                }
            } else {
                consecutive_dupes = 0;
            }
            for key in &call_keys {
                seen_calls.insert(key.clone());
            }

            let mut short_circuit: Option<String> = None;
            for tc in &tool_calls {
                let args: Value = serde_json::from_str(&tc.function.arguments).unwrap_or(Value::Null);
                let tool = tools.get(&tc.function.name);

                let (result_text, return_direct, rollback) = match tool {
                    Some(tool) => match tool.call(args, ctx).await {
                        Ok(outcome) => (outcome.message, tool.return_direct, tool.rollback),
                        Err(err) => {
                            error!(tool = %tc.function.name, %err, "tool call failed");
                            (format!("Error: {err}"), false, false)
                        }
                    },
                    None => (format!("Error: unknown tool '{}'", tc.function.name), false, false),
                };

                conversation.add(ChatMessage {
                    role: MessageRole::Tool,
                    content: Some(result_text.clone()),
                    name: Some(tc.function.name.clone()),
                    tool_calls: None,
                    tool_call_id: Some(tc.id.clone()),
                    metadata: crate::dialogue::memory::MessageMetadata {
                        time_ms: chrono::Utc::now().timestamp_millis(),
                        audio_path: None,
                        message_type: crate::dialogue::memory::MessageType::Normal,
                    },
                });

                if rollback {
                    rolled_back = true;
                }
                if return_direct {
                    short_circuit = Some(result_text);
                }
            }

            if let Some(direct) = short_circuit {
                final_response = direct;
                break;
            }
        }

        Ok(ChatTurnResult { final_response, iterations: iteration, tool_calls_made: total_tool_calls, rolled_back })
    }

    /// Token-streaming entry point. Degrades to `chat` whenever the
    /// session has any tools registered (see module docs); otherwise
    /// streams tokens through `sentencer`, invoking `on_sentence` for each
    /// completed sentence as it is produced.
    pub async fn chat_stream(
        &self,
        conversation: &mut Conversation,
        tools: &ToolRegistry,
        ctx: &ToolContext,
        on_sentence: Arc<dyn Fn(String) + Send + Sync>,
    ) -> anyhow::Result<ChatTurnResult> {
        if !tools.is_empty() {
            let result = self.chat(conversation, tools, ctx).await?;
            let mut sentencer = Sentencer::new();
            for sentence in sentencer.push_token(&result.final_response) {
                on_sentence(sentence);
            }
            if let Some(last) = sentencer.finish() {
                on_sentence(last);
            }
            return Ok(result);
        }

        let messages = conversation.messages();
        let sentencer = Arc::new(StdMutex::new(Sentencer::new()));
        let sentencer_for_chunk = sentencer.clone();
        let on_sentence_for_chunk = on_sentence.clone();

        let full_text = self
            .client
            .stream_complete(&self.config.model, messages, Some(self.config.max_tokens), move |chunk| {
                let sentences = {
                    let mut guard = sentencer_for_chunk.lock().expect("sentencer lock poisoned");
                    guard.push_token(chunk)
                };
                for sentence in sentences {
                    on_sentence_for_chunk(sentence);
                }
            })
            .await?;

        if let Some(last) = sentencer.lock().expect("sentencer lock poisoned").finish() {
            on_sentence(last);
        }

        Ok(ChatTurnResult { final_response: full_text, iterations: 1, tool_calls_made: 0, rolled_back: false })
    }
}

fn extract_text(content: &Option<Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| {
                if p.get("type").and_then(|t| t.as_str()) == Some("text") {
                    p.get("text").and_then(|t| t.as_str()).map(|s| s.to_string())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_text_reads_plain_string_content() {
        let content = Some(Value::String("hello".to_string()));
        assert_eq!(extract_text(&content), "hello");
    }

    #[test]
    fn extract_text_joins_text_parts_from_array_content() {
        let content = Some(serde_json::json!([
            {"type": "text", "text": "a"},
            {"type": "image", "url": "ignored"},
            {"type": "text", "text": "b"},
        ]));
        assert_eq!(extract_text(&content), "ab");
    }

    #[test]
    fn extract_text_defaults_to_empty_on_missing_content() {
        assert_eq!(extract_text(&None), "");
    }
}
