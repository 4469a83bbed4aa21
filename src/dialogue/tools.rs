//! Per-session tool table: built-in + IoT-descriptor-derived + device-hosted
//! MCP tools (§A.4.9).

use crate::agent::llm::{FunctionDefinition, ToolDefinition};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub message: String,
    pub data: Option<Value>,
}

impl ToolOutcome {
    pub fn text(message: impl Into<String>) -> Self {
        Self { message: message.into(), data: None }
    }
}

/// A tool handler closes over whatever session state it needs (registered
/// per-session rather than globally, per §3 Tool entity).
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutcome>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<ToolOutcome>> + Send,
{
    async fn call(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutcome> {
        (self)(args, ctx.clone()).await
    }
}

/// A registered tool (§3 `Tool`/`ToolCallback`).
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub return_direct: bool,
    /// Whether a successful call should roll back the user turn from memory
    /// (used for tool calls whose side effect replaces the reply, e.g.
    /// `new-chat`).
    pub rollback: bool,
    handler: Arc<dyn ToolHandler>,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        return_direct: bool,
        rollback: bool,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self { name: name.into(), description: description.into(), input_schema, return_direct, rollback, handler }
    }

    pub async fn call(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutcome> {
        self.handler.call(args, ctx).await
    }
}

/// Per-session table of name → Tool. Names are unique per session; a later
/// registration (e.g. re-running `iot` descriptor sync) replaces the
/// earlier one.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn remove(&mut self, name: &str) {
        self.tools.remove(name);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Render the registry as OpenAI-compatible tool definitions for a chat
    /// model call.
    pub fn to_tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition {
                r#type: "function".to_string(),
                function: FunctionDefinition {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    }

    /// Register an IoT property getter: `iot_get_<dev>_<prop>`, return-direct,
    /// response templated with `{value}`.
    pub fn register_iot_property(
        &mut self,
        device: &str,
        property: &str,
        current_value: Arc<tokio::sync::RwLock<Value>>,
    ) {
        let name = format!("iot_get_{device}_{property}");
        let value_for_handler = current_value.clone();
        let handler = Arc::new(move |_args: Value, _ctx: ToolContext| {
            let value_for_handler = value_for_handler.clone();
            async move {
                let v = value_for_handler.read().await;
                Ok(ToolOutcome::text(format!("{value}", value = v)))
            }
        });
        self.register(Tool::new(
            name,
            format!("Get the current value of {device}.{property}"),
            serde_json::json!({"type": "object", "properties": {}}),
            true,
            false,
            handler,
        ));
    }

    /// Register an IoT method: `iot_<dev>_<method>`, return-direct, using
    /// the descriptor's declared parameters plus a success template.
    pub fn register_iot_method(
        &mut self,
        device: &str,
        method: &str,
        parameters_schema: Value,
        response_success: String,
        dispatch: Arc<dyn ToolHandler>,
    ) {
        let name = format!("iot_{device}_{method}");
        let _ = response_success; // consumed by `dispatch`'s closure at construction time
        self.register(Tool::new(
            name,
            format!("Invoke {device}.{method}"),
            parameters_schema,
            true,
            false,
            dispatch,
        ));
    }

    /// Register an MCP-backed tool under `mcp_<sanitized name>`.
    pub fn register_mcp_tool(&mut self, raw_name: &str, description: String, input_schema: Value, handler: Arc<dyn ToolHandler>) {
        let sanitized = raw_name.replace('.', "_");
        let name = format!("mcp_{sanitized}");
        self.register(Tool::new(name, description, input_schema, false, false, handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext { session_id: "s1".into(), device_id: None }
    }

    #[tokio::test]
    async fn register_and_call_tool() {
        let mut registry = ToolRegistry::new();
        let handler = Arc::new(|_args: Value, _ctx: ToolContext| async move {
            Ok(ToolOutcome::text("操作成功"))
        });
        registry.register(Tool::new("turn_on", "turn on", serde_json::json!({}), true, false, handler));
        let tool = registry.get("turn_on").expect("registered");
        let result = tool.call(Value::Null, &ctx()).await.unwrap();
        assert_eq!(result.message, "操作成功");
    }

    #[test]
    fn mcp_tool_name_sanitizes_dots() {
        let mut registry = ToolRegistry::new();
        let handler = Arc::new(|_args: Value, _ctx: ToolContext| async move { Ok(ToolOutcome::text("ok")) });
        registry.register_mcp_tool("camera.snapshot", "take a photo".into(), serde_json::json!({}), handler);
        assert!(registry.get("mcp_camera_snapshot").is_some());
    }
}
