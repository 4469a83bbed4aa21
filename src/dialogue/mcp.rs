//! Device-hosted MCP bridge: JSON-RPC 2.0 requests sent down the same
//! session channel as audio/text frames, correlated back to their caller
//! via a pending-request table (§A.4.10, §C.2/§C.5).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::dialogue::error::{DialogueError, DialogueResult};

/// First request id handed out; kept well above any id a device firmware
/// might itself originate, mirroring the reference bridge's starting point.
const FIRST_REQUEST_ID: i64 = 10_000;
const MCP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<i64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct McpTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Sends raw JSON-RPC frames to the device. Implemented by the session's
/// websocket writer half.
#[async_trait::async_trait]
pub trait McpTransport: Send + Sync {
    async fn send_json(&self, value: Value) -> anyhow::Result<()>;
}

/// Per-session MCP bridge state (§3 `McpHolder`).
pub struct DeviceMcpBridge {
    transport: Arc<dyn McpTransport>,
    next_id: AtomicI64,
    pending: RwLock<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>,
    initialized: RwLock<bool>,
    cursor: Mutex<Option<String>>,
    max_tools_count: usize,
    server_domain: Option<String>,
    server_port: u16,
}

impl DeviceMcpBridge {
    pub fn new(transport: Arc<dyn McpTransport>, max_tools_count: usize, server_domain: Option<String>, server_port: u16) -> Self {
        Self {
            transport,
            next_id: AtomicI64::new(FIRST_REQUEST_ID),
            pending: RwLock::new(HashMap::new()),
            initialized: RwLock::new(false),
            cursor: Mutex::new(None),
            max_tools_count,
            server_domain,
            server_port,
        }
    }

    fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Vision callback URL bound as a capability during `initialize`,
    /// using the session id as a bearer token (§C.2).
    fn vision_url(&self, session_id: &str) -> String {
        match &self.server_domain {
            Some(domain) => format!("http://{domain}/api/vl/chat?token={session_id}"),
            None => format!("http://127.0.0.1:{}/api/vl/chat?token={session_id}", self.server_port),
        }
    }

    /// Send a request and await its correlated response, or time out after
    /// 30s (§3 invariant: every MCP request either resolves or times out).
    pub async fn send_request(&self, method: &str, params: Value) -> DialogueResult<JsonRpcResponse> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);

        let request = JsonRpcRequest { jsonrpc: "2.0", id, method: method.to_string(), params };
        if let Err(e) = self.transport.send_json(json!(request)).await {
            self.pending.write().await.remove(&id);
            return Err(DialogueError::Mcp(format!("failed to send mcp request: {e}")));
        }

        match tokio::time::timeout(MCP_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.write().await.remove(&id);
                Err(DialogueError::Mcp("mcp response channel dropped".to_string()))
            }
            Err(_) => {
                self.pending.write().await.remove(&id);
                Err(DialogueError::McpTimeout)
            }
        }
    }

    /// Route an inbound JSON-RPC response frame to its waiting caller.
    pub async fn handle_response(&self, response: JsonRpcResponse) {
        let Some(id) = response.id else { return };
        if let Some(tx) = self.pending.write().await.remove(&id) {
            let _ = tx.send(response);
        }
    }

    /// `initialize` handshake: declares server capabilities (including the
    /// bound vision callback) and marks the bridge ready for `tools/list`.
    pub async fn initialize(&self, session_id: &str) -> DialogueResult<()> {
        let params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "vision": { "url": self.vision_url(session_id) }
            },
            "clientInfo": { "name": "xiaozhi-core", "version": env!("CARGO_PKG_VERSION") }
        });
        let response = self.send_request("initialize", params).await?;
        if response.error.is_some() {
            return Err(DialogueError::Mcp(format!("device rejected initialize: {:?}", response.error)));
        }
        *self.initialized.write().await = true;
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.read().await
    }

    /// Paginated `tools/list`, capped at `max_tools_count` total regardless
    /// of how many pages the device offers (§C.2 bound).
    pub async fn list_tools(&self) -> DialogueResult<Vec<McpTool>> {
        if !self.is_initialized().await {
            return Err(DialogueError::Mcp("mcp bridge not initialized".to_string()));
        }

        let mut tools = Vec::new();
        loop {
            if tools.len() >= self.max_tools_count {
                break;
            }
            let cursor = self.cursor.lock().await.clone();
            let mut params = json!({});
            if let Some(c) = &cursor {
                params["cursor"] = json!(c);
            }

            let response = self.send_request("tools/list", params).await?;
            let result = response.result.ok_or_else(|| DialogueError::Mcp("tools/list missing result".to_string()))?;

            if let Some(items) = result.get("tools").and_then(|v| v.as_array()) {
                for item in items {
                    if tools.len() >= self.max_tools_count {
                        break;
                    }
                    let name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let description = item.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let input_schema = item.get("inputSchema").cloned().unwrap_or_else(|| json!({"type": "object"}));
                    tools.push(McpTool { name, description, input_schema });
                }
            }

            let next_cursor = result
                .get("nextCursor")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());
            *self.cursor.lock().await = next_cursor.clone();
            if next_cursor.is_none() {
                break;
            }
        }
        Ok(tools)
    }

    /// Invoke `tools/call` for a device-hosted tool.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> DialogueResult<Value> {
        let response = self
            .send_request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        if let Some(err) = response.error {
            return Err(DialogueError::Mcp(format!("device tool '{name}' failed: {err}")));
        }
        response.result.ok_or_else(|| DialogueError::Mcp(format!("tools/call '{name}' missing result")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingTransport {
        sent: Arc<TokioMutex<Vec<Value>>>,
    }

    #[async_trait::async_trait]
    impl McpTransport for RecordingTransport {
        async fn send_json(&self, value: Value) -> anyhow::Result<()> {
            self.sent.lock().await.push(value);
            Ok(())
        }
    }

    #[tokio::test]
    async fn request_ids_start_at_ten_thousand_and_increment() {
        let sent = Arc::new(TokioMutex::new(Vec::new()));
        let transport = Arc::new(RecordingTransport { sent: sent.clone() });
        let bridge = DeviceMcpBridge::new(transport, 32, None, 8000);

        let bridge_clone = Arc::new(bridge);
        let b1 = bridge_clone.clone();
        tokio::spawn(async move {
            let _ = tokio::time::timeout(Duration::from_millis(50), b1.send_request("ping", json!({}))).await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let recorded = sent.lock().await;
        assert_eq!(recorded[0]["id"], json!(10_000));
    }

    #[tokio::test]
    async fn handle_response_resolves_pending_request() {
        let sent = Arc::new(TokioMutex::new(Vec::new()));
        let transport = Arc::new(RecordingTransport { sent });
        let bridge = Arc::new(DeviceMcpBridge::new(transport, 32, None, 8000));

        let b = bridge.clone();
        let handle = tokio::spawn(async move { b.send_request("ping", json!({})).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        bridge
            .handle_response(JsonRpcResponse { jsonrpc: None, id: Some(10_000), result: Some(json!({"ok": true})), error: None })
            .await;

        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn vision_url_falls_back_to_loopback_without_domain() {
        let sent = Arc::new(TokioMutex::new(Vec::new()));
        let transport = Arc::new(RecordingTransport { sent });
        let bridge = DeviceMcpBridge::new(transport, 32, None, 9000);
        assert_eq!(bridge.vision_url("sess-1"), "http://127.0.0.1:9000/api/vl/chat?token=sess-1");
    }

    #[tokio::test]
    async fn list_tools_stops_pagination_on_empty_next_cursor() {
        let sent = Arc::new(TokioMutex::new(Vec::new()));
        let transport = Arc::new(RecordingTransport { sent: sent.clone() });
        let bridge = Arc::new(DeviceMcpBridge::new(transport, 32, None, 8000));
        *bridge.initialized.write().await = true;

        let b = bridge.clone();
        let handle = tokio::spawn(async move { b.list_tools().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let id = sent.lock().await.last().unwrap()["id"].as_i64().unwrap();
        bridge
            .handle_response(JsonRpcResponse {
                jsonrpc: None,
                id: Some(id),
                result: Some(json!({
                    "tools": [{"name": "t1", "description": "d", "inputSchema": {"type": "object"}}],
                    "nextCursor": "",
                })),
                error: None,
            })
            .await;

        let tools = handle.await.unwrap().unwrap();
        assert_eq!(tools.len(), 1);
        // A second `tools/list` round-trip would mean pagination kept going
        // on an empty (not absent) cursor.
        assert_eq!(sent.lock().await.len(), 1);
    }
}
