// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Stdio Tool Server Adapter
//
// Launches a project's tool server as a child process and speaks
// newline-delimited JSON-RPC 2.0 over its stdin/stdout:
// - initialize + notifications/initialized handshake on connect
// - tools/list for discovery
// - tools/call for invocation
//
// A background task owns stdout and routes each response to the waiting
// request by id. If the process dies, every pending request fails.

use crate::domain::config::resolve_env_value;
use crate::domain::tool::{ToolDescriptor, ToolError, ToolServerClient, ToolServerConfig, ToolServerConnector};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, ToolError>>>>>;

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallResult {
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    is_error: bool,
}

/// Connects tool servers by spawning their configured command.
pub struct StdioToolServerConnector {
    request_timeout: Duration,
}

impl StdioToolServerConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for StdioToolServerConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[async_trait]
impl ToolServerConnector for StdioToolServerConnector {
    async fn connect(&self, config: &ToolServerConfig) -> Result<Arc<dyn ToolServerClient>, ToolError> {
        let client = StdioToolServerClient::spawn(config, self.request_timeout).await?;
        client.initialize().await?;
        Ok(Arc::new(client))
    }
}

pub struct StdioToolServerClient {
    name: String,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicI64,
    request_timeout: Duration,
    // Held for kill_on_drop
    _child: Child,
}

impl StdioToolServerClient {
    pub async fn spawn(config: &ToolServerConfig, request_timeout: Duration) -> Result<Self, ToolError> {
        info!("Spawning tool server '{}': {} {:?}", config.name, config.command, config.args);

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            let value = resolve_env_value(value).map_err(|e| ToolError::Transport(e.to_string()))?;
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::Transport(format!("failed to spawn {}: {}", config.command, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Transport("tool server has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Transport("tool server has no stdout".into()))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let reader_name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => route_response(&reader_name, line.trim(), &reader_pending),
                    Ok(None) => {
                        warn!("Tool server '{}' closed stdout", reader_name);
                        break;
                    }
                    Err(e) => {
                        warn!("Tool server '{}' read error: {}", reader_name, e);
                        break;
                    }
                }
            }
            for (_, tx) in reader_pending.lock().drain() {
                let _ = tx.send(Err(ToolError::Transport("tool server connection lost".into())));
            }
        });

        Ok(Self {
            name: config.name.clone(),
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            next_id: AtomicI64::new(1),
            request_timeout,
            _child: child,
        })
    }

    async fn initialize(&self) -> Result<(), ToolError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "switchyard", "version": env!("CARGO_PKG_VERSION") },
        });
        self.request("initialize", Some(params)).await?;
        self.send(&JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method: "notifications/initialized",
            params: None,
        })
        .await?;
        info!("Tool server '{}' initialized", self.name);
        Ok(())
    }

    async fn send(&self, request: &JsonRpcRequest<'_>) -> Result<(), ToolError> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        stdin.flush().await.map_err(|e| ToolError::Transport(e.to_string()))
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        debug!("Tool server '{}' request [{}]: {}", self.name, id, method);
        if let Err(e) = self
            .send(&JsonRpcRequest {
                jsonrpc: "2.0",
                id: Some(id),
                method,
                params,
            })
            .await
        {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ToolError::Transport("tool server dropped the request".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(ToolError::Transport(format!(
                    "{} timed out after {:?}",
                    method, self.request_timeout
                )))
            }
        }
    }
}

fn route_response(server: &str, line: &str, pending: &PendingMap) {
    if !line.starts_with('{') {
        debug!("Tool server '{}' skipping non-JSON line", server);
        return;
    }
    let response: JsonRpcResponse = match serde_json::from_str(line) {
        Ok(response) => response,
        Err(e) => {
            warn!("Tool server '{}' sent malformed JSON-RPC: {}", server, e);
            return;
        }
    };
    // Notifications carry no id
    let Some(id) = response.id else { return };
    let Some(tx) = pending.lock().remove(&id) else { return };
    let result = match response.error {
        Some(err) => Err(ToolError::Execution(format!("error {}: {}", err.code, err.message))),
        None => Ok(response.result.unwrap_or(Value::Null)),
    };
    let _ = tx.send(result);
}

/// Flatten a `tools/call` result into the value handed back to the model.
fn call_output(result: ToolCallResult) -> Result<Value, ToolError> {
    let texts: Vec<&str> = result
        .content
        .iter()
        .filter_map(|c| c.get("text").and_then(Value::as_str))
        .collect();
    let output = if texts.len() == result.content.len() {
        Value::String(texts.join("\n"))
    } else {
        Value::Array(result.content.clone())
    };
    if result.is_error {
        return Err(ToolError::Execution(match output {
            Value::String(s) => s,
            other => other.to_string(),
        }));
    }
    Ok(output)
}

#[async_trait]
impl ToolServerClient for StdioToolServerClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let result: ToolsListResult = serde_json::from_value(self.request("tools/list", None).await?)
            .map_err(|e| ToolError::Transport(e.to_string()))?;
        info!("Tool server '{}' exposes {} tools", self.name, result.tools.len());
        Ok(result.tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let raw = self.request("tools/call", Some(params)).await?;
        let result: ToolCallResult =
            serde_json::from_value(raw).map_err(|e| ToolError::Transport(e.to_string()))?;
        call_output(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_output_joins_text_content() {
        let result = ToolCallResult {
            content: vec![json!({"type": "text", "text": "a"}), json!({"type": "text", "text": "b"})],
            is_error: false,
        };
        assert_eq!(call_output(result).unwrap(), json!("a\nb"));
    }

    #[test]
    fn test_call_output_error_flag() {
        let result = ToolCallResult {
            content: vec![json!({"type": "text", "text": "file not found"})],
            is_error: true,
        };
        let err = call_output(result).unwrap_err();
        assert!(matches!(err, ToolError::Execution(msg) if msg == "file not found"));
    }

    #[tokio::test]
    async fn test_route_response_delivers_by_id() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().insert(7, tx);

        route_response("t", r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#, &pending);
        route_response("t", "debug noise", &pending);
        assert_eq!(pending.lock().len(), 1);

        route_response("t", r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#, &pending);
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert!(pending.lock().is_empty());
    }

    #[test]
    fn test_tools_list_accepts_camel_case_schema() {
        let raw = json!({"tools": [{"name": "read", "description": "Read a file",
            "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}}]});
        let parsed: ToolsListResult = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.tools[0].name, "read");
        assert_eq!(parsed.tools[0].input_schema["properties"]["path"]["type"], "string");
    }
}
