//! MCP stdio 客户端
//!
//! 以子进程方式启动 MCP 服务器，通过 stdin/stdout 交换按行分隔的 JSON-RPC 消息。
//! connect 失败（启动失败、握手超时、首次发现失败）只返回 false；
//! 会话期间的传输错误以 Err 向上传播；同一会话上的请求经 tokio Mutex 串行化。

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::mcp::protocol::{
    initialize_params, split_command, CallToolResult, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
};
use crate::tools::ToolDescriptor;

struct StdioSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Drop for StdioSession {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

impl StdioSession {
    fn spawn(program: &str, args: &[String]) -> Result<Self, AgentError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| AgentError::Mcp(format!("spawning MCP server {program}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Mcp("failed to capture stdin for MCP server".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Mcp("failed to capture stdout for MCP server".into()))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    async fn send(&mut self, message: &JsonRpcRequest) -> Result<(), AgentError> {
        let line = message.to_line()?;
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AgentError::Mcp(format!("writing to MCP server: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| AgentError::Mcp(format!("flushing MCP stdin: {e}")))?;
        Ok(())
    }

    /// 读取直到拿到对应 id 的响应；通知与无法解析的行被跳过
    async fn read_response(&mut self, request_id: u64, wait: Duration) -> Result<JsonRpcResponse, AgentError> {
        loop {
            let mut line = String::new();
            let read = timeout(wait, self.stdout.read_line(&mut line))
                .await
                .map_err(|_| AgentError::Timeout(format!("waiting for MCP response {request_id}")))?
                .map_err(|e| AgentError::Mcp(format!("reading from MCP server: {e}")))?;
            if read == 0 {
                return Err(AgentError::Mcp("MCP server closed stdout".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let response: JsonRpcResponse = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(error = %e, line = trimmed, "Skipping non JSON-RPC line");
                    continue;
                }
            };
            if response.matches(request_id) {
                return Ok(response);
            }
            if response.is_notification() {
                tracing::debug!(method = ?response.method, "MCP notification");
            }
        }
    }

    async fn shutdown(mut self) {
        // 先关闭 stdin 让服务器自行退出，再强制结束
        let _ = self.stdin.shutdown().await;
        match timeout(Duration::from_millis(500), self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(%status, "MCP server exited"),
            _ => {
                if let Err(e) = self.child.kill().await {
                    tracing::debug!(error = %e, "MCP server already gone");
                }
            }
        }
    }
}

/// MCP 客户端
pub struct McpClient {
    server_command: Option<String>,
    transport: String,
    request_timeout: Duration,
    session: Mutex<Option<StdioSession>>,
    connected: AtomicBool,
    next_id: AtomicU64,
    tools: RwLock<Vec<ToolDescriptor>>,
}

impl McpClient {
    pub fn new(server_command: Option<String>, transport: impl Into<String>, request_timeout_secs: u64) -> Self {
        Self {
            server_command,
            transport: transport.into(),
            request_timeout: Duration::from_secs(request_timeout_secs.max(1)),
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            tools: RwLock::new(Vec::new()),
        }
    }

    pub fn stdio(server_command: impl Into<String>) -> Self {
        Self::new(Some(server_command.into()), "stdio", 30)
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout = Duration::from_secs(secs.max(1));
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// 启动子进程、握手并发现工具；已连接时直接返回 true
    pub async fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        let Some(command) = self.server_command.as_deref() else {
            tracing::warn!("MCP server command not specified, skipping connection");
            return false;
        };
        if self.transport != "stdio" {
            tracing::error!(transport = %self.transport, "Only the stdio transport is supported");
            return false;
        }

        match self.open(command).await {
            Ok(count) => {
                tracing::info!(command, tools = count, "MCP client connected via stdio");
                true
            }
            Err(e) => {
                tracing::error!(command, error = %e, "Failed to connect to MCP server");
                self.teardown().await;
                false
            }
        }
    }

    async fn open(&self, command: &str) -> Result<usize, AgentError> {
        let parts = split_command(command)?;
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| AgentError::Config("empty MCP server command".into()))?;
        tracing::debug!(program, ?args, "Starting MCP server");

        {
            let mut guard = self.session.lock().await;
            let mut session = StdioSession::spawn(program, args)?;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            session
                .send(&JsonRpcRequest::request(id, "initialize", initialize_params()))
                .await?;
            let response = session.read_response(id, self.request_timeout).await?;
            if let Some(err) = response.error {
                return Err(AgentError::Mcp(format!("initialize rejected: {}", err.message)));
            }
            session
                .send(&JsonRpcRequest::notification("notifications/initialized"))
                .await?;
            *guard = Some(session);
        }
        self.connected.store(true, Ordering::SeqCst);
        let tools = self.discover().await?;
        Ok(tools.len())
    }

    /// 发送请求并等待响应；传输失败或超时时会话作废
    async fn request(&self, method: &str, params: Value) -> Result<JsonRpcResponse, AgentError> {
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(AgentError::Mcp("MCP client not connected".into()));
        };
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let outcome = match session.send(&JsonRpcRequest::request(id, method, params)).await {
            Ok(()) => session.read_response(id, self.request_timeout).await,
            Err(e) => Err(e),
        };
        // 超时后缓冲区里可能残留半行响应，会话同样不可再用
        if let Err(e) = &outcome {
            tracing::warn!(method, error = %e, "MCP transport failure, dropping session");
            guard.take();
            self.connected.store(false, Ordering::SeqCst);
        }
        outcome
    }

    async fn discover(&self) -> Result<Vec<ToolDescriptor>, AgentError> {
        let response = self.request("tools/list", json!({})).await?;
        if let Some(err) = response.error {
            return Err(AgentError::Mcp(format!("tools/list failed: {}", err.message)));
        }
        let listed: ListToolsResult = match response.result {
            Some(result) => serde_json::from_value(result)?,
            None => ListToolsResult::default(),
        };
        let tools: Vec<ToolDescriptor> = listed.tools.into_iter().map(ToolDescriptor::from).collect();
        tracing::info!(count = tools.len(), "Found MCP tools");
        *self.tools.write().unwrap_or_else(|e| e.into_inner()) = tools.clone();
        Ok(tools)
    }

    /// 重新发现工具；失败时记日志并返回空列表
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        if !self.is_connected() {
            tracing::warn!("MCP client not connected, cannot list tools");
            return Vec::new();
        }
        match self.discover().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list MCP tools");
                Vec::new()
            }
        }
    }

    /// 最近一次发现的工具
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 调用远程工具；未连接或传输失败返回 Err，服务端拒绝返回 is_error 结果
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, AgentError> {
        if !self.is_connected() {
            tracing::error!(tool = name, "Cannot call tool: MCP client not connected");
            return Err(AgentError::Mcp("MCP client not connected".into()));
        }
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        tracing::debug!(tool = name, %arguments, "Calling MCP tool");
        let response = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        let result = match (&response.error, &response.result) {
            (Some(err), _) => CallToolResult::from_rpc_error(err),
            (None, Some(result)) => CallToolResult::from_value(result),
            (None, None) => CallToolResult::from_value(&Value::Null),
        };
        if result.is_error {
            tracing::warn!(tool = name, "MCP tool returned an error");
        }
        Ok(result)
    }

    /// 断开连接；重复调用无副作用，关闭过程中的错误只记录
    pub async fn disconnect(&self) {
        if !self.is_connected() {
            tracing::debug!("Already disconnected, skipping disconnect");
            return;
        }
        self.teardown().await;
        tracing::info!("MCP client disconnected");
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_without_command() {
        let client = McpClient::new(None, "stdio", 5);
        assert!(!client.connect().await);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_connect_spawn_failure_is_false() {
        let client = McpClient::stdio("/definitely/not/a/real/binary --flag");
        assert!(!client.connect().await);
    }

    #[tokio::test]
    async fn test_unsupported_transport() {
        let client = McpClient::new(Some("cat".into()), "http", 5);
        assert!(!client.connect().await);
    }

    #[tokio::test]
    async fn test_call_tool_rejects_when_disconnected() {
        let client = McpClient::stdio("cat");
        let err = client.call_tool("read", json!({})).await.unwrap_err();
        assert!(matches!(err, AgentError::Mcp(_)));
        assert!(client.list_tools().await.is_empty());
        client.disconnect().await;
        client.disconnect().await;
    }
}
