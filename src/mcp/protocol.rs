//! MCP 线协议：按行分隔的 JSON-RPC 2.0 消息、工具描述与调用结果

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::tools::ToolDescriptor;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    /// 通知没有 id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: method.into(),
            params: None,
        }
    }

    /// 序列化为一行（末尾带换行）
    pub fn to_line(&self) -> Result<String, AgentError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// 是否是对指定请求的响应（id 可能是数字或数字字符串）
    pub fn matches(&self, request_id: u64) -> bool {
        match &self.id {
            Some(Value::Number(n)) => n.as_u64() == Some(request_id),
            Some(Value::String(s)) => s.parse::<u64>().map_or(false, |id| id == request_id),
            _ => false,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// tools/list 中的单个工具
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

impl From<RemoteTool> for ToolDescriptor {
    fn from(t: RemoteTool) -> Self {
        ToolDescriptor {
            name: t.name,
            description: t.description.unwrap_or_default(),
            parameters: if t.input_schema.is_null() {
                json!({"type": "object", "properties": {}})
            } else {
                t.input_schema
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<RemoteTool>,
}

/// 结果中的一项内容：text / image 以外的类型原样保留
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl ContentItem {
    pub fn from_value(value: &Value) -> Self {
        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("unknown").to_string();
        let payload = match kind.as_str() {
            "text" => value.get("text").cloned().unwrap_or(Value::String(String::new())),
            "image" => json!({
                "data": value.get("data").cloned().unwrap_or(Value::Null),
                "mimeType": value.get("mimeType").cloned().unwrap_or(Value::Null),
            }),
            _ => value.clone(),
        };
        Self { kind, payload }
    }

    pub fn as_text(&self) -> Option<&str> {
        if self.kind == "text" {
            self.payload.as_str()
        } else {
            None
        }
    }
}

/// tools/call 的结果；is_error 表示「工具拒绝」，区别于传输失败
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallToolResult {
    pub content: Vec<ContentItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
    pub is_error: bool,
}

impl CallToolResult {
    pub fn from_value(value: &Value) -> Self {
        Self {
            content: value
                .get("content")
                .and_then(|c| c.as_array())
                .map(|items| items.iter().map(ContentItem::from_value).collect())
                .unwrap_or_default(),
            structured_content: value.get("structuredContent").filter(|v| !v.is_null()).cloned(),
            is_error: value.get("isError").and_then(|v| v.as_bool()).unwrap_or(false),
        }
    }

    /// JSON-RPC error 响应折叠为 is_error 结果
    pub fn from_rpc_error(error: &JsonRpcError) -> Self {
        Self {
            content: vec![ContentItem {
                kind: "text".to_string(),
                payload: Value::String(error.message.clone()),
            }],
            structured_content: error.data.clone(),
            is_error: true,
        }
    }

    /// 第一条文本内容
    pub fn text(&self) -> Option<&str> {
        self.content.iter().find_map(|c| c.as_text())
    }
}

/// 按 shell 规则切分命令行：支持单引号、双引号与反斜杠转义
pub fn split_command(command: &str) -> Result<Vec<String>, AgentError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(AgentError::Config("unterminated single quote in command".into())),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\' | '$' | '`')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(AgentError::Config("unterminated double quote in command".into())),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(AgentError::Config("unterminated double quote in command".into())),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(ch) = chars.next() {
                    current.push(ch);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    parts.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        parts.push(current);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command(r#"python -m "my server" --name 'a b' x\ y"#).unwrap(),
            vec!["python", "-m", "my server", "--name", "a b", "x y"]
        );
        assert_eq!(split_command("  ").unwrap(), Vec::<String>::new());
        assert_eq!(split_command("a ''").unwrap(), vec!["a", ""]);
        assert!(split_command("echo 'oops").is_err());
    }

    #[test]
    fn test_request_line() {
        let line = JsonRpcRequest::request(7, "tools/list", json!({})).to_line().unwrap();
        assert!(line.ends_with('\n'));
        let v: Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["id"], 7);
        let n = JsonRpcRequest::notification("notifications/initialized").to_line().unwrap();
        assert!(!n.contains("\"id\""));
    }

    #[test]
    fn test_call_result_collapse() {
        let v = json!({
            "content": [
                {"type": "image", "data": "AAA", "mimeType": "image/png"},
                {"type": "text", "text": "hello"},
                {"type": "resource", "uri": "file:///x"}
            ],
            "isError": false
        });
        let r = CallToolResult::from_value(&v);
        assert_eq!(r.content.len(), 3);
        assert_eq!(r.text(), Some("hello"));
        assert_eq!(r.content[0].payload["mimeType"], "image/png");
        assert_eq!(r.content[2].payload["uri"], "file:///x");
        assert!(!r.is_error);
    }

    #[test]
    fn test_response_matches_id() {
        let r: JsonRpcResponse = serde_json::from_str(r#"{"jsonrpc":"2.0","id":"3","result":{}}"#).unwrap();
        assert!(r.matches(3));
        let n: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#).unwrap();
        assert!(n.is_notification());
        assert!(!n.matches(3));
    }
}
