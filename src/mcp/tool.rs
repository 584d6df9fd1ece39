//! MCP 远程工具适配：把发现到的每个远程工具包装成本地 Tool，名称加 `mcp_` 前缀

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::validator::MCP_PREFIX;
use crate::mcp::McpClient;
use crate::tools::{Tool, ToolDescriptor, ToolOutcome, ToolRegistry};

pub struct McpTool {
    client: Arc<McpClient>,
    remote_name: String,
    name: String,
    description: String,
    schema: Value,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, descriptor: ToolDescriptor) -> Self {
        let description = if descriptor.description.is_empty() {
            format!("MCP tool: {}", descriptor.name)
        } else {
            descriptor.description
        };
        Self {
            client,
            name: format!("{MCP_PREFIX}{}", descriptor.name),
            description: format!("{MCP_PREFIX}{} - {}", descriptor.name, description),
            remote_name: descriptor.name,
            schema: descriptor.parameters,
        }
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    /// 必需参数存在，且 string / number / boolean 类型匹配
    fn validate_args(&self, args: &Value) -> bool {
        let empty = serde_json::Map::new();
        let args = args.as_object().unwrap_or(&empty);
        if let Some(required) = self.schema.get("required").and_then(|r| r.as_array()) {
            for param in required.iter().filter_map(|p| p.as_str()) {
                if !args.contains_key(param) {
                    tracing::warn!(tool = %self.name, param, "Missing required parameter");
                    return false;
                }
            }
        }
        let Some(properties) = self.schema.get("properties").and_then(|p| p.as_object()) else {
            return true;
        };
        for (key, value) in args {
            let expected = properties.get(key).and_then(|p| p.get("type")).and_then(|t| t.as_str());
            let ok = match expected {
                Some("string") => value.is_string(),
                Some("number") => value.is_number(),
                Some("integer") => value.is_i64() || value.is_u64(),
                Some("boolean") => value.is_boolean(),
                _ => true,
            };
            if !ok {
                tracing::warn!(tool = %self.name, param = %key, expected = ?expected, "Parameter type mismatch");
                return false;
            }
        }
        true
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        match self.client.call_tool(&self.remote_name, args).await {
            Ok(result) if result.is_error => {
                let error = result.text().unwrap_or("Unknown error").to_string();
                ToolOutcome::fail(
                    error.clone(),
                    format!("MCP工具 {} 执行失败: {}", self.remote_name, error),
                )
            }
            Ok(result) => {
                let data = match (result.text(), &result.structured_content) {
                    (Some(text), _) => Value::String(text.to_string()),
                    (None, Some(structured)) => structured.clone(),
                    (None, None) => serde_json::to_value(&result.content).unwrap_or(Value::Null),
                };
                ToolOutcome::ok(data, format!("MCP工具 {} 执行成功", self.remote_name))
            }
            Err(e) => {
                tracing::error!(tool = %self.remote_name, error = %e, "Error executing MCP tool");
                ToolOutcome::fail(
                    e.to_string(),
                    format!("MCP工具 {} 执行失败: {}", self.remote_name, e),
                )
            }
        }
    }
}

/// 把客户端已发现的工具注册进注册表，返回注册数量
pub fn register_mcp_tools(registry: &ToolRegistry, client: &Arc<McpClient>) -> usize {
    let tools = client.tools();
    for descriptor in &tools {
        tracing::info!(tool = %descriptor.name, "Registering MCP tool");
        registry.register(McpTool::new(client.clone(), descriptor.clone()));
    }
    tools.len()
}
