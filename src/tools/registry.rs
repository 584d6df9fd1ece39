//! 工具注册表
//!
//! 所有工具（本地或 MCP 远程）实现 Tool trait，execute 统一返回 {success, data?, error?, message}。
//! ToolRegistry 按名注册与查找；同名注册后者覆盖前者并打印警告。
//! 目录以读为主，只在初始化 / 工具发现阶段写入，因此内部用 RwLock，调用时不持锁跨 await。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 工具执行结果三元组（外加人类可读 message）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ToolOutcome {
    pub fn ok(data: impl Into<Option<Value>>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: data.into(),
            error: None,
            message: message.into(),
        }
    }

    pub fn fail(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            message: message.into(),
        }
    }
}

/// 工具描述：名称、描述、参数 schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// 工具 trait：名称（JSON 中的 "tool" 字段）、描述（供 LLM 理解）、参数 schema、参数校验、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认空对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行前的参数校验，失败时 registry 直接返回「参数验证失败」
    fn validate_args(&self, _args: &Value) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> ToolOutcome;
}

/// 工具注册表
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        if tools.contains_key(&name) {
            tracing::warn!(tool = %name, "Tool already registered, overwriting");
        }
        tools.insert(name.clone(), tool);
        tracing::info!(tool = %name, "Registered tool");
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按名称排序的工具名
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// 当前目录快照（按名称排序）
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ToolDescriptor> = tools
            .iter()
            .map(|(name, tool)| ToolDescriptor {
                name: name.clone(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// 生成提示词中的工具 schema JSON
    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.descriptors()).unwrap_or_else(|_| "[]".to_string())
    }

    /// 按名执行；未注册的名字不报错，返回 success=false 并列出相似 / 可用工具
    pub async fn execute(&self, name: &str, args: Value) -> ToolOutcome {
        let Some(tool) = self.get(name) else {
            return self.unknown_tool(name);
        };

        if !tool.validate_args(&args) {
            return ToolOutcome::fail("Invalid arguments", "参数验证失败");
        }

        tool.execute(args).await
    }

    fn unknown_tool(&self, name: &str) -> ToolOutcome {
        let available = self.tool_names();
        let lower = name.to_lowercase();
        let similar: Vec<&String> = available
            .iter()
            .filter(|t| {
                let t = t.to_lowercase();
                !lower.is_empty() && (t.contains(&lower) || lower.contains(&t))
            })
            .collect();

        let suggestion = if !similar.is_empty() {
            format!(
                " 您是否想使用: {}?",
                similar.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            )
        } else if !available.is_empty() {
            format!(" 可用工具: {}", available.join(", "))
        } else {
            " 可用工具: 无".to_string()
        };

        tracing::warn!(tool = %name, "Unknown tool requested");
        ToolOutcome {
            success: false,
            data: Some(serde_json::json!({
                "available_tools": available,
                "similar_tools": similar,
            })),
            error: Some(format!("Tool '{name}' not found")),
            message: format!("工具 '{name}' 不存在{suggestion}"),
        }
    }
}
