//! Agent 错误类型
//!
//! 与 ErrorHandler 配合：变体本身即错误「类型族」，分类时先看 family()，再按消息关键词匹配。

use thiserror::Error;

/// 编排过程中可能出现的错误（超时、解析、权限、网络、工具、配置等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// 错误类型族名称（对应异常类型名），供 ErrorHandler 先于关键词匹配使用
    pub fn family(&self) -> &'static str {
        match self {
            AgentError::Timeout(_) => "TimeoutError",
            AgentError::JsonParse(_) => "JSONDecodeError",
            AgentError::PermissionDenied(_) => "PermissionError",
            AgentError::Network(_) => "ConnectionError",
            AgentError::ToolExecution(_) => "ToolError",
            AgentError::ToolNotFound(_) => "ToolError",
            AgentError::Validation(_) => "ValidationError",
            AgentError::Llm(_) => "LlmError",
            AgentError::Mcp(_) => "McpError",
            AgentError::Workflow(_) => "WorkflowError",
            AgentError::Config(_) => "ConfigError",
            AgentError::Io(_) => "IoError",
            AgentError::Other(_) => "Error",
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::JsonParse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AgentError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        AgentError::Timeout(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_names() {
        assert_eq!(AgentError::Timeout("x".into()).family(), "TimeoutError");
        assert_eq!(AgentError::Network("x".into()).family(), "ConnectionError");
        assert_eq!(AgentError::Other("x".into()).family(), "Error");
    }

    #[test]
    fn test_from_serde_json() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let agent_err: AgentError = err.into();
        assert!(matches!(agent_err, AgentError::JsonParse(_)));
    }
}
