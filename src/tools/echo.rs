//! Echo 工具（测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolOutcome};

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text (for testing). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        crate::tools::schema::params_schema::<crate::tools::schema::EchoParams>()
    }

    async fn execute(&self, args: Value) -> ToolOutcome {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        ToolOutcome::ok(Value::String(text.to_string()), format!("回显: {text}"))
    }
}
