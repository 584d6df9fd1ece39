//! 工具执行器
//!
//! 持有共享的 ToolRegistry 与默认超时，execute(tool_name, args, timeout) 在超时内调用 registry.execute；
//! 超时转为 success=false 的结果（错误文本含 "timed out"，ErrorHandler 据此归类为 timeout）。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::tools::{Tool, ToolDescriptor, ToolOutcome, ToolRegistry};

/// 工具执行器：对每次调用施加超时并记录审计
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// 执行指定工具；`timeout_override` 为动作自带的超时（秒）
    pub async fn execute(&self, tool_name: &str, args: Value, timeout_override: Option<u64>) -> ToolOutcome {
        let limit = timeout_override
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(limit, self.registry.execute(tool_name, args)).await;

        let outcome = match &result {
            Ok(o) if o.success => "ok",
            Ok(_) => "error",
            Err(_) => "timeout",
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(o) => o,
            Err(_) => ToolOutcome::fail(
                format!("Tool '{}' timed out after {}s", tool_name, limit.as_secs()),
                format!("工具 {tool_name} 执行超时"),
            ),
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.has(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.registry.descriptors()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
