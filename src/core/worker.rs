//! Worker：执行单个动作（含别名规范化、自动定位 target、ErrorHandler 驱动的重试）

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::recovery::{ErrorContext, ErrorHandler};
use crate::core::types::{Action, ActionKind, ActionResult};
use crate::tools::{ElementLocator, ToolDescriptor, ToolExecutor, ToolOutcome};

/// 常见中文工具名到规范名的映射
const TOOL_ALIASES: [(&str, &str); 8] = [
    ("浏览器", "navigate"),
    ("导航", "navigate"),
    ("打开", "navigate"),
    ("点击", "click"),
    ("输入", "input"),
    ("滚动", "scroll"),
    ("截图", "screenshot"),
    ("等待", "wait"),
];

/// 需要 target 参数的交互工具
const TARGETED_TOOLS: [&str; 2] = ["click", "input"];

/// 重试参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// 基础重试延迟（秒）
    pub retry_delay: f64,
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: 1.0,
            exponential_backoff: true,
        }
    }
}

pub struct Worker {
    executor: ToolExecutor,
    locator: Option<Arc<dyn ElementLocator>>,
    error_handler: Arc<ErrorHandler>,
    policy: RetryPolicy,
}

impl Worker {
    pub fn new(executor: ToolExecutor, policy: RetryPolicy) -> Self {
        Self {
            executor,
            locator: None,
            error_handler: Arc::new(ErrorHandler::new()),
            policy,
        }
    }

    pub fn with_locator(mut self, locator: Arc<dyn ElementLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.error_handler
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.executor.descriptors()
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// 别名规范化：已注册的名字原样返回；别名命中且目标已注册时替换
    pub fn normalize_tool_name(&self, tool: &str) -> String {
        if self.executor.has_tool(tool) {
            return tool.to_string();
        }
        match TOOL_ALIASES.iter().find(|(alias, _)| *alias == tool) {
            Some((_, canonical)) if self.executor.has_tool(canonical) => {
                tracing::warn!(tool, mapped = canonical, "Tool name not found, using mapped name");
                canonical.to_string()
            }
            _ => tool.to_string(),
        }
    }

    /// 执行单个动作（不重试）
    pub async fn execute_action(&self, action: &Action) -> ActionResult {
        let start = Instant::now();
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let action_id = format!("{}_{}_{}", action.kind, action.tool, secs);
        tracing::info!(tool = %action.tool, description = %action.description, "Executing action");

        let (tool, outcome) = match action.kind {
            ActionKind::Gui => self.execute_gui(action).await,
            ActionKind::Code => (
                action.tool.clone(),
                ToolOutcome::fail("Code execution not implemented yet", "代码执行功能尚未实现"),
            ),
            ActionKind::Mcp => (
                action.tool.clone(),
                self.executor
                    .execute(&action.tool, action.args.clone(), action.timeout)
                    .await,
            ),
        };

        ActionResult {
            action_id,
            tool,
            success: outcome.success,
            data: outcome.data,
            error: outcome.error,
            message: outcome.message,
            execution_time: start.elapsed().as_secs_f64(),
            timestamp: Local::now(),
        }
    }

    async fn execute_gui(&self, action: &Action) -> (String, ToolOutcome) {
        let tool = self.normalize_tool_name(&action.tool);
        let mut args = match &action.args {
            Value::Object(_) => action.args.clone(),
            _ => Value::Object(Default::default()),
        };

        let has_target = args
            .get("target")
            .map_or(false, |t| !t.is_null() && t.as_str() != Some(""));
        if TARGETED_TOOLS.contains(&tool.as_str()) && !has_target {
            match &self.locator {
                Some(locator) => {
                    tracing::info!(tool = %tool, "Missing target, attempting to locate element");
                    let element_type = if tool == "input" { "input" } else { "button" };
                    match locator.locate(&action.description, element_type).await {
                        Some(selector) => {
                            tracing::info!(selector = %selector, "Auto-found target");
                            args["target"] = Value::String(selector);
                        }
                        None => {
                            return (
                                tool,
                                ToolOutcome::fail(
                                    "Could not find target element",
                                    format!("无法找到目标元素: {}", action.description),
                                ),
                            );
                        }
                    }
                }
                None => tracing::warn!("Element locator not available, cannot auto-find target"),
            }
        }

        let outcome = self.executor.execute(&tool, args, action.timeout).await;
        (tool, outcome)
    }

    /// 带重试执行：每次失败交给 ErrorHandler 分类，策略不建议重试时提前停止
    pub async fn execute_with_retry(&self, action: &Action) -> ActionResult {
        self.execute_with_policy(action, &self.policy).await
    }

    pub async fn execute_with_policy(&self, action: &Action, policy: &RetryPolicy) -> ActionResult {
        let attempts = policy.max_retries.max(1);
        let mut attempt = 0u32;
        loop {
            let result = self.execute_action(action).await;
            if result.success {
                return result;
            }

            let error = result
                .error
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| result.message.clone());
            let kind = self.error_handler.classify_message(&error);
            let ctx = self.error_handler.record(
                ErrorContext::new(kind, error)
                    .with_action(action.key(), result.tool.clone())
                    .with_args(action.args.clone())
                    .with_retry_count(attempt),
            );

            if attempt + 1 >= attempts {
                tracing::warn!(tool = %action.tool, attempts, "Action failed after all attempts");
                return result;
            }
            let recovery = self
                .error_handler
                .recovery_strategy(&ctx, attempts, policy.retry_delay);
            if !recovery.should_retry {
                tracing::warn!(
                    tool = %action.tool,
                    strategy = ?recovery.strategy,
                    "Recovery strategy suggests not retrying"
                );
                return result;
            }

            let delay = self
                .error_handler
                .retry_delay_duration(&ctx, policy.retry_delay, policy.exponential_backoff);
            attempt += 1;
            tracing::info!(
                tool = %action.tool,
                attempt = attempt + 1,
                max = attempts,
                delay_secs = delay.as_secs_f64(),
                message = %recovery.message,
                "Retrying action"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// 按顺序执行动作列表；依赖未满足的动作直接记为失败
    pub async fn execute_actions(&self, actions: &[Action]) -> Vec<ActionResult> {
        let mut results: Vec<ActionResult> = Vec::with_capacity(actions.len());
        for action in actions {
            let unmet = action
                .dependencies
                .iter()
                .any(|dep| !results.iter().any(|r| r.success && satisfies(r, dep)));
            if unmet {
                tracing::warn!(tool = %action.tool, deps = ?action.dependencies, "Action has unmet dependencies");
                results.push(ActionResult::failure(
                    action.key(),
                    action.tool.clone(),
                    "Unmet dependencies",
                    "依赖的动作未成功执行",
                ));
                continue;
            }
            let result = self.execute_with_retry(action).await;
            if !result.success {
                tracing::warn!(message = %result.message, "Action failed");
            }
            results.push(result);
        }
        results
    }
}

/// 依赖可以写完整动作 id、不带时间戳的动作键或工具名
fn satisfies(result: &ActionResult, dep: &str) -> bool {
    result.action_id == dep || result.action_id.starts_with(&format!("{dep}_")) || result.tool == dep
}
