//! 错误分类与恢复策略
//!
//! ErrorHandler 把一次失败映射为错误类型（先看类型族名，再按中英文关键词表匹配），
//! 再由静态表得到恢复策略（重试 / 跳过 / 中止 / 备用方案 / 人工干预），并给出退避延迟。
//! 历史记录只用于观测（summary），不参与决策。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;

use crate::core::worker::RetryPolicy;
use crate::core::AgentError;
use crate::llm::{LlmClient, SamplingParams};

/// 退避延迟上限（秒）
const MAX_RETRY_DELAY_SECS: f64 = 60.0;

/// 错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ElementNotFound,
    PermissionDenied,
    #[serde(rename = "network_error")]
    Network,
    #[serde(rename = "json_parse_error")]
    JsonParse,
    #[serde(rename = "tool_execution_error")]
    ToolExecution,
    #[serde(rename = "validation_error")]
    Validation,
    #[serde(rename = "unknown_error")]
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ElementNotFound => "element_not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Network => "network_error",
            ErrorKind::JsonParse => "json_parse_error",
            ErrorKind::ToolExecution => "tool_execution_error",
            ErrorKind::Validation => "validation_error",
            ErrorKind::Unknown => "unknown_error",
        }
    }

    /// 该错误类型的默认恢复策略
    pub fn default_strategy(&self) -> RecoveryStrategy {
        match self {
            ErrorKind::Timeout
            | ErrorKind::ElementNotFound
            | ErrorKind::Network
            | ErrorKind::ToolExecution => RecoveryStrategy::Retry,
            ErrorKind::JsonParse => RecoveryStrategy::Fallback,
            ErrorKind::PermissionDenied | ErrorKind::Validation => RecoveryStrategy::Abort,
            ErrorKind::Unknown => RecoveryStrategy::ManualIntervention,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 关键词表，顺序即匹配优先级
const KEYWORD_TABLE: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::Timeout, &["timeout", "超时", "timed out", "time out"]),
    (
        ErrorKind::ElementNotFound,
        &[
            "not found",
            "未找到",
            "找不到",
            "element not found",
            "selector not found",
            "no such element",
        ],
    ),
    (
        ErrorKind::PermissionDenied,
        &["permission", "权限", "denied", "forbidden", "access denied"],
    ),
    (
        ErrorKind::Network,
        &[
            "network",
            "网络",
            "connection",
            "连接",
            "failed to connect",
            "connection refused",
            "connection timeout",
        ],
    ),
    (
        ErrorKind::JsonParse,
        &["json", "parse", "解析", "decode", "invalid json", "json decode error"],
    ),
    (
        ErrorKind::ToolExecution,
        &["tool", "工具", "execution", "执行", "failed to execute"],
    ),
    (
        ErrorKind::Validation,
        &["validation", "验证", "invalid", "无效", "validate"],
    ),
];

/// 恢复策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    Skip,
    Abort,
    Fallback,
    ManualIntervention,
}

impl RecoveryStrategy {
    fn base_confidence(&self) -> f64 {
        match self {
            RecoveryStrategy::Retry => 0.7,
            RecoveryStrategy::Skip => 0.5,
            RecoveryStrategy::Abort => 0.9,
            RecoveryStrategy::Fallback => 0.6,
            RecoveryStrategy::ManualIntervention => 0.3,
        }
    }
}

/// 一次失败的上下文
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub kind: ErrorKind,
    pub message: String,
    pub action_id: Option<String>,
    pub tool_name: Option<String>,
    pub args: Value,
    /// 此前已重试的次数
    pub retry_count: u32,
    pub timestamp: DateTime<Local>,
    pub metadata: HashMap<String, Value>,
}

impl ErrorContext {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            action_id: None,
            tool_name: None,
            args: Value::Object(Default::default()),
            retry_count: 0,
            timestamp: Local::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_action(mut self, action_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        self.action_id = Some(action_id.into());
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// 派生出的恢复动作（不存储）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAction {
    pub strategy: RecoveryStrategy,
    pub should_retry: bool,
    /// 基础重试延迟（秒）
    pub retry_delay: f64,
    pub max_retries: u32,
    pub confidence: f64,
    pub message: String,
}

/// summary() 输出的单条记录
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub error_type: ErrorKind,
    pub error_message: String,
    pub action_id: Option<String>,
    pub tool_name: Option<String>,
    pub retry_count: u32,
    pub timestamp: String,
}

/// 错误处理器：分类、恢复策略、退避、历史
#[derive(Debug, Default)]
pub struct ErrorHandler {
    history: Mutex<Vec<ErrorContext>>,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 对 AgentError 分类：先看类型族名，再看消息
    pub fn classify(&self, error: &AgentError) -> ErrorKind {
        classify_parts(error.family(), &error.to_string())
    }

    /// 对纯文本失败消息分类（如工具返回的 error 字段）
    pub fn classify_message(&self, message: &str) -> ErrorKind {
        classify_parts("Error", message)
    }

    /// 构造错误上下文并写入历史
    pub fn record(&self, ctx: ErrorContext) -> ErrorContext {
        tracing::debug!(
            kind = %ctx.kind,
            tool = ctx.tool_name.as_deref().unwrap_or("-"),
            retry_count = ctx.retry_count,
            "error recorded"
        );
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(ctx.clone());
        ctx
    }

    /// 由 AgentError 创建上下文（自动分类并记录）
    pub fn context_for(&self, error: &AgentError, retry_count: u32) -> ErrorContext {
        let kind = self.classify(error);
        self.record(ErrorContext::new(kind, error.to_string()).with_retry_count(retry_count))
    }

    /// 恢复策略：纯函数，只依赖 (类型, 重试次数, max_retries)
    pub fn recovery_strategy(&self, ctx: &ErrorContext, max_retries: u32, retry_delay: f64) -> RecoveryAction {
        recovery_for(ctx.kind, ctx.retry_count, max_retries, retry_delay)
    }

    /// 是否应重试
    pub fn should_retry(&self, ctx: &ErrorContext, max_retries: u32) -> bool {
        if ctx.retry_count >= max_retries {
            return false;
        }
        self.recovery_strategy(ctx, max_retries, 1.0).should_retry
    }

    /// 退避延迟（秒）：base * 2^retry_count，上限 60；关闭指数退避时为 base
    pub fn retry_delay(&self, ctx: &ErrorContext, base: f64, exponential: bool) -> f64 {
        retry_delay_secs(ctx.retry_count, base, exponential)
    }

    pub fn retry_delay_duration(&self, ctx: &ErrorContext, base: f64, exponential: bool) -> Duration {
        Duration::from_secs_f64(self.retry_delay(ctx, base, exponential).max(0.0))
    }

    /// 调用 oracle：失败经分类与恢复策略决定是否退避重试；预算耗尽或策略不建议重试时返回最后一次错误
    pub async fn generate_with_recovery(
        &self,
        llm: &dyn LlmClient,
        prompt: &str,
        params: &SamplingParams,
        policy: &RetryPolicy,
    ) -> Result<String, AgentError> {
        let attempts = policy.max_retries.max(1);
        let mut attempt = 0u32;
        loop {
            let error = match llm.generate(prompt, params).await {
                Ok(text) => return Ok(text),
                Err(e) => e,
            };
            let ctx = self.record(
                ErrorContext::new(self.classify(&error), error.to_string())
                    .with_action("oracle_generate", "llm")
                    .with_retry_count(attempt),
            );
            if attempt + 1 >= attempts {
                tracing::warn!(kind = %ctx.kind, attempts, "Oracle call failed after all attempts");
                return Err(error);
            }
            let recovery = self.recovery_strategy(&ctx, attempts, policy.retry_delay);
            if !recovery.should_retry {
                tracing::warn!(kind = %ctx.kind, strategy = ?recovery.strategy, "Oracle error is not retryable");
                return Err(error);
            }
            let delay = self.retry_delay_duration(&ctx, policy.retry_delay, policy.exponential_backoff);
            attempt += 1;
            tracing::info!(
                kind = %ctx.kind,
                attempt = attempt + 1,
                max = attempts,
                delay_secs = delay.as_secs_f64(),
                "Retrying oracle call"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// 最近 limit 条错误记录
    pub fn summary(&self, limit: usize) -> Vec<ErrorRecord> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let start = history.len().saturating_sub(limit);
        history[start..]
            .iter()
            .map(|e| ErrorRecord {
                error_type: e.kind,
                error_message: e.message.clone(),
                action_id: e.action_id.clone(),
                tool_name: e.tool_name.clone(),
                retry_count: e.retry_count,
                timestamp: e.timestamp.to_rfc3339(),
            })
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
        tracing::info!("Error history cleared");
    }
}

/// 按类型族名与消息分类
pub fn classify_parts(type_name: &str, message: &str) -> ErrorKind {
    if type_name.contains("Timeout") || type_name.contains("timeout") {
        return ErrorKind::Timeout;
    }
    if type_name.contains("JSON") || type_name.contains("json") {
        return ErrorKind::JsonParse;
    }
    if type_name.contains("Permission") || type_name.contains("Forbidden") {
        return ErrorKind::PermissionDenied;
    }
    if type_name.contains("Network") || type_name.contains("Connection") {
        return ErrorKind::Network;
    }

    let lower = message.to_lowercase();
    KEYWORD_TABLE
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

fn recovery_for(kind: ErrorKind, retry_count: u32, max_retries: u32, retry_delay: f64) -> RecoveryAction {
    let mut strategy = kind.default_strategy();
    if retry_count >= max_retries && strategy == RecoveryStrategy::Retry {
        strategy = match kind {
            ErrorKind::Timeout | ErrorKind::Network => RecoveryStrategy::Skip,
            _ => RecoveryStrategy::Abort,
        };
    }
    let should_retry = strategy == RecoveryStrategy::Retry && retry_count < max_retries;

    let mut confidence = strategy.base_confidence();
    match (kind, strategy) {
        (ErrorKind::Timeout | ErrorKind::Network, RecoveryStrategy::Retry) => confidence = 0.8,
        (ErrorKind::PermissionDenied, RecoveryStrategy::Abort) => confidence = 0.95,
        _ => {}
    }
    if retry_count > 0 {
        confidence *= 0.9;
    }

    let message = match strategy {
        RecoveryStrategy::Retry => format!("检测到{}错误，将重试（第{}次）", kind, retry_count + 1),
        RecoveryStrategy::Skip => format!("检测到{}错误，跳过当前步骤", kind),
        RecoveryStrategy::Abort => format!("检测到{}错误，中止任务执行", kind),
        RecoveryStrategy::Fallback => format!("检测到{}错误，使用备用方案", kind),
        RecoveryStrategy::ManualIntervention => format!("检测到{}错误，需要人工干预", kind),
    };

    RecoveryAction {
        strategy,
        should_retry,
        retry_delay,
        max_retries,
        confidence: confidence.clamp(0.0, 1.0),
        message,
    }
}

fn retry_delay_secs(retry_count: u32, base: f64, exponential: bool) -> f64 {
    if !exponential {
        return base;
    }
    let factor = 2f64.powi(retry_count.min(63) as i32);
    (base * factor).min(MAX_RETRY_DELAY_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_classify_by_family_first() {
        let handler = ErrorHandler::new();
        // 消息里有 permission，但类型族是超时
        let err = AgentError::Timeout("permission check took too long".into());
        assert_eq!(handler.classify(&err), ErrorKind::Timeout);
        let err = AgentError::Network("oops".into());
        assert_eq!(handler.classify(&err), ErrorKind::Network);
        let err = AgentError::JsonParse("bad".into());
        assert_eq!(handler.classify(&err), ErrorKind::JsonParse);
    }

    #[test]
    fn test_classify_keywords_in_order() {
        let handler = ErrorHandler::new();
        assert_eq!(handler.classify_message("Element not found: #go"), ErrorKind::ElementNotFound);
        assert_eq!(handler.classify_message("操作超时"), ErrorKind::Timeout);
        // timeout 优先于 network
        assert_eq!(handler.classify_message("connection timeout"), ErrorKind::Timeout);
        assert_eq!(handler.classify_message("Access Denied"), ErrorKind::PermissionDenied);
        assert_eq!(handler.classify_message("网络不可用"), ErrorKind::Network);
        assert_eq!(handler.classify_message("could not parse output"), ErrorKind::JsonParse);
        assert_eq!(handler.classify_message("工具崩溃"), ErrorKind::ToolExecution);
        assert_eq!(handler.classify_message("invalid argument"), ErrorKind::Validation);
        assert_eq!(handler.classify_message("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn test_strategy_table() {
        let handler = ErrorHandler::new();
        let cases = [
            (ErrorKind::Timeout, RecoveryStrategy::Retry),
            (ErrorKind::ElementNotFound, RecoveryStrategy::Retry),
            (ErrorKind::Network, RecoveryStrategy::Retry),
            (ErrorKind::ToolExecution, RecoveryStrategy::Retry),
            (ErrorKind::JsonParse, RecoveryStrategy::Fallback),
            (ErrorKind::PermissionDenied, RecoveryStrategy::Abort),
            (ErrorKind::Validation, RecoveryStrategy::Abort),
            (ErrorKind::Unknown, RecoveryStrategy::ManualIntervention),
        ];
        for (kind, expected) in cases {
            let action = handler.recovery_strategy(&ErrorContext::new(kind, "x"), 3, 1.0);
            assert_eq!(action.strategy, expected, "{kind}");
        }
    }

    #[test]
    fn test_retry_demoted_when_exhausted() {
        let handler = ErrorHandler::new();
        let ctx = ErrorContext::new(ErrorKind::Timeout, "t").with_retry_count(3);
        let action = handler.recovery_strategy(&ctx, 3, 1.0);
        assert_eq!(action.strategy, RecoveryStrategy::Skip);
        assert!(!action.should_retry);

        let ctx = ErrorContext::new(ErrorKind::ElementNotFound, "e").with_retry_count(3);
        let action = handler.recovery_strategy(&ctx, 3, 1.0);
        assert_eq!(action.strategy, RecoveryStrategy::Abort);
        assert!(!handler.should_retry(&ctx, 3));
    }

    #[test]
    fn test_recovery_strategy_is_idempotent() {
        let handler = ErrorHandler::new();
        for kind in [ErrorKind::Timeout, ErrorKind::Validation, ErrorKind::Unknown] {
            for retry in 0..5 {
                let ctx = ErrorContext::new(kind, "m").with_retry_count(retry);
                let a = handler.recovery_strategy(&ctx, 3, 1.0);
                let b = handler.recovery_strategy(&ctx, 3, 1.0);
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn test_confidence_adjustments() {
        let handler = ErrorHandler::new();
        let a = handler.recovery_strategy(&ErrorContext::new(ErrorKind::Network, "n"), 3, 1.0);
        assert!((a.confidence - 0.8).abs() < 1e-9);
        let a = handler.recovery_strategy(&ErrorContext::new(ErrorKind::PermissionDenied, "p"), 3, 1.0);
        assert!((a.confidence - 0.95).abs() < 1e-9);
        let ctx = ErrorContext::new(ErrorKind::ToolExecution, "t").with_retry_count(1);
        let a = handler.recovery_strategy(&ctx, 3, 1.0);
        assert!((a.confidence - 0.63).abs() < 1e-9);
        assert_eq!(a.message, "检测到tool_execution_error错误，将重试（第2次）");
    }

    #[test]
    fn test_retry_delay() {
        let handler = ErrorHandler::new();
        let ctx = ErrorContext::new(ErrorKind::Timeout, "t").with_retry_count(3);
        assert_eq!(handler.retry_delay(&ctx, 1.0, true), 8.0);
        let ctx = ErrorContext::new(ErrorKind::Timeout, "t").with_retry_count(10);
        assert_eq!(handler.retry_delay(&ctx, 1.0, true), 60.0);
        assert_eq!(handler.retry_delay(&ctx, 1.5, false), 1.5);
    }

    #[tokio::test]
    async fn test_oracle_timeout_is_retried_then_surfaced() {
        let handler = ErrorHandler::new();
        let llm = MockLlmClient::failing("request timed out");
        let policy = RetryPolicy {
            max_retries: 3,
            retry_delay: 0.0,
            exponential_backoff: true,
        };
        let err = handler
            .generate_with_recovery(&llm, "p", &SamplingParams::default(), &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm(_)));
        assert_eq!(llm.call_count(), 3);
        let summary = handler.summary(10);
        assert_eq!(summary.len(), 3);
        assert!(summary.iter().all(|r| r.error_type == ErrorKind::Timeout));
        assert_eq!(summary[2].retry_count, 2);
        assert_eq!(summary[0].tool_name.as_deref(), Some("llm"));
    }

    #[tokio::test]
    async fn test_oracle_unknown_error_is_not_retried() {
        let handler = ErrorHandler::new();
        let llm = MockLlmClient::failing("quota exhausted");
        let result = handler
            .generate_with_recovery(&llm, "p", &SamplingParams::default(), &RetryPolicy::default())
            .await;
        assert!(result.is_err());
        assert_eq!(llm.call_count(), 1);
        assert_eq!(handler.history_len(), 1);
    }

    #[tokio::test]
    async fn test_oracle_success_leaves_no_history() {
        let handler = ErrorHandler::new();
        let llm = MockLlmClient::scripted(["ok"]);
        let text = handler
            .generate_with_recovery(&llm, "p", &SamplingParams::default(), &RetryPolicy::default())
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(handler.history_len(), 0);
    }

    #[test]
    fn test_summary_returns_most_recent() {
        let handler = ErrorHandler::new();
        for i in 0..5 {
            handler.record(ErrorContext::new(ErrorKind::Unknown, format!("e{i}")));
        }
        let summary = handler.summary(2);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].error_message, "e3");
        assert_eq!(summary[1].error_message, "e4");
        handler.clear_history();
        assert_eq!(handler.history_len(), 0);
    }
}
