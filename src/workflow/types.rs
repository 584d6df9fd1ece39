//! 工作流类型定义
//!
//! 定义工作流、步骤、出错策略等核心数据类型

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::error::AgentError;
use crate::core::types::Action;

pub type WorkflowId = String;
pub type StepId = String;

/// 步骤失败后的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// 立即结束整个工作流
    Abort,
    /// 记录后进入下一步
    Skip,
    /// 不做特殊处理，继续执行
    #[default]
    Continue,
}

impl ErrorPolicy {
    /// 只识别 abort / skip，其余取值（包括缺省）都按 Continue 处理
    pub fn parse_lossy(s: Option<&str>) -> Self {
        match s.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("abort") => ErrorPolicy::Abort,
            Some("skip") => ErrorPolicy::Skip,
            _ => ErrorPolicy::Continue,
        }
    }
}

/// 工作流步骤
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowStep {
    pub id: StepId,
    pub name: String,
    pub description: String,
    pub action: Action,
    /// 受限布尔表达式；为空时总是执行
    pub condition: Option<String>,
    /// 步骤级出错策略，未设置时使用工作流级策略
    pub on_error: Option<String>,
    /// 尝试次数，最少 1 次
    pub retry_count: u32,
    pub timeout: Option<u64>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<StepId>, action: Action) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: action.description.clone(),
            action,
            condition: None,
            on_error: None,
            retry_count: 0,
            timeout: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_on_error(mut self, policy: impl Into<String>) -> Self {
        self.on_error = Some(policy.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// 实际尝试次数
    pub fn attempts(&self) -> u32 {
        self.retry_count.max(1)
    }
}

/// 工作流定义（一次运行内只读）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub version: String,
    pub steps: Vec<WorkflowStep>,
    /// 初始变量；`keywords` 列表用于目标匹配
    pub variables: HashMap<String, Value>,
    /// 完成钩子：`set <变量> = <表达式>`，以分号分隔
    pub on_complete: Option<String>,
    /// 工作流级出错策略
    pub on_error: Option<String>,
}

impl WorkflowDefinition {
    /// 步骤的生效出错策略
    pub fn error_policy(&self, step: &WorkflowStep) -> ErrorPolicy {
        ErrorPolicy::parse_lossy(step.on_error.as_deref().or(self.on_error.as_deref()))
    }

    /// `variables.keywords` 中的字符串
    pub fn keywords(&self) -> Vec<&str> {
        self.variables
            .get("keywords")
            .and_then(|k| k.as_array())
            .map(|arr| arr.iter().filter_map(|k| k.as_str()).collect())
            .unwrap_or_default()
    }
}

/// 工作流错误类型
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Workflow file not found: {0}")]
    NotFound(String),
    #[error("Failed to read workflow file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid workflow JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),
    #[error("Expression error: {0}")]
    Expression(String),
}

impl From<WorkflowError> for AgentError {
    fn from(e: WorkflowError) -> Self {
        AgentError::Workflow(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ActionKind;
    use serde_json::json;

    #[test]
    fn test_error_policy_lossy() {
        assert_eq!(ErrorPolicy::parse_lossy(Some("ABORT")), ErrorPolicy::Abort);
        assert_eq!(ErrorPolicy::parse_lossy(Some("skip")), ErrorPolicy::Skip);
        assert_eq!(ErrorPolicy::parse_lossy(Some("retry")), ErrorPolicy::Continue);
        assert_eq!(ErrorPolicy::parse_lossy(None), ErrorPolicy::Continue);
    }

    #[test]
    fn test_step_policy_overrides_workflow() {
        let step = WorkflowStep::new("s1", Action::new(ActionKind::Gui, "wait", json!({})));
        let mut wf = WorkflowDefinition {
            id: "wf".into(),
            name: "n".into(),
            description: String::new(),
            version: "1.0".into(),
            steps: vec![step.clone()],
            variables: HashMap::new(),
            on_complete: None,
            on_error: Some("abort".into()),
        };
        assert_eq!(wf.error_policy(&step), ErrorPolicy::Abort);
        assert_eq!(wf.error_policy(&step.clone().with_on_error("skip")), ErrorPolicy::Skip);
        wf.on_error = None;
        assert_eq!(wf.error_policy(&step), ErrorPolicy::Continue);
        assert_eq!(step.attempts(), 1);
    }
}
