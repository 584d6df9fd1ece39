//! 核心数据类型：任务、子任务、动作、结果、上下文、决策、反思、工具使用记录

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

/// 动作类型：gui（交互式界面操作）、code（代码执行）、mcp（远程工具）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    #[default]
    Gui,
    Code,
    Mcp,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Gui => "gui",
            ActionKind::Code => "code",
            ActionKind::Mcp => "mcp",
        }
    }

    /// 宽松解析：未知取值回落为 gui
    pub fn parse_lossy(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl FromStr for ActionKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "gui" => Ok(ActionKind::Gui),
            "code" => Ok(ActionKind::Code),
            "mcp" => Ok(ActionKind::Mcp),
            other => Err(AgentError::Validation(format!("unknown action type: {other}"))),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// 执行模式，构造 Orchestrator 时确定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// 预定义步骤
    Workflow,
    /// LLM 逐步决策
    #[default]
    Agent,
}

impl FromStr for ExecutionMode {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "agent" => Ok(ExecutionMode::Agent),
            "workflow" => Ok(ExecutionMode::Workflow),
            other => Err(AgentError::Config(format!("unknown execution mode: {other}"))),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Agent => f.write_str("agent"),
            ExecutionMode::Workflow => f.write_str("workflow"),
        }
    }
}

/// 一次工具调用；交给 Worker 后不再修改（Worker 在副本上补全别名与 target）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default)]
    pub kind: ActionKind,
    pub tool: String,
    #[serde(default = "empty_object")]
    pub args: Value,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 超时（秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Action {
    pub fn new(kind: ActionKind, tool: impl Into<String>, args: Value) -> Self {
        Self {
            kind,
            tool: tool.into(),
            args,
            description: String::new(),
            dependencies: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// 不带时间戳的动作键：`{type}_{tool}`
    pub fn key(&self) -> String {
        format!("{}_{}", self.kind, self.tool)
    }

    /// 从宽松 JSON 投影（缺省字段补默认值，type 无法识别时回落为 gui）
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let tool = obj.get("tool")?.as_str()?.to_string();
        let kind = obj
            .get("type")
            .and_then(|v| v.as_str())
            .map(ActionKind::parse_lossy)
            .unwrap_or_default();
        let args = match obj.get("args") {
            Some(v @ Value::Object(_)) => v.clone(),
            _ => empty_object(),
        };
        Some(Self {
            kind,
            tool,
            args,
            description: obj
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            dependencies: string_list(obj.get("dependencies")),
            timeout: obj.get("timeout").and_then(|v| v.as_u64()),
        })
    }
}

/// 子任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Subtask {
    /// 从已校验过的 JSON 投影
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            id: obj.get("id")?.as_str()?.to_string(),
            description: obj
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            actions: obj
                .get("actions")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(Action::from_value).collect())
                .unwrap_or_default(),
            dependencies: string_list(obj.get("dependencies")),
            status: TaskStatus::Pending,
        })
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|d| d.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// 任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub goal: String,
    pub subtasks: Vec<Subtask>,
    pub status: TaskStatus,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

impl Task {
    pub fn new(goal: impl Into<String>) -> Self {
        let now = Local::now();
        Self {
            id: new_task_id(),
            goal: goal.into(),
            subtasks: Vec::new(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Local::now();
    }
}

/// `task_` + 8 位十六进制
pub fn new_task_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("task_{}", &simple[..8])
}

/// 单次 Worker 调用的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    /// 实际分发的工具名（别名规范化之后）
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub message: String,
    /// 执行耗时（秒）
    pub execution_time: f64,
    pub timestamp: DateTime<Local>,
}

impl ActionResult {
    pub fn failure(action_id: impl Into<String>, tool: impl Into<String>, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            tool: tool.into(),
            success: false,
            data: None,
            error: Some(error.into()),
            message: message.into(),
            execution_time: 0.0,
            timestamp: Local::now(),
        }
    }
}

/// 每个任务独占的执行上下文
#[derive(Debug, Clone)]
pub struct Context {
    pub task: Task,
    pub current_subtask_id: Option<String>,
    pub action_results: Vec<ActionResult>,
    /// 变量按插入顺序保存，便于提示词只取最近若干个
    pub variables: Vec<(String, Value)>,
    pub screen_state: Option<Value>,
}

impl Context {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            current_subtask_id: None,
            action_results: Vec::new(),
            variables: Vec::new(),
            screen_state: None,
        }
    }

    /// 写入变量；已存在的键原位覆盖
    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(slot) = self.variables.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.variables.push((key, value));
        }
    }

    pub fn get_var(&self, key: &str) -> Option<&Value> {
        self.variables.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn extend_vars(&mut self, vars: &HashMap<String, Value>) {
        let mut keys: Vec<_> = vars.keys().collect();
        keys.sort();
        for key in keys {
            self.set_var(key.clone(), vars[key].clone());
        }
    }

    /// 变量表的 JSON 视图
    pub fn variables_json(&self) -> Value {
        Value::Object(self.variables.iter().cloned().collect())
    }
}

/// AgentExecutor 每轮得到的决策（未持久化）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepDecision {
    pub action: Option<Action>,
    pub should_continue: bool,
    pub should_retry: bool,
    pub should_skip: bool,
    pub reasoning: String,
    pub confidence: f64,
    pub next_step_description: String,
}

impl Default for StepDecision {
    fn default() -> Self {
        Self {
            action: None,
            should_continue: true,
            should_retry: false,
            should_skip: false,
            reasoning: String::new(),
            confidence: 0.0,
            next_step_description: String::new(),
        }
    }
}

impl StepDecision {
    /// 停止决策（解析或调用失败时使用）
    pub fn stop(reasoning: impl Into<String>) -> Self {
        Self {
            should_continue: false,
            reasoning: reasoning.into(),
            ..Self::default()
        }
    }
}

/// 反思结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub task_id: String,
    pub success: bool,
    pub analysis: String,
    pub suggestions: Vec<String>,
    pub needs_replan: bool,
    pub confidence: f64,
    pub timestamp: DateTime<Local>,
}

/// 工具使用记录（交给持久化层）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub success: bool,
    pub execution_time: f64,
    pub error: Option<String>,
    pub timestamp: DateTime<Local>,
}

impl From<&ActionResult> for ToolUsage {
    fn from(r: &ActionResult) -> Self {
        Self {
            tool_name: if r.tool.is_empty() {
                "unknown".to_string()
            } else {
                r.tool.clone()
            },
            success: r.success,
            execution_time: r.execution_time,
            error: r.error.clone(),
            timestamp: r.timestamp,
        }
    }
}

/// 执行器返回的任务结果
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub success: bool,
    pub status: TaskStatus,
    pub action_results: Vec<ActionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflection: Option<Reflection>,
    pub step_count: usize,
    pub variables: Value,
    /// 工作流模式下已执行的步骤 id
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub executed_steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
