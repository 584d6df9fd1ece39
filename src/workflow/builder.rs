//! 工作流构建器
//!
//! 提供流畅的 API 来构建工作流；文件与 JSON 值加载同样经过这里的校验

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::core::types::{Action, ActionKind};
use crate::workflow::types::*;

/// 工作流构建器
pub struct WorkflowBuilder {
    id: WorkflowId,
    name: String,
    description: String,
    version: String,
    steps: Vec<WorkflowStep>,
    variables: HashMap<String, Value>,
    on_complete: Option<String>,
    on_error: Option<String>,
}

impl WorkflowBuilder {
    /// 创建新的工作流构建器
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: "workflow_1".to_string(),
            name: name.into(),
            description: String::new(),
            version: "1.0".to_string(),
            steps: Vec::new(),
            variables: HashMap::new(),
            on_complete: None,
            on_error: None,
        }
    }

    pub fn id(mut self, id: impl Into<WorkflowId>) -> Self {
        self.id = id.into();
        self
    }

    /// 设置描述
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// 添加初始变量
    pub fn variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// 追加步骤（按添加顺序执行）
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// 设置完成钩子
    pub fn on_complete(mut self, hook: impl Into<String>) -> Self {
        self.on_complete = Some(hook.into());
        self
    }

    /// 设置工作流级出错策略
    pub fn on_error(mut self, policy: impl Into<String>) -> Self {
        self.on_error = Some(policy.into());
        self
    }

    /// 构建工作流：步骤 id 不能重复，动作必须有工具名
    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowError::InvalidDefinition(format!("duplicate step id '{}'", step.id)));
            }
            if step.action.tool.trim().is_empty() {
                return Err(WorkflowError::InvalidDefinition(format!(
                    "step '{}' has no action tool",
                    step.id
                )));
            }
        }

        Ok(WorkflowDefinition {
            id: self.id,
            name: self.name,
            description: self.description,
            version: self.version,
            steps: self.steps,
            variables: self.variables,
            on_complete: self.on_complete,
            on_error: self.on_error,
        })
    }

    /// 从 JSON/YAML 解析出的值构建；缺省字段取默认值
    pub fn from_value(data: &Value) -> Result<WorkflowDefinition, WorkflowError> {
        let obj = data
            .as_object()
            .ok_or_else(|| WorkflowError::InvalidDefinition("workflow must be a mapping".to_string()))?;
        let text = |key: &str| obj.get(key).and_then(|v| v.as_str()).map(str::to_string);

        let mut builder = WorkflowBuilder::new(text("name").unwrap_or_else(|| "Unnamed Workflow".to_string()))
            .description(text("description").unwrap_or_default());
        if let Some(id) = text("id") {
            builder = builder.id(id);
        }
        match obj.get("version") {
            Some(Value::String(v)) => builder = builder.version(v.clone()),
            Some(Value::Number(n)) => builder = builder.version(n.to_string()),
            _ => {}
        }
        match obj.get("variables") {
            None | Some(Value::Null) => {}
            Some(Value::Object(vars)) => {
                for (k, v) in vars {
                    builder = builder.variable(k.clone(), v.clone());
                }
            }
            Some(_) => return Err(WorkflowError::InvalidDefinition("'variables' must be a mapping".to_string())),
        }
        builder.on_complete = text("on_complete");
        builder.on_error = text("on_error");

        let steps = match obj.get("steps") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(steps)) => steps.clone(),
            Some(_) => return Err(WorkflowError::InvalidDefinition("'steps' must be a list".to_string())),
        };
        for (idx, step) in steps.iter().enumerate() {
            builder = builder.step(parse_step(idx, step)?);
        }
        builder.build()
    }
}

fn parse_step(idx: usize, data: &Value) -> Result<WorkflowStep, WorkflowError> {
    let obj = data
        .as_object()
        .ok_or_else(|| WorkflowError::InvalidDefinition(format!("step {idx} must be a mapping")))?;
    let text = |key: &str| obj.get(key).and_then(|v| v.as_str()).map(str::to_string);

    let id = text("id").unwrap_or_else(|| format!("step_{}", idx + 1));
    let description = text("description").unwrap_or_default();
    let timeout = obj.get("timeout").and_then(|v| v.as_u64());
    let retry_count = obj
        .get("retry_count")
        .and_then(|v| v.as_u64())
        .map(|n| n.min(u64::from(u32::MAX)) as u32)
        .unwrap_or(0);

    let action_data = obj.get("action").and_then(|a| a.as_object());
    let action_text = |key: &str| {
        action_data
            .and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let kind = ActionKind::parse_lossy(action_text("type").as_deref().unwrap_or("gui"));
    let args = action_data
        .and_then(|a| a.get("args"))
        .filter(|a| a.is_object())
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    let mut action = Action::new(kind, action_text("tool").unwrap_or_default(), args)
        .with_description(action_text("description").unwrap_or_else(|| description.clone()));
    if let Some(secs) = timeout {
        action = action.with_timeout(secs);
    }

    Ok(WorkflowStep {
        name: text("name").unwrap_or_else(|| id.clone()),
        id,
        description,
        action,
        condition: text("condition").filter(|c| !c.trim().is_empty()),
        on_error: text("on_error"),
        retry_count,
        timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_simple_workflow() {
        let workflow = WorkflowBuilder::new("Test Workflow")
            .description("A test workflow")
            .step(WorkflowStep::new("open", Action::new(ActionKind::Gui, "navigate", json!({"url": "https://a.com"}))))
            .step(WorkflowStep::new("shot", Action::new(ActionKind::Gui, "screenshot", json!({}))).with_on_error("skip"))
            .build()
            .expect("Failed to build workflow");

        assert_eq!(workflow.name, "Test Workflow");
        assert_eq!(workflow.steps.len(), 2);
        assert_eq!(workflow.error_policy(&workflow.steps[1]), ErrorPolicy::Skip);
    }

    #[test]
    fn test_duplicate_step_id_fails() {
        let step = WorkflowStep::new("a", Action::new(ActionKind::Gui, "wait", json!({})));
        let result = WorkflowBuilder::new("Test").step(step.clone()).step(step).build();
        assert!(matches!(result, Err(WorkflowError::InvalidDefinition(_))));
    }

    #[test]
    fn test_from_value_defaults() {
        let wf = WorkflowBuilder::from_value(&json!({
            "steps": [
                {"description": "打开首页", "timeout": 10, "retry_count": 2,
                 "action": {"type": "bogus", "tool": "navigate", "args": {"url": "https://a.com"}}},
                {"id": "b", "condition": "  ", "action": {"tool": "wait"}}
            ]
        }))
        .unwrap();
        assert_eq!(wf.id, "workflow_1");
        assert_eq!(wf.name, "Unnamed Workflow");
        assert_eq!(wf.version, "1.0");
        let first = &wf.steps[0];
        assert_eq!(first.id, "step_1");
        assert_eq!(first.action.kind, ActionKind::Gui);
        assert_eq!(first.action.description, "打开首页");
        assert_eq!(first.action.timeout, Some(10));
        assert_eq!(first.attempts(), 2);
        assert_eq!(wf.steps[1].condition, None);
        assert_eq!(wf.steps[1].action.args, json!({}));
    }

    #[test]
    fn test_from_value_rejects_missing_tool() {
        let err = WorkflowBuilder::from_value(&json!({"steps": [{"action": {"type": "gui"}}]})).unwrap_err();
        assert!(err.to_string().contains("no action tool"));
        assert!(WorkflowBuilder::from_value(&json!([1])).is_err());
    }
}
