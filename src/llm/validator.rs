//! 输出验证器
//!
//! 校验 LLM 输出（plan / decision / action）的工具选择、参数、结构与 JSON 有效性。
//! 区分 errors（导致无效）与 warnings（只记录）；结果计数喂给 UncertaintyTracker。

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::tools::ToolDescriptor;

/// 参数字符串的长度上限
const MAX_PARAM_CHARS: usize = 10_000;

/// 内置交互工具名
pub const STANDARD_TOOLS: [&str; 6] = ["navigate", "click", "input", "scroll", "screenshot", "wait"];

/// 远程（MCP）工具名前缀
pub const MCP_PREFIX: &str = "mcp_";

/// 待校验的输出类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Plan,
    Decision,
    Action,
    Generic,
}

/// 验证结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub tool_valid: bool,
    pub parameters_valid: bool,
    pub structure_valid: bool,
    pub json_valid: bool,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            tool_valid: true,
            parameters_valid: true,
            structure_valid: true,
            json_valid: true,
        }
    }
}

impl ValidationReport {
    fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
            ..Self::default()
        }
    }

    fn finish(mut self) -> Self {
        self.is_valid = self.structure_valid && self.tool_valid && self.parameters_valid;
        self
    }
}

/// 输出验证器
#[derive(Debug, Clone)]
pub struct OutputValidator {
    tool_names: HashSet<String>,
    strict: bool,
}

impl Default for OutputValidator {
    fn default() -> Self {
        Self::new(&[], true)
    }
}

impl OutputValidator {
    pub fn new(tools: &[ToolDescriptor], strict: bool) -> Self {
        Self {
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            strict,
        }
    }

    pub fn update_available_tools(&mut self, tools: &[ToolDescriptor]) {
        self.tool_names = tools.iter().map(|t| t.name.clone()).collect();
        tracing::debug!(count = self.tool_names.len(), "Updated validator tool list");
    }

    /// 校验原始文本（先解析 JSON）
    pub fn validate_str(&self, output: &str, kind: OutputKind) -> ValidationReport {
        match serde_json::from_str::<Value>(output) {
            Ok(v) => self.validate(&v, kind),
            Err(e) => {
                let mut report = ValidationReport::invalid(vec![format!("JSON解析失败: {e}")]);
                report.json_valid = false;
                report
            }
        }
    }

    pub fn validate(&self, output: &Value, kind: OutputKind) -> ValidationReport {
        let Some(obj) = output.as_object() else {
            return ValidationReport::invalid(vec!["输出必须是字典格式".to_string()]);
        };

        let mut report = match kind {
            OutputKind::Plan => self.validate_plan(obj),
            OutputKind::Decision => self.validate_decision(obj),
            OutputKind::Action => self.validate_action(obj),
            OutputKind::Generic => {
                let mut r = ValidationReport::default();
                if obj.is_empty() {
                    r.warnings.push("数据为空字典".to_string());
                }
                r
            }
        };
        if self.strict && !report.errors.is_empty() {
            report.is_valid = false;
        }
        report
    }

    fn validate_plan(&self, plan: &Map<String, Value>) -> ValidationReport {
        let mut report = ValidationReport::default();
        let Some(subtasks) = plan.get("subtasks") else {
            report.errors.push("缺少'subtasks'字段".to_string());
            report.structure_valid = false;
            return report.finish();
        };
        let Some(subtasks) = subtasks.as_array() else {
            report.errors.push("'subtasks'必须是列表".to_string());
            report.structure_valid = false;
            return report.finish();
        };

        for (idx, subtask) in subtasks.iter().enumerate() {
            let Some(subtask) = subtask.as_object() else {
                report.errors.push(format!("Subtask {idx} 必须是字典"));
                report.structure_valid = false;
                continue;
            };
            if !subtask.contains_key("id") {
                report.warnings.push(format!("Subtask {idx} 缺少'id'字段"));
            }
            if !subtask.contains_key("description") {
                report.warnings.push(format!("Subtask {idx} 缺少'description'字段"));
            }
            match subtask.get("actions") {
                None => {}
                Some(Value::Array(actions)) => {
                    for (a_idx, action) in actions.iter().enumerate() {
                        let Some(action) = action.as_object() else {
                            report
                                .errors
                                .push(format!("Subtask {idx}, Action {a_idx}: 动作必须是字典"));
                            report.structure_valid = false;
                            continue;
                        };
                        let sub = self.validate_action(action);
                        report.warnings.extend(sub.warnings);
                        if !sub.is_valid {
                            report
                                .errors
                                .extend(sub.errors.iter().map(|e| format!("Subtask {idx}, Action {a_idx}: {e}")));
                            report.tool_valid &= sub.tool_valid;
                            report.parameters_valid &= sub.parameters_valid;
                        }
                    }
                }
                Some(_) => {
                    report.errors.push(format!("Subtask {idx} 的'actions'必须是列表"));
                    report.structure_valid = false;
                }
            }
        }
        report.finish()
    }

    fn validate_decision(&self, decision: &Map<String, Value>) -> ValidationReport {
        let mut report = ValidationReport::default();
        match decision.get("action") {
            None | Some(Value::Null) => {}
            Some(Value::Object(action)) => {
                let sub = self.validate_action(action);
                report.warnings.extend(sub.warnings);
                if !sub.is_valid {
                    report.errors.extend(sub.errors);
                    report.tool_valid = sub.tool_valid;
                    report.parameters_valid = sub.parameters_valid;
                }
            }
            Some(_) => {
                report.errors.push("'action'必须是字典".to_string());
                report.structure_valid = false;
            }
        }
        if let Some(v) = decision.get("should_continue") {
            if !v.is_boolean() {
                report.warnings.push("'should_continue'应该是布尔值".to_string());
            }
        }
        if let Some(v) = decision.get("confidence") {
            match v.as_f64() {
                Some(c) if !(0.0..=1.0).contains(&c) => {
                    report.warnings.push("'confidence'应该在0-1之间".to_string())
                }
                Some(_) => {}
                None => report.warnings.push("'confidence'应该是数字".to_string()),
            }
        }
        report.finish()
    }

    fn validate_action(&self, action: &Map<String, Value>) -> ValidationReport {
        let mut report = ValidationReport::default();
        match action.get("tool") {
            None => {
                report.errors.push("缺少'tool'字段".to_string());
                report.structure_valid = false;
                report.tool_valid = false;
            }
            Some(Value::String(name)) => {
                if !self.tool_names.is_empty() && !self.tool_names.contains(name) && !name.starts_with(MCP_PREFIX) {
                    report.warnings.push(format!("工具'{name}'不在可用工具列表中"));
                    if self.strict {
                        report.tool_valid = false;
                    }
                }
            }
            Some(_) => {
                report.errors.push("'tool'必须是字符串".to_string());
                report.tool_valid = false;
            }
        }

        if let Some(kind) = action.get("type") {
            let known = kind.as_str().map(|k| matches!(k, "gui" | "code" | "mcp")).unwrap_or(false);
            if !known {
                report.warnings.push(format!("未知的动作类型: {kind}"));
            }
        }

        match action.get("args") {
            None => {}
            Some(Value::Object(args)) => {
                for (key, value) in args {
                    match value {
                        Value::Null => report.warnings.push(format!("参数'{key}'的值为None")),
                        Value::String(s) if s.is_empty() => {
                            report.warnings.push(format!("参数'{key}'为空字符串"))
                        }
                        Value::String(s) if s.chars().count() > MAX_PARAM_CHARS => report
                            .warnings
                            .push(format!("参数'{key}'的值过长（>{MAX_PARAM_CHARS}字符）")),
                        _ => {}
                    }
                }
            }
            Some(_) => {
                report.errors.push("'args'必须是字典".to_string());
                report.parameters_valid = false;
            }
        }
        report.finish()
    }

    /// 工具名是否可用：mcp_ 前缀与内置交互工具总是有效，其余查目录（目录为空时视为有效）
    pub fn validate_tool_name(&self, tool_name: &str) -> bool {
        if tool_name.is_empty() {
            return false;
        }
        if tool_name.starts_with(MCP_PREFIX) || STANDARD_TOOLS.contains(&tool_name) {
            return true;
        }
        self.tool_names.is_empty() || self.tool_names.contains(tool_name)
    }

    /// 内置交互工具的必需参数检查
    pub fn validate_parameters(&self, tool_name: &str, args: &Value) -> (bool, Vec<String>) {
        let Some(args) = args.as_object() else {
            return (false, vec!["参数必须是字典格式".to_string()]);
        };
        let has = |k: &str| args.contains_key(k);
        let mut errors = Vec::new();
        match tool_name {
            "navigate" if !has("url") => errors.push("navigate工具需要'url'参数".to_string()),
            "click" if !has("target") && !has("selector") && !has("x") && !has("y") => {
                errors.push("click工具需要'target'或'x'/'y'参数".to_string())
            }
            "input" => {
                if !has("target") && !has("selector") {
                    errors.push("input工具需要'target'参数".to_string());
                }
                if !has("value") && !has("text") {
                    errors.push("input工具需要'value'参数".to_string());
                }
            }
            "scroll" if !has("direction") && !has("amount") => {
                errors.push("scroll工具需要'direction'或'amount'参数".to_string())
            }
            _ => {}
        }
        (errors.is_empty(), errors)
    }
}
