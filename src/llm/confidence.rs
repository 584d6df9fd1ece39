//! 置信度评估器
//!
//! 总体置信度 = 工具选择 × w1 + 参数质量 × w2 + 结构有效性 × w3 + 一致性 × w4（默认 0.3/0.2/0.2/0.3）。
//! should_accept 为单阈值比较（默认 0.6）；high_confidence（默认 0.8）区分 high 与 medium。

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::validator::{MCP_PREFIX, STANDARD_TOOLS};
use crate::tools::ToolDescriptor;

/// 参数值长度超过该值时扣分
const LONG_PARAM_CHARS: usize = 1000;
/// 默认保留的评估历史条数，超出后丢弃最早的记录
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// 阈值与权重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThreshold {
    #[serde(default = "default_min")]
    pub min_confidence: f64,
    #[serde(default = "default_high")]
    pub high_confidence: f64,
    #[serde(default = "default_tool_weight")]
    pub tool_weight: f64,
    #[serde(default = "default_minor_weight")]
    pub param_weight: f64,
    #[serde(default = "default_minor_weight")]
    pub structure_weight: f64,
    #[serde(default = "default_tool_weight")]
    pub consistency_weight: f64,
}

fn default_min() -> f64 {
    0.6
}
fn default_high() -> f64 {
    0.8
}
fn default_tool_weight() -> f64 {
    0.3
}
fn default_minor_weight() -> f64 {
    0.2
}

impl Default for ConfidenceThreshold {
    fn default() -> Self {
        Self {
            min_confidence: default_min(),
            high_confidence: default_high(),
            tool_weight: default_tool_weight(),
            param_weight: default_minor_weight(),
            structure_weight: default_minor_weight(),
            consistency_weight: default_tool_weight(),
        }
    }
}

/// 置信度分数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceScore {
    pub overall: f64,
    pub tool_selection: f64,
    pub parameter_quality: f64,
    pub structure_validity: f64,
    pub consistency: f64,
}

/// 置信度级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone)]
struct Evaluation {
    timestamp: DateTime<Local>,
    score: f64,
    accepted: bool,
}

/// 历史统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfidenceStatistics {
    pub total_decisions: usize,
    pub accepted_count: usize,
    pub rejected_count: usize,
    pub acceptance_rate: f64,
    pub average_confidence: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub high_confidence_count: usize,
    pub medium_confidence_count: usize,
    pub low_confidence_count: usize,
    /// 保留窗口内最早与最近一次评估的时间
    pub first_evaluated_at: Option<DateTime<Local>>,
    pub last_evaluated_at: Option<DateTime<Local>>,
}

/// 置信度评估器
#[derive(Debug)]
pub struct ConfidenceEvaluator {
    threshold: ConfidenceThreshold,
    history: Mutex<VecDeque<Evaluation>>,
    history_limit: usize,
}

impl Default for ConfidenceEvaluator {
    fn default() -> Self {
        Self::new(ConfidenceThreshold::default())
    }
}

fn decision_action(decision: &Value) -> Option<&Value> {
    decision.get("action").filter(|a| !a.is_null())
}

impl ConfidenceEvaluator {
    pub fn new(threshold: ConfidenceThreshold) -> Self {
        Self {
            threshold,
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// 设置历史保留条数（至少 1）
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn threshold(&self) -> &ConfidenceThreshold {
        &self.threshold
    }

    /// 评估单个决策（`{"action": {...}, ...}` 或裸动作 `{"tool": ..., "args": ...}`）
    pub fn evaluate(&self, decision: &Value, tools: &[ToolDescriptor], consistency: Option<f64>) -> ConfidenceScore {
        let tool_selection = self.tool_selection_score(decision, tools);
        let parameter_quality = self.parameter_score(decision);
        let structure_validity = self.structure_score(decision);
        let consistency = consistency.unwrap_or(0.0);

        let t = &self.threshold;
        let overall = tool_selection * t.tool_weight
            + parameter_quality * t.param_weight
            + structure_validity * t.structure_weight
            + consistency * t.consistency_weight;

        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            while history.len() >= self.history_limit {
                history.pop_front();
            }
            history.push_back(Evaluation {
                timestamp: Local::now(),
                score: overall,
                accepted: overall >= t.min_confidence,
            });
        }

        ConfidenceScore {
            overall,
            tool_selection,
            parameter_quality,
            structure_validity,
            consistency,
        }
    }

    /// 规划的置信度：各动作分数的平均；没有动作时为 0
    pub fn evaluate_plan(&self, plan: &Value, tools: &[ToolDescriptor], consistency: Option<f64>) -> ConfidenceScore {
        let actions: Vec<&Value> = plan
            .get("subtasks")
            .and_then(|s| s.as_array())
            .into_iter()
            .flatten()
            .filter_map(|s| s.get("actions").and_then(|a| a.as_array()))
            .flatten()
            .collect();

        if actions.is_empty() {
            return ConfidenceScore {
                overall: consistency.unwrap_or(0.0) * self.threshold.consistency_weight,
                tool_selection: 0.0,
                parameter_quality: 0.0,
                structure_validity: 0.0,
                consistency: consistency.unwrap_or(0.0),
            };
        }

        let n = actions.len() as f64;
        let (mut tool, mut param, mut structure) = (0.0, 0.0, 0.0);
        for a in &actions {
            tool += self.tool_selection_score(a, tools);
            param += self.parameter_score(a);
            structure += self.structure_score(a);
        }
        let consistency = consistency.unwrap_or(0.0);
        let t = &self.threshold;
        let (tool, param, structure) = (tool / n, param / n, structure / n);
        ConfidenceScore {
            overall: tool * t.tool_weight
                + param * t.param_weight
                + structure * t.structure_weight
                + consistency * t.consistency_weight,
            tool_selection: tool,
            parameter_quality: param,
            structure_validity: structure,
            consistency,
        }
    }

    fn tool_selection_score(&self, decision: &Value, tools: &[ToolDescriptor]) -> f64 {
        let tool_name = match decision_action(decision) {
            Some(action) => action.get("tool"),
            None => decision.get("tool"),
        }
        .and_then(|t| t.as_str())
        .unwrap_or_default();

        if tool_name.is_empty() {
            return 0.0;
        }
        if tool_name.starts_with(MCP_PREFIX) || tools.iter().any(|t| t.name == tool_name) {
            return 1.0;
        }
        if !tools.is_empty() {
            tracing::warn!(tool = %tool_name, "Tool not in available tools list");
            return 0.3;
        }
        if STANDARD_TOOLS.contains(&tool_name) {
            1.0
        } else {
            0.7
        }
    }

    fn parameter_score(&self, decision: &Value) -> f64 {
        let args = match decision_action(decision) {
            Some(action) => action.get("args"),
            None => decision.get("args"),
        };
        let Some(args) = args.and_then(|a| a.as_object()).filter(|a| !a.is_empty()) else {
            return 0.8;
        };
        let mut score = 1.0;
        for value in args.values() {
            match value {
                Value::Null => score *= 0.8,
                Value::String(s) if s.is_empty() => score *= 0.8,
                Value::String(s) if s.chars().count() > LONG_PARAM_CHARS => score *= 0.9,
                _ => {}
            }
        }
        score
    }

    fn structure_score(&self, decision: &Value) -> f64 {
        let mut score = 1.0;
        match decision.get("action") {
            Some(Value::Object(action)) => {
                if !action.contains_key("tool") {
                    score *= 0.3;
                }
                if !action.contains_key("type") {
                    score *= 0.8;
                }
                if !action.contains_key("args") {
                    score *= 0.8;
                }
            }
            Some(_) => return 0.0,
            None if decision.get("tool").is_none() => return 0.0,
            None => {}
        }
        if let Some(v) = decision.get("should_continue") {
            if !v.is_boolean() {
                score *= 0.8;
            }
        }
        if let Some(c) = decision.get("confidence").and_then(|c| c.as_f64()) {
            if !(0.0..=1.0).contains(&c) {
                score *= 0.5;
            }
        }
        score
    }

    pub fn should_accept(&self, score: &ConfidenceScore) -> bool {
        score.overall >= self.threshold.min_confidence
    }

    pub fn confidence_level(&self, score: &ConfidenceScore) -> ConfidenceLevel {
        if score.overall >= self.threshold.high_confidence {
            ConfidenceLevel::High
        } else if score.overall >= self.threshold.min_confidence {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    pub fn recommendation(&self, score: &ConfidenceScore) -> String {
        match self.confidence_level(score) {
            ConfidenceLevel::High => "高置信度，可以执行".to_string(),
            ConfidenceLevel::Medium => "中等置信度，建议执行但需要监控".to_string(),
            ConfidenceLevel::Low => {
                let mut issues = Vec::new();
                if score.tool_selection < 0.5 {
                    issues.push("工具选择不确定");
                }
                if score.parameter_quality < 0.5 {
                    issues.push("参数质量较低");
                }
                if score.structure_validity < 0.5 {
                    issues.push("结构有效性不足");
                }
                if score.consistency < 0.5 {
                    issues.push("一致性较低");
                }
                if issues.is_empty() {
                    "低置信度，建议重新生成或人工确认".to_string()
                } else {
                    format!("低置信度，不建议执行。问题：{}", issues.join(", "))
                }
            }
        }
    }

    pub fn statistics(&self) -> ConfidenceStatistics {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.is_empty() {
            return ConfidenceStatistics::default();
        }
        let total = history.len();
        let accepted = history.iter().filter(|h| h.accepted).count();
        let scores: Vec<f64> = history.iter().map(|h| h.score).collect();
        let t = &self.threshold;
        ConfidenceStatistics {
            total_decisions: total,
            accepted_count: accepted,
            rejected_count: total - accepted,
            acceptance_rate: accepted as f64 / total as f64,
            average_confidence: scores.iter().sum::<f64>() / total as f64,
            min_confidence: scores.iter().cloned().fold(f64::INFINITY, f64::min),
            max_confidence: scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            high_confidence_count: scores.iter().filter(|s| **s >= t.high_confidence).count(),
            medium_confidence_count: scores
                .iter()
                .filter(|s| **s >= t.min_confidence && **s < t.high_confidence)
                .count(),
            low_confidence_count: scores.iter().filter(|s| **s < t.min_confidence).count(),
            first_evaluated_at: history.front().map(|h| h.timestamp),
            last_evaluated_at: history.back().map(|h| h.timestamp),
        }
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clear();
        tracing::info!("Confidence evaluation history cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_full_decision_with_consistency() {
        let e = ConfidenceEvaluator::default();
        let d = json!({"action": {"type": "gui", "tool": "navigate", "args": {"url": "https://a.com"}}, "should_continue": true, "confidence": 0.9});
        let s = e.evaluate(&d, &[], Some(1.0));
        assert!(approx(s.overall, 1.0));
        assert_eq!(e.confidence_level(&s), ConfidenceLevel::High);
    }

    #[test]
    fn test_unknown_tool_against_catalogue() {
        let e = ConfidenceEvaluator::default();
        let tools = vec![ToolDescriptor {
            name: "navigate".into(),
            description: String::new(),
            parameters: json!({}),
        }];
        let d = json!({"tool": "teleport", "args": {}});
        let s = e.evaluate(&d, &tools, None);
        assert!(approx(s.tool_selection, 0.3));
        assert!(approx(s.parameter_quality, 0.8));
        // 0.3*0.3 + 0.8*0.2 + 1.0*0.2 + 0
        assert!(approx(s.overall, 0.45));
        assert!(!e.should_accept(&s));
        assert!(e.recommendation(&s).contains("工具选择不确定"));
    }

    #[test]
    fn test_structure_penalties() {
        let e = ConfidenceEvaluator::default();
        let d = json!({"action": {"tool": "plausible"}, "confidence": 3});
        let s = e.evaluate(&d, &[], None);
        assert!(approx(s.structure_validity, 0.8 * 0.8 * 0.5));
        assert!(approx(s.tool_selection, 0.7));
        assert!(approx(e.evaluate(&json!({"reasoning": "x"}), &[], None).structure_validity, 0.0));
    }

    #[test]
    fn test_statistics() {
        let e = ConfidenceEvaluator::default();
        e.evaluate(&json!({"action": {"type": "gui", "tool": "click", "args": {"target": "#a"}}}), &[], Some(1.0));
        e.evaluate(&json!({}), &[], None);
        let stats = e.statistics();
        assert_eq!(stats.total_decisions, 2);
        assert_eq!(stats.accepted_count, 1);
        assert_eq!(stats.low_confidence_count, 1);
        assert!(stats.first_evaluated_at <= stats.last_evaluated_at);
        assert!(stats.last_evaluated_at.is_some());
        e.clear_history();
        assert_eq!(e.statistics().total_decisions, 0);
        assert!(e.statistics().first_evaluated_at.is_none());
    }

    #[test]
    fn test_history_is_capped() {
        let e = ConfidenceEvaluator::default().with_history_limit(3);
        e.evaluate(&json!({}), &[], None);
        for _ in 0..4 {
            e.evaluate(&json!({"action": {"type": "gui", "tool": "click", "args": {"target": "#a"}}}), &[], Some(1.0));
        }
        let stats = e.statistics();
        assert_eq!(stats.total_decisions, 3);
        // 最早的低分记录已被丢弃
        assert_eq!(stats.low_confidence_count, 0);
        assert_eq!(stats.accepted_count, 3);
    }
}
