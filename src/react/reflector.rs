//! Reflector：执行结束后让 LLM 评估结果、给出建议，并判断是否需要重新规划
//!
//! 反思响应只做代码块剥离，不走修复流程；解析失败时给出「需要重规划、置信度 0」的固定结果。

use std::sync::Arc;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{ActionResult, Reflection, Task};
use crate::llm::output_parser::strip_fences;
use crate::llm::prompts::{error_analysis_prompt, reflection_prompt};
use crate::llm::{LlmClient, SamplingParams};

/// 提示词中最多携带的结果条数（取最近的）
const REFLECTION_WINDOW: usize = 20;

/// 反思响应的宽松投影
#[derive(Debug, Deserialize)]
struct ReflectionPayload {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    suggestions: Vec<String>,
    #[serde(default)]
    needs_replan: bool,
    #[serde(default)]
    confidence: f64,
}

impl ReflectionPayload {
    fn unparsable() -> Self {
        Self {
            success: false,
            analysis: "无法解析反思结果".to_string(),
            suggestions: Vec::new(),
            needs_replan: true,
            confidence: 0.0,
        }
    }
}

/// 错误分析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub error_type: String,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub solution: String,
    #[serde(default)]
    pub should_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_action: Option<Value>,
}

impl ErrorAnalysis {
    /// 关键词分类，LLM 不可用或回复无法解析时使用
    pub fn from_keywords(error: &str) -> Self {
        let lower = error.to_lowercase();
        let (error_type, cause, solution, should_retry) = if lower.contains("timeout") || lower.contains("超时") {
            ("timeout", "操作超时", "增加超时时间或检查网络连接", true)
        } else if lower.contains("not found") || lower.contains("未找到") {
            ("element_not_found", "元素未找到", "检查选择器是否正确，或等待元素加载", true)
        } else if lower.contains("permission") || lower.contains("权限") {
            ("permission_denied", "权限不足", "检查权限设置", false)
        } else {
            ("unknown", "未知错误", "查看详细错误信息", true)
        };
        Self {
            error_type: error_type.to_string(),
            cause: cause.to_string(),
            solution: solution.to_string(),
            should_retry,
            alternative_action: None,
        }
    }
}

/// 策略有效性评估
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyEvaluation {
    pub strategy: String,
    pub total_actions: usize,
    pub success_count: usize,
    pub success_rate: f64,
    pub avg_execution_time: f64,
    /// 成功率超过 70%
    pub effective: bool,
}

pub struct Reflector {
    llm: Arc<dyn LlmClient>,
    params: SamplingParams,
}

impl Reflector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            params: SamplingParams::default(),
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    /// 反思任务执行结果；LLM 出错时返回带默认建议的失败反思
    pub async fn reflect(&self, task: &Task, results: &[ActionResult], current_state: &str) -> Reflection {
        tracing::info!(task_id = %task.id, results = results.len(), "Reflecting on task");
        let window = &results[results.len().saturating_sub(REFLECTION_WINDOW)..];
        let prompt = reflection_prompt(&task.goal, window, current_state);

        let payload = match self.llm.generate(&prompt, &self.params).await {
            Ok(response) => parse_reflection(&response),
            Err(e) => {
                tracing::error!(error = %e, "Reflection error");
                ReflectionPayload {
                    success: false,
                    analysis: format!("反思过程出错: {e}"),
                    suggestions: vec!["检查执行日志".to_string(), "重试任务".to_string()],
                    needs_replan: true,
                    confidence: 0.0,
                }
            }
        };

        Reflection {
            task_id: task.id.clone(),
            success: payload.success,
            analysis: payload.analysis,
            suggestions: payload.suggestions,
            needs_replan: payload.needs_replan,
            confidence: payload.confidence.clamp(0.0, 1.0),
            timestamp: Local::now(),
        }
    }

    /// 分析单个错误：先问 LLM，失败时退回关键词分类
    pub async fn analyze_error(&self, error: &str, action: &Value, context: &str) -> ErrorAnalysis {
        let prompt = error_analysis_prompt(error, action, context);
        match self.llm.generate(&prompt, &SamplingParams::with_temperature(0.1)).await {
            Ok(response) => match serde_json::from_str::<ErrorAnalysis>(strip_fences(response.trim()).trim()) {
                Ok(analysis) => analysis,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse error analysis, using keyword fallback");
                    ErrorAnalysis::from_keywords(error)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Error analysis unavailable, using keyword fallback");
                ErrorAnalysis::from_keywords(error)
            }
        }
    }

    /// 评估一组结果对应策略的有效性
    pub fn evaluate_strategy(strategy: &str, results: &[ActionResult]) -> StrategyEvaluation {
        let total = results.len();
        let success_count = results.iter().filter(|r| r.success).count();
        let (success_rate, avg_execution_time) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                success_count as f64 / total as f64,
                results.iter().map(|r| r.execution_time).sum::<f64>() / total as f64,
            )
        };
        StrategyEvaluation {
            strategy: strategy.to_string(),
            total_actions: total,
            success_count,
            success_rate,
            avg_execution_time,
            effective: success_rate > 0.7,
        }
    }
}

fn parse_reflection(response: &str) -> ReflectionPayload {
    let body = strip_fences(response.trim()).trim();
    match serde_json::from_str::<ReflectionPayload>(body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse reflection response as JSON");
            tracing::debug!(response = body, "Reflection response content");
            ReflectionPayload::unparsable()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    fn result(success: bool, secs: f64) -> ActionResult {
        let mut r = ActionResult::failure("gui_click", "click", "boom", "失败");
        r.success = success;
        r.execution_time = secs;
        r
    }

    #[tokio::test]
    async fn test_reflect_fenced_json() {
        let llm = Arc::new(MockLlmClient::scripted([r#"```json
{"success": true, "analysis": "全部完成", "suggestions": [], "needs_replan": false, "confidence": 0.9}
```"#]));
        let reflection = Reflector::new(llm).reflect(&Task::new("g"), &[result(true, 0.1)], "").await;
        assert!(reflection.success);
        assert_eq!(reflection.analysis, "全部完成");
        assert!((reflection.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reflect_unparsable_is_needs_replan() {
        // 反思不走修复流程：单引号 JSON 视为无法解析
        let llm = Arc::new(MockLlmClient::scripted(["{'success': true}"]));
        let reflection = Reflector::new(llm).reflect(&Task::new("g"), &[], "").await;
        assert!(!reflection.success);
        assert!(reflection.needs_replan);
        assert_eq!(reflection.confidence, 0.0);
        assert_eq!(reflection.analysis, "无法解析反思结果");
    }

    #[tokio::test]
    async fn test_reflect_llm_error() {
        let llm = Arc::new(MockLlmClient::failing("offline"));
        let reflection = Reflector::new(llm).reflect(&Task::new("g"), &[], "").await;
        assert!(reflection.analysis.starts_with("反思过程出错"));
        assert_eq!(reflection.suggestions, vec!["检查执行日志", "重试任务"]);
    }

    #[tokio::test]
    async fn test_analyze_error() {
        let llm = Arc::new(MockLlmClient::scripted([
            r#"{"error_type": "element_not_found", "cause": "选择器错误", "solution": "换选择器", "should_retry": true}"#,
        ]));
        let reflector = Reflector::new(llm);
        let analysis = reflector
            .analyze_error("Element not found: #go", &json!({"type": "gui", "tool": "click"}), "")
            .await;
        assert_eq!(analysis.cause, "选择器错误");

        let offline = Reflector::new(Arc::new(MockLlmClient::failing("offline")));
        let analysis = offline.analyze_error("Permission denied", &json!({}), "").await;
        assert_eq!(analysis.error_type, "permission_denied");
        assert!(!analysis.should_retry);
    }

    #[test]
    fn test_evaluate_strategy() {
        let results = vec![result(true, 1.0), result(true, 2.0), result(true, 3.0), result(false, 2.0)];
        let eval = Reflector::evaluate_strategy("逐步执行", &results);
        assert_eq!(eval.success_count, 3);
        assert!((eval.success_rate - 0.75).abs() < 1e-9);
        assert!((eval.avg_execution_time - 2.0).abs() < 1e-9);
        assert!(eval.effective);
        assert!(!Reflector::evaluate_strategy("空", &[]).effective);
    }
}
