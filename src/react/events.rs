//! 执行过程事件：供 CLI / 前端实时展示决策、工具调用、观察与反思

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 当前第几步
    StepUpdate { step: usize, max_steps: usize },
    /// 正在调用 LLM 决策
    Thinking,
    /// 解析出的决策
    Decision {
        reasoning: String,
        confidence: f64,
        should_continue: bool,
    },
    /// 置信度低于阈值（仍会执行，只做提示）
    LowConfidence { score: f64, recommendation: String },
    /// 调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation { tool: String, preview: String },
    /// 工具执行失败
    ToolFailure { tool: String, reason: String },
    /// 跳过本步
    Skipped { reasoning: String },
    /// 反思结果
    Reflection {
        success: bool,
        analysis: String,
        needs_replan: bool,
    },
    /// 用户取消
    Cancelled,
    /// 任务结束
    Finished { success: bool, steps: usize },
    /// 错误
    Error { text: String },
}
