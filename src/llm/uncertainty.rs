//! 不确定性跟踪
//!
//! 每次决策记录一致性、置信度、验证错误/警告数与工具不确定性（1 - 置信度），
//! 生成窗口化报告：平均值、高/低不确定性计数、常见错误、趋势（前后两半对比）与建议。
//! 历史只追加，进程内单写者；内部用 Mutex 以便 Arc 共享。

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// 趋势判定所需的最少记录数
const TREND_MIN_RECORDS: usize = 10;
/// 趋势判定的置信度差阈值
const TREND_DELTA: f64 = 0.05;

/// 单次决策的不确定性指标
#[derive(Debug, Clone, Serialize)]
pub struct UncertaintyMetrics {
    pub timestamp: DateTime<Utc>,
    /// 提示词指纹，用于识别重复提示词
    pub prompt_hash: String,
    /// 未使用 self-consistency 时为 0，不计入平均
    pub consistency_score: f64,
    pub confidence_score: f64,
    pub validation_errors: usize,
    pub validation_warnings: usize,
    pub sample_count: usize,
    pub valid_sample_count: usize,
    pub tool_name: Option<String>,
}

impl UncertaintyMetrics {
    pub fn new(prompt: &str, confidence_score: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            prompt_hash: prompt_hash(prompt),
            consistency_score: 0.0,
            confidence_score,
            validation_errors: 0,
            validation_warnings: 0,
            sample_count: 1,
            valid_sample_count: 1,
            tool_name: None,
        }
    }

    pub fn with_consistency(mut self, score: f64, samples: usize, valid: usize) -> Self {
        self.consistency_score = score;
        self.sample_count = samples;
        self.valid_sample_count = valid;
        self
    }

    pub fn with_validation(mut self, errors: usize, warnings: usize) -> Self {
        self.validation_errors = errors;
        self.validation_warnings = warnings;
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool_name = Some(tool.into());
        self
    }
}

/// 提示词指纹：SHA-256 前 16 个十六进制字符
fn prompt_hash(prompt: &str) -> String {
    let digest = hex::encode(Sha256::digest(prompt.as_bytes()));
    digest[..16].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Worsening,
}

/// 单个工具的不确定性统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolUncertainty {
    pub count: usize,
    pub average_uncertainty: f64,
    pub min_uncertainty: f64,
    pub max_uncertainty: f64,
}

/// 不确定性报告
#[derive(Debug, Clone, Serialize)]
pub struct UncertaintyReport {
    pub total_requests: usize,
    pub average_consistency: f64,
    pub average_confidence: f64,
    pub high_uncertainty_count: usize,
    pub low_uncertainty_count: usize,
    /// 常见错误（类别, 次数），按次数降序，最多 10 项
    pub common_errors: Vec<(String, usize)>,
    pub tool_uncertainty_map: BTreeMap<String, f64>,
    pub trend: Trend,
    pub recommendations: Vec<String>,
}

#[derive(Default)]
struct TrackerState {
    history: Vec<UncertaintyMetrics>,
    error_counter: BTreeMap<String, usize>,
    tool_uncertainty: BTreeMap<String, Vec<f64>>,
}

/// 不确定性跟踪器
pub struct UncertaintyTracker {
    /// 置信度低于此值视为高不确定性
    high_uncertainty_threshold: f64,
    /// 置信度不低于此值视为低不确定性
    low_uncertainty_threshold: f64,
    state: Mutex<TrackerState>,
}

impl Default for UncertaintyTracker {
    fn default() -> Self {
        Self::new(0.5, 0.8)
    }
}

impl UncertaintyTracker {
    pub fn new(high_uncertainty_threshold: f64, low_uncertainty_threshold: f64) -> Self {
        Self {
            high_uncertainty_threshold,
            low_uncertainty_threshold,
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, metrics: UncertaintyMetrics) {
        tracing::debug!(
            consistency = metrics.consistency_score,
            confidence = metrics.confidence_score,
            "Recorded uncertainty metrics"
        );
        let mut state = self.lock();
        if metrics.validation_errors > 0 {
            *state.error_counter.entry("validation_errors".to_string()).or_insert(0) += metrics.validation_errors;
        }
        if metrics.validation_warnings > 0 {
            *state.error_counter.entry("validation_warnings".to_string()).or_insert(0) += metrics.validation_warnings;
        }
        if let Some(tool) = &metrics.tool_name {
            state
                .tool_uncertainty
                .entry(tool.clone())
                .or_default()
                .push(1.0 - metrics.confidence_score);
        }
        state.history.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.lock().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 最近 N 条记录
    pub fn recent(&self, limit: usize) -> Vec<UncertaintyMetrics> {
        let state = self.lock();
        let start = state.history.len().saturating_sub(limit);
        state.history[start..].to_vec()
    }

    /// 生成报告；window 为 None 时分析全部历史
    pub fn report(&self, window: Option<usize>) -> UncertaintyReport {
        let state = self.lock();
        if state.history.is_empty() {
            return UncertaintyReport {
                total_requests: 0,
                average_consistency: 0.0,
                average_confidence: 0.0,
                high_uncertainty_count: 0,
                low_uncertainty_count: 0,
                common_errors: Vec::new(),
                tool_uncertainty_map: BTreeMap::new(),
                trend: Trend::Stable,
                recommendations: vec!["暂无数据".to_string()],
            };
        }

        let start = match window {
            Some(n) if n > 0 => state.history.len().saturating_sub(n),
            _ => 0,
        };
        let metrics = &state.history[start..];
        let total = metrics.len();

        let consistency: Vec<f64> = metrics
            .iter()
            .map(|m| m.consistency_score)
            .filter(|c| *c > 0.0)
            .collect();
        let average_consistency = mean(&consistency);
        let average_confidence = mean(&metrics.iter().map(|m| m.confidence_score).collect::<Vec<_>>());

        let high_uncertainty_count = metrics
            .iter()
            .filter(|m| m.confidence_score < self.high_uncertainty_threshold)
            .count();
        let low_uncertainty_count = metrics
            .iter()
            .filter(|m| m.confidence_score >= self.low_uncertainty_threshold)
            .count();

        let mut common_errors: Vec<(String, usize)> =
            state.error_counter.iter().map(|(k, v)| (k.clone(), *v)).collect();
        common_errors.sort_by(|a, b| b.1.cmp(&a.1));
        common_errors.truncate(10);

        let tool_uncertainty_map: BTreeMap<String, f64> = state
            .tool_uncertainty
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.clone(), mean(v)))
            .collect();

        let trend = trend_of(metrics);
        let recommendations = recommendations(
            average_consistency,
            average_confidence,
            high_uncertainty_count,
            total,
            &tool_uncertainty_map,
        );

        UncertaintyReport {
            total_requests: total,
            average_consistency,
            average_confidence,
            high_uncertainty_count,
            low_uncertainty_count,
            common_errors,
            tool_uncertainty_map,
            trend,
            recommendations,
        }
    }

    /// 每个工具的不确定性统计
    pub fn tool_uncertainty(&self) -> BTreeMap<String, ToolUncertainty> {
        self.lock()
            .tool_uncertainty
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(name, v)| {
                (
                    name.clone(),
                    ToolUncertainty {
                        count: v.len(),
                        average_uncertainty: mean(v),
                        min_uncertainty: v.iter().copied().fold(f64::INFINITY, f64::min),
                        max_uncertainty: v.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    },
                )
            })
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.error_counter.clear();
        state.tool_uncertainty.clear();
        tracing::info!("Uncertainty monitoring history cleared");
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn trend_of(metrics: &[UncertaintyMetrics]) -> Trend {
    if metrics.len() < TREND_MIN_RECORDS {
        return Trend::Stable;
    }
    let (first, second) = metrics.split_at(metrics.len() / 2);
    let avg = |half: &[UncertaintyMetrics]| mean(&half.iter().map(|m| m.confidence_score).collect::<Vec<_>>());
    let diff = avg(second) - avg(first);
    if diff > TREND_DELTA {
        Trend::Improving
    } else if diff < -TREND_DELTA {
        Trend::Worsening
    } else {
        Trend::Stable
    }
}

fn recommendations(
    avg_consistency: f64,
    avg_confidence: f64,
    high_uncertainty_count: usize,
    total: usize,
    tool_map: &BTreeMap<String, f64>,
) -> Vec<String> {
    let mut out = Vec::new();
    if avg_consistency < 0.7 {
        out.push("平均一致性较低，建议使用Self-Consistency机制（增加采样次数）".to_string());
    }
    if avg_confidence < 0.6 {
        out.push("平均置信度较低，建议：1) 降低temperature参数 2) 优化Prompt模板 3) 使用Self-Consistency".to_string());
    }
    let rate = if total > 0 {
        high_uncertainty_count as f64 / total as f64
    } else {
        0.0
    };
    if rate > 0.3 {
        out.push(format!(
            "高不确定性请求比例较高（{:.1}%），建议检查Prompt质量和模型参数",
            rate * 100.0
        ));
    }
    let uncertain: Vec<&str> = tool_map
        .iter()
        .filter(|(_, u)| **u > 0.5)
        .map(|(name, _)| name.as_str())
        .collect();
    if !uncertain.is_empty() {
        out.push(format!(
            "以下工具的不确定性较高：{}，建议在Prompt中提供更明确的工具使用示例",
            uncertain.join(", ")
        ));
    }
    if out.is_empty() {
        out.push("不确定性指标良好，系统运行稳定".to_string());
    }
    out
}
