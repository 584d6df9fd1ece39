//! Self-Consistency 投票
//!
//! 对同一提示词采样 N 次（默认并行；串行模式在 ≥3 个样本的两两相似度达到阈值时提前停止），
//! 解析失败的样本被丢弃，其余按结构质量打分后用四种策略之一选出胜者：
//! majority（最常见的子任务数 + 最常用工具）、weighted（最高质量）、
//! clustering（相似度 > 0.7 聚类取最大簇中质量最高者）、quality_based（0.4×频率 + 0.6×平均质量）。
//! 一致性分数 = 各有效样本与胜者相似度的平均值。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::llm::output_parser::parse_json_value;
use crate::llm::{LlmClient, SamplingParams};

/// 聚类投票的相似度阈值
const CLUSTER_SIMILARITY: f64 = 0.7;

/// 自定义样本解析函数
pub type ParseFn = dyn Fn(&str) -> Result<Value, AgentError> + Send + Sync;
/// 自定义样本校验函数
pub type ValidateFn = dyn Fn(&Value) -> bool + Send + Sync;

/// 投票策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VotingStrategy {
    #[default]
    Majority,
    Weighted,
    Clustering,
    QualityBased,
}

impl VotingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VotingStrategy::Majority => "majority",
            VotingStrategy::Weighted => "weighted",
            VotingStrategy::Clustering => "clustering",
            VotingStrategy::QualityBased => "quality_based",
        }
    }
}

impl fmt::Display for VotingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VotingStrategy {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "majority" => Ok(VotingStrategy::Majority),
            "weighted" => Ok(VotingStrategy::Weighted),
            "clustering" => Ok(VotingStrategy::Clustering),
            "quality_based" | "quality" => Ok(VotingStrategy::QualityBased),
            other => Err(AgentError::Config(format!("unknown voting strategy: {other}"))),
        }
    }
}

/// 单个样本
#[derive(Debug, Clone)]
pub struct SampleResult {
    pub content: String,
    pub parsed: Option<Value>,
    pub is_valid: bool,
    pub quality_score: f64,
    pub parse_error: Option<String>,
}

impl SampleResult {
    pub fn parse(content: &str, parse: Option<&ParseFn>) -> Self {
        let result = match parse {
            Some(f) => f(content),
            None => parse_json_value(content),
        };
        match result {
            Ok(v) => Self {
                content: content.to_string(),
                parsed: Some(v),
                is_valid: true,
                quality_score: 0.0,
                parse_error: None,
            },
            Err(e) => Self {
                content: content.to_string(),
                parsed: None,
                is_valid: false,
                quality_score: 0.0,
                parse_error: Some(e.to_string()),
            },
        }
    }
}

/// 投票结果
#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyResult {
    /// 胜出的文档；没有有效样本时为空对象
    pub best_result: Value,
    pub consistency_score: f64,
    pub sample_count: usize,
    pub valid_sample_count: usize,
    pub voting_details: Value,
}

/// 文档中用到的工具名集合：subtasks[].actions[].tool、action.tool 与顶层 tool
fn tools_of(data: &Value) -> BTreeSet<String> {
    let mut tools = BTreeSet::new();
    if let Some(subtasks) = data.get("subtasks").and_then(|s| s.as_array()) {
        for subtask in subtasks {
            if let Some(actions) = subtask.get("actions").and_then(|a| a.as_array()) {
                for action in actions {
                    if let Some(t) = action.get("tool").and_then(|t| t.as_str()) {
                        tools.insert(t.to_string());
                    }
                }
            }
        }
    }
    if let Some(t) = data.pointer("/action/tool").and_then(|t| t.as_str()) {
        tools.insert(t.to_string());
    }
    if let Some(t) = data.get("tool").and_then(|t| t.as_str()) {
        tools.insert(t.to_string());
    }
    tools
}

fn tool_list(data: &Value) -> Vec<String> {
    let mut tools = Vec::new();
    if let Some(subtasks) = data.get("subtasks").and_then(|s| s.as_array()) {
        for subtask in subtasks {
            if let Some(actions) = subtask.get("actions").and_then(|a| a.as_array()) {
                tools.extend(
                    actions
                        .iter()
                        .filter_map(|a| a.get("tool").and_then(|t| t.as_str()))
                        .map(str::to_string),
                );
            }
        }
    }
    if let Some(t) = data.pointer("/action/tool").and_then(|t| t.as_str()) {
        tools.push(t.to_string());
    }
    tools
}

fn subtask_count(data: &Value) -> usize {
    data.get("subtasks").and_then(|s| s.as_array()).map_or(0, |s| s.len())
}

/// 两个文档的相似度：30% 子任务数是否相同 + 70% 工具集合 Jaccard（两侧都没有工具时视为一致）
pub fn similarity(a: &Value, b: &Value) -> f64 {
    let empty = |v: &Value| v.as_object().map_or(true, |o| o.is_empty());
    if empty(a) || empty(b) {
        return 0.0;
    }
    let mut score = 0.0;
    if subtask_count(a) == subtask_count(b) {
        score += 0.3;
    }
    let (ta, tb) = (tools_of(a), tools_of(b));
    if ta.is_empty() && tb.is_empty() {
        score += 0.7;
    } else if !ta.is_empty() && !tb.is_empty() {
        let inter = ta.intersection(&tb).count() as f64;
        let union = ta.union(&tb).count() as f64;
        score += 0.7 * (inter / union);
    }
    score
}

/// 样本结构质量：空 subtasks ×0.5，非对象子任务或缺 actions 的子任务各 ×0.8
pub fn quality_score(sample: &SampleResult) -> f64 {
    if !sample.is_valid {
        return 0.0;
    }
    let mut score = 1.0;
    if let Some(subtasks) = sample.parsed.as_ref().and_then(|d| d.get("subtasks")) {
        match subtasks.as_array() {
            Some(list) if !list.is_empty() => {
                for subtask in list {
                    match subtask.as_object() {
                        Some(obj) if obj.contains_key("actions") => {}
                        _ => score *= 0.8,
                    }
                }
            }
            _ => score *= 0.5,
        }
    }
    score
}

/// 两两平均相似度
fn pairwise_consistency(docs: &[&Value]) -> f64 {
    if docs.len() < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    let mut n = 0usize;
    for i in 0..docs.len() {
        for j in i + 1..docs.len() {
            total += similarity(docs[i], docs[j]);
            n += 1;
        }
    }
    total / n as f64
}

/// 取第一个最大值（并列时保留靠前者）
fn first_max_by<T>(items: impl IntoIterator<Item = T>, key: impl Fn(&T) -> f64) -> Option<T> {
    let mut best: Option<(T, f64)> = None;
    for item in items {
        let k = key(&item);
        match &best {
            Some((_, bk)) if k <= *bk => {}
            _ => best = Some((item, k)),
        }
    }
    best.map(|(item, _)| item)
}

/// Self-Consistency 投票器
pub struct SelfConsistencyVoter {
    llm: Arc<dyn LlmClient>,
    num_samples: usize,
    strategy: VotingStrategy,
    temperature: f64,
    early_stop_threshold: f64,
    parallel: bool,
}

impl SelfConsistencyVoter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            num_samples: 5,
            strategy: VotingStrategy::Majority,
            temperature: 0.7,
            early_stop_threshold: 0.9,
            parallel: true,
        }
    }

    pub fn with_samples(mut self, n: usize) -> Self {
        self.num_samples = n.max(1);
        self
    }

    pub fn with_strategy(mut self, strategy: VotingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_early_stop(mut self, threshold: f64) -> Self {
        self.early_stop_threshold = threshold;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn strategy(&self) -> VotingStrategy {
        self.strategy
    }

    /// 采样并投票
    pub async fn sample_and_vote(
        &self,
        prompt: &str,
        parse: Option<&ParseFn>,
        validate: Option<&ValidateFn>,
    ) -> ConsistencyResult {
        tracing::info!(
            samples = self.num_samples,
            strategy = %self.strategy,
            parallel = self.parallel,
            "Generating with self-consistency"
        );
        let samples = self.sample(prompt, parse).await;
        self.vote_with(&samples, parse, validate)
    }

    async fn sample(&self, prompt: &str, parse: Option<&ParseFn>) -> Vec<String> {
        let params = SamplingParams::with_temperature(self.temperature);
        if self.parallel {
            let calls = (0..self.num_samples).map(|_| self.llm.generate(prompt, &params));
            return join_all(calls)
                .await
                .into_iter()
                .filter_map(|r| match r {
                    Ok(text) => Some(text),
                    Err(e) => {
                        tracing::warn!(error = %e, "Sample generation error");
                        None
                    }
                })
                .collect();
        }

        let mut samples: Vec<String> = Vec::with_capacity(self.num_samples);
        for i in 0..self.num_samples {
            match self.llm.generate(prompt, &params).await {
                Ok(text) => samples.push(text),
                Err(e) => {
                    tracing::warn!(error = %e, "Sample generation error");
                    continue;
                }
            }
            if i >= 2 {
                let parsed: Vec<SampleResult> = samples.iter().map(|s| SampleResult::parse(s, parse)).collect();
                let docs: Vec<&Value> = parsed.iter().filter_map(|p| p.parsed.as_ref()).collect();
                let consistency = pairwise_consistency(&docs);
                if !docs.is_empty() && consistency >= self.early_stop_threshold {
                    tracing::info!(sample = i + 1, consistency, "Early stopping");
                    break;
                }
            }
        }
        samples
    }

    /// 只做投票（默认 JSON 解析）
    pub fn vote(&self, samples: &[String]) -> ConsistencyResult {
        self.vote_with(samples, None, None)
    }

    pub fn vote_with(&self, samples: &[String], parse: Option<&ParseFn>, validate: Option<&ValidateFn>) -> ConsistencyResult {
        let mut parsed: Vec<SampleResult> = Vec::with_capacity(samples.len());
        for content in samples {
            let mut sample = SampleResult::parse(content, parse);
            if !sample.is_valid {
                tracing::debug!(error = ?sample.parse_error, "Sample parsing failed");
                continue;
            }
            if let (Some(validate), Some(data)) = (validate, sample.parsed.as_ref()) {
                sample.is_valid = validate(data);
            }
            parsed.push(sample);
        }

        if parsed.is_empty() {
            tracing::warn!("All samples failed to parse, returning empty result");
            return ConsistencyResult {
                best_result: json!({}),
                consistency_score: 0.0,
                sample_count: samples.len(),
                valid_sample_count: 0,
                voting_details: json!({"error": "All samples failed to parse"}),
            };
        }

        for sample in parsed.iter_mut() {
            sample.quality_score = quality_score(sample);
        }

        let (best, details) = match self.strategy {
            VotingStrategy::Majority => majority_vote(&parsed),
            VotingStrategy::Weighted => weighted_vote(&parsed),
            VotingStrategy::Clustering => clustering_vote(&parsed),
            VotingStrategy::QualityBased => quality_based_vote(&parsed),
        };

        let docs: Vec<&Value> = parsed.iter().filter_map(|s| s.parsed.as_ref()).collect();
        let consistency_score = if docs.is_empty() {
            0.0
        } else {
            docs.iter().map(|d| similarity(d, &best)).sum::<f64>() / docs.len() as f64
        };

        tracing::info!(
            consistency = consistency_score,
            valid = parsed.len(),
            total = samples.len(),
            "Self-consistency result"
        );

        ConsistencyResult {
            best_result: best,
            consistency_score,
            sample_count: samples.len(),
            valid_sample_count: parsed.len(),
            voting_details: details,
        }
    }
}

fn majority_vote(samples: &[SampleResult]) -> (Value, Value) {
    let mut tool_votes: BTreeMap<String, usize> = BTreeMap::new();
    let mut subtask_counts: BTreeMap<usize, usize> = BTreeMap::new();
    for data in samples.iter().filter_map(|s| s.parsed.as_ref()) {
        for tool in tool_list(data) {
            *tool_votes.entry(tool).or_insert(0) += 1;
        }
        *subtask_counts.entry(subtask_count(data)).or_insert(0) += 1;
    }

    let common_count = first_max_by(subtask_counts.iter(), |(_, c)| **c as f64)
        .map(|(k, _)| *k)
        .unwrap_or(0);

    let scored = samples.iter().filter_map(|s| s.parsed.as_ref()).map(|data| {
        let mut score = 0usize;
        if subtask_count(data) == common_count {
            score += 2;
        }
        for tool in tool_list(data) {
            score += tool_votes.get(&tool).copied().unwrap_or(0);
        }
        (data, score)
    });

    match first_max_by(scored, |(_, s)| *s as f64) {
        Some((data, score)) if score > 0 => (
            data.clone(),
            json!({
                "strategy": "majority",
                "tool_votes": tool_votes,
                "subtask_counts": subtask_counts.iter().map(|(k, v)| (k.to_string(), *v)).collect::<BTreeMap<_, _>>(),
                "best_score": score,
            }),
        ),
        _ => match samples.iter().find_map(|s| s.parsed.clone()) {
            Some(first) => (first, json!({"strategy": "majority", "fallback": true})),
            None => (json!({}), json!({"strategy": "majority", "error": "No valid samples"})),
        },
    }
}

fn weighted_vote(samples: &[SampleResult]) -> (Value, Value) {
    let weighted: Vec<(&Value, f64)> = samples
        .iter()
        .filter_map(|s| s.parsed.as_ref().map(|d| (d, s.quality_score)))
        .collect();
    match first_max_by(weighted.iter(), |(_, w)| *w) {
        Some((data, weight)) => (
            (*data).clone(),
            json!({
                "strategy": "weighted",
                "best_weight": weight,
                "weights": weighted.iter().map(|(_, w)| *w).collect::<Vec<_>>(),
            }),
        ),
        None => (json!({}), json!({"strategy": "weighted", "error": "No valid samples"})),
    }
}

fn clustering_vote(samples: &[SampleResult]) -> (Value, Value) {
    let valid: Vec<&SampleResult> = samples.iter().filter(|s| s.parsed.is_some()).collect();
    let mut used = vec![false; valid.len()];
    let mut clusters: Vec<Vec<&SampleResult>> = Vec::new();

    for i in 0..valid.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let mut cluster = vec![valid[i]];
        for j in i + 1..valid.len() {
            if used[j] {
                continue;
            }
            if let (Some(a), Some(b)) = (&valid[i].parsed, &valid[j].parsed) {
                if similarity(a, b) > CLUSTER_SIMILARITY {
                    cluster.push(valid[j]);
                    used[j] = true;
                }
            }
        }
        clusters.push(cluster);
    }

    let Some(largest) = first_max_by(clusters.iter(), |c| c.len() as f64) else {
        return (json!({}), json!({"strategy": "clustering", "error": "No valid samples"}));
    };
    let best = first_max_by(largest.iter(), |s| s.quality_score)
        .and_then(|s| s.parsed.clone())
        .unwrap_or_else(|| json!({}));
    (
        best,
        json!({
            "strategy": "clustering",
            "cluster_count": clusters.len(),
            "largest_cluster_size": largest.len(),
            "similarity_threshold": CLUSTER_SIMILARITY,
        }),
    )
}

fn quality_based_vote(samples: &[SampleResult]) -> (Value, Value) {
    // 以规范化 JSON 文本分组（serde_json::Map 默认按键排序）
    let mut groups: Vec<(String, Vec<&SampleResult>)> = Vec::new();
    for sample in samples {
        let Some(data) = &sample.parsed else { continue };
        let key = data.to_string();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(sample),
            None => groups.push((key, vec![sample])),
        }
    }
    let total = samples.len().max(1) as f64;
    let scored: Vec<(&Value, f64, f64, f64)> = groups
        .iter()
        .filter_map(|(_, members)| {
            let data = members.first()?.parsed.as_ref()?;
            let frequency = members.len() as f64 / total;
            let quality = members.iter().map(|m| m.quality_score).sum::<f64>() / members.len() as f64;
            Some((data, frequency * 0.4 + quality * 0.6, frequency, quality))
        })
        .collect();

    match first_max_by(scored.iter(), |(_, s, _, _)| *s) {
        Some((data, score, freq, quality)) => (
            (*data).clone(),
            json!({
                "strategy": "quality_based",
                "best_score": score,
                "frequency": freq,
                "quality": quality,
            }),
        ),
        None => (json!({}), json!({"strategy": "quality_based", "error": "No valid samples"})),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    const PLAN_A: &str = r#"{"subtasks": [{"id": "s1", "actions": [{"tool": "navigate"}, {"tool": "click"}]}]}"#;
    const PLAN_B: &str = r#"{"subtasks": [{"id": "s1", "actions": [{"tool": "navigate"}]}, {"id": "s2"}]}"#;

    fn voter(strategy: VotingStrategy) -> SelfConsistencyVoter {
        SelfConsistencyVoter::new(Arc::new(MockLlmClient::new())).with_strategy(strategy)
    }

    #[test]
    fn test_identical_samples_fully_consistent() {
        let samples = vec![PLAN_A.to_string(); 5];
        for strategy in [
            VotingStrategy::Majority,
            VotingStrategy::Weighted,
            VotingStrategy::Clustering,
            VotingStrategy::QualityBased,
        ] {
            let r = voter(strategy).vote(&samples);
            assert_eq!(r.valid_sample_count, 5);
            assert!((r.consistency_score - 1.0).abs() < 1e-9, "{strategy}");
        }
    }

    #[test]
    fn test_all_unparseable() {
        let samples = vec!["no json here".to_string(); 5];
        let r = voter(VotingStrategy::Majority).vote(&samples);
        assert_eq!(r.valid_sample_count, 0);
        assert_eq!(r.sample_count, 5);
        assert_eq!(r.best_result, json!({}));
        assert_eq!(r.consistency_score, 0.0);
    }

    #[test]
    fn test_majority_prefers_common_shape() {
        let samples = vec![PLAN_B.to_string(), PLAN_A.to_string(), PLAN_A.to_string()];
        let r = voter(VotingStrategy::Majority).vote(&samples);
        assert_eq!(r.best_result["subtasks"].as_array().unwrap().len(), 1);
        assert!(r.consistency_score < 1.0);
    }

    #[test]
    fn test_weighted_prefers_quality() {
        // PLAN_B 的第二个子任务缺 actions，质量 0.8
        let samples = vec![PLAN_B.to_string(), PLAN_A.to_string()];
        let r = voter(VotingStrategy::Weighted).vote(&samples);
        assert_eq!(r.best_result["subtasks"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_similarity_metric() {
        let a: Value = serde_json::from_str(PLAN_A).unwrap();
        let b: Value = serde_json::from_str(PLAN_B).unwrap();
        // 子任务数不同，工具 {navigate} / {navigate, click}
        assert!((similarity(&a, &b) - 0.35).abs() < 1e-9);
        assert_eq!(similarity(&a, &json!({})), 0.0);
    }

    #[tokio::test]
    async fn test_sampling_excludes_failures() {
        let llm = Arc::new(MockLlmClient::failing("down"));
        let v = SelfConsistencyVoter::new(llm).with_samples(3);
        let r = v.sample_and_vote("p", None, None).await;
        assert_eq!(r.sample_count, 0);
        assert_eq!(r.valid_sample_count, 0);
    }

    #[tokio::test]
    async fn test_serial_early_stop() {
        let llm = Arc::new(MockLlmClient::scripted([PLAN_A]));
        let v = SelfConsistencyVoter::new(llm.clone()).with_samples(5).with_parallel(false);
        let r = v.sample_and_vote("p", None, None).await;
        assert_eq!(llm.call_count(), 3);
        assert_eq!(r.sample_count, 3);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("quality_based".parse::<VotingStrategy>().unwrap(), VotingStrategy::QualityBased);
        assert!("nope".parse::<VotingStrategy>().is_err());
    }
}
