//! Planner：把目标交给 LLM 拆解为子任务图
//!
//! 规划响应经 PlanParser 修复与校验，解析永远不会失败；挂上 SelfConsistencyVoter 后改为多次采样投票。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;

use crate::core::types::{Reflection, Subtask, Task};
use crate::core::worker::RetryPolicy;
use crate::core::{AgentError, ErrorHandler};
use crate::llm::output_parser::{fallback_plan, parse_json_value, validate_plan};
use crate::llm::prompts::planning_prompt;
use crate::llm::self_consistency::{ParseFn, ValidateFn};
use crate::llm::{LlmClient, PlanParser, SamplingParams, SelfConsistencyVoter};
use crate::tools::ToolDescriptor;

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    parser: PlanParser,
    voter: Option<SelfConsistencyVoter>,
    params: SamplingParams,
    error_handler: Arc<ErrorHandler>,
    retry: RetryPolicy,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            parser: PlanParser::new(Some(llm.clone())),
            llm,
            voter: None,
            params: SamplingParams::default(),
            error_handler: Arc::new(ErrorHandler::new()),
            retry: RetryPolicy::default(),
        }
    }

    /// oracle 调用失败时使用的错误处理器与重试参数（通常与 Worker 共享）
    pub fn with_recovery(mut self, error_handler: Arc<ErrorHandler>, retry: RetryPolicy) -> Self {
        self.error_handler = error_handler;
        self.retry = retry;
        self
    }

    /// 启用 self-consistency 规划
    pub fn with_voter(mut self, voter: SelfConsistencyVoter) -> Self {
        self.voter = Some(voter);
        self
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    /// 规划任务；LLM 在重试预算内仍不可用时返回只含一个说明子任务的默认任务
    pub async fn plan(&self, goal: &str, tools: &[ToolDescriptor], context: &str) -> Task {
        tracing::info!(goal, "Planning task");
        let prompt = planning_prompt(goal, tools, context);

        let plan = match &self.voter {
            Some(voter) => self.plan_with_voter(voter, &prompt).await,
            None => match self
                .error_handler
                .generate_with_recovery(self.llm.as_ref(), &prompt, &self.params, &self.retry)
                .await
            {
                Ok(response) => {
                    let parsed = self.parser.parse(&response).await;
                    tracing::debug!(source = ?parsed.source, "Plan parsed");
                    parsed.data
                }
                Err(e) => {
                    tracing::error!(error = %e, "Planning error");
                    return default_task(goal, &e.to_string());
                }
            },
        };

        let task = build_task(goal, &plan);
        tracing::info!(task_id = %task.id, subtasks = task.subtasks.len(), "Task planned");
        task
    }

    async fn plan_with_voter(&self, voter: &SelfConsistencyVoter, prompt: &str) -> Value {
        let parse: &ParseFn = &|text: &str| parse_json_value(text).and_then(validate_plan);
        let has_subtasks: &ValidateFn = &|v: &Value| v.get("subtasks").and_then(|s| s.as_array()).is_some();
        let result = voter.sample_and_vote(prompt, Some(parse), Some(has_subtasks)).await;
        tracing::info!(
            consistency = result.consistency_score,
            valid = result.valid_sample_count,
            samples = result.sample_count,
            "Self-consistency planning finished"
        );
        if result.valid_sample_count == 0 {
            return fallback_plan("所有采样均无法解析");
        }
        result.best_result
    }

    /// 把上一轮反思的分析与建议并入上下文后重新规划
    pub async fn replan(&self, task: &Task, reflection: &Reflection, tools: &[ToolDescriptor]) -> Task {
        tracing::info!(task_id = %task.id, "Replanning task");
        let context = format!(
            "\n原任务：{}\n反思分析：{}\n建议：{}\n",
            task.goal,
            reflection.analysis,
            reflection.suggestions.join(", ")
        );
        self.plan(&task.goal, tools, &context).await
    }

    /// 子任务依赖图：id → 依赖的 id 列表
    pub fn dependency_graph(subtasks: &[Subtask]) -> HashMap<String, Vec<String>> {
        subtasks
            .iter()
            .map(|s| (s.id.clone(), s.dependencies.clone()))
            .collect()
    }

    /// 按依赖排序子任务（Kahn）；同层保持原顺序，未知依赖忽略，有环时报错
    pub fn topological_order(task: &Task) -> Result<Vec<Subtask>, AgentError> {
        let index: HashMap<&str, usize> = task
            .subtasks
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let n = task.subtasks.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, subtask) in task.subtasks.iter().enumerate() {
            for dep in &subtask.dependencies {
                match index.get(dep.as_str()) {
                    Some(&j) => {
                        in_degree[i] += 1;
                        dependents[j].push(i);
                    }
                    None => tracing::warn!(subtask = %subtask.id, dependency = %dep, "Unknown dependency ignored"),
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = ready.pop_front() {
            order.push(task.subtasks[i].clone());
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if order.len() != n {
            let cyclic: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| task.subtasks[i].id.as_str())
                .collect();
            return Err(AgentError::Validation(format!(
                "subtask dependencies contain a cycle: {}",
                cyclic.join(", ")
            )));
        }
        Ok(order)
    }
}

/// 从校验过的规划文档构建 Task
fn build_task(goal: &str, plan: &Value) -> Task {
    let mut task = Task::new(goal);
    task.subtasks = plan
        .get("subtasks")
        .and_then(|s| s.as_array())
        .map(|arr| arr.iter().filter_map(Subtask::from_value).collect())
        .unwrap_or_default();
    task
}

fn default_task(goal: &str, error: &str) -> Task {
    let mut task = Task::new(goal);
    task.subtasks = vec![Subtask {
        id: "subtask_1".to_string(),
        description: format!("规划失败: {error}"),
        actions: Vec::new(),
        dependencies: Vec::new(),
        status: Default::default(),
    }];
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use crate::llm::{MockLlmClient, VotingStrategy};
    use chrono::Local;

    fn tools() -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: "navigate".into(),
            description: "打开网页".into(),
            parameters: serde_json::json!({}),
        }]
    }

    const PLAN: &str = r#"```json
{"subtasks": [
  {"id": "s1", "description": "打开", "actions": [{"type": "gui", "tool": "navigate", "args": {"url": "https://example.com"}}]},
  {"id": "s2", "description": "点击", "dependencies": ["s1"], "actions": [{"type": "gui", "tool": "click", "args": {"target": "button#go"}}]}
]}
```"#;

    #[tokio::test]
    async fn test_plan_builds_task() {
        let planner = Planner::new(Arc::new(MockLlmClient::scripted([PLAN])));
        let task = planner.plan("打开并点击", &tools(), "").await;
        assert!(task.id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.subtasks.len(), 2);
        assert_eq!(task.subtasks[1].dependencies, vec!["s1"]);
        assert_eq!(task.subtasks[0].actions[0].tool, "navigate");
    }

    #[tokio::test]
    async fn test_plan_llm_failure_gives_default_task() {
        let llm = Arc::new(MockLlmClient::failing("connection refused"));
        let handler = Arc::new(ErrorHandler::new());
        let retry = RetryPolicy {
            max_retries: 3,
            retry_delay: 0.0,
            exponential_backoff: false,
        };
        let planner = Planner::new(llm.clone()).with_recovery(handler.clone(), retry);
        let task = planner.plan("x", &tools(), "").await;
        assert_eq!(task.subtasks.len(), 1);
        assert!(task.subtasks[0].description.starts_with("规划失败"));
        assert!(task.subtasks[0].actions.is_empty());
        // 网络错误按策略重试，预算耗尽后才退回默认任务
        assert_eq!(llm.call_count(), 3);
        assert!(handler.summary(10).iter().all(|r| r.error_type == crate::core::ErrorKind::Network));
    }

    #[tokio::test]
    async fn test_plan_with_voter() {
        let llm = Arc::new(MockLlmClient::scripted([PLAN]));
        let voter = SelfConsistencyVoter::new(llm.clone())
            .with_samples(3)
            .with_strategy(VotingStrategy::Clustering);
        let planner = Planner::new(llm.clone()).with_voter(voter);
        let task = planner.plan("打开并点击", &tools(), "").await;
        assert_eq!(task.subtasks.len(), 2);
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_replan_folds_reflection_into_context() {
        let llm = Arc::new(MockLlmClient::scripted([PLAN]));
        let planner = Planner::new(llm.clone());
        let task = Task::new("打开并点击");
        let reflection = Reflection {
            task_id: task.id.clone(),
            success: false,
            analysis: "按钮不存在".into(),
            suggestions: vec!["先等待".into(), "换选择器".into()],
            needs_replan: true,
            confidence: 0.4,
            timestamp: Local::now(),
        };
        planner.replan(&task, &reflection, &tools()).await;
        let prompt = &llm.prompts()[0];
        assert!(prompt.contains("反思分析：按钮不存在"));
        assert!(prompt.contains("建议：先等待, 换选择器"));
    }

    fn subtask(id: &str, deps: &[&str]) -> Subtask {
        Subtask {
            id: id.into(),
            description: String::new(),
            actions: Vec::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            status: TaskStatus::Pending,
        }
    }

    #[test]
    fn test_topological_order() {
        let mut task = Task::new("g");
        task.subtasks = vec![
            subtask("c", &["a", "b"]),
            subtask("a", &[]),
            subtask("b", &["a", "ghost"]),
        ];
        let ids: Vec<String> = Planner::topological_order(&task)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(Planner::dependency_graph(&task.subtasks)["c"], vec!["a", "b"]);
    }

    #[test]
    fn test_topological_order_cycle() {
        let mut task = Task::new("g");
        task.subtasks = vec![subtask("a", &["b"]), subtask("b", &["a"]), subtask("c", &[])];
        let err = Planner::topological_order(&task).unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }
}
