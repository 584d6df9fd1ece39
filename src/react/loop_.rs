//! AgentExecutor：逐步决策主循环
//!
//! 每轮：取工具目录 → 构建决策提示词 → 调用 LLM → 解析为 StepDecision → 停止 / 跳过 / 执行 / 重试上一动作。
//! 循环在决策停止、完成检查通过、达到最大步数或被取消时结束；结束后必定反思一次，
//! 反思要求重规划且仍有额度时，把新计划写入上下文变量后继续循环（共用步数上限）。
//! 可选 event_tx：向 CLI 等前端推送 StepUpdate / Decision / ToolCall / Observation / Reflection。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::core::types::{Action, Context, StepDecision, Task, TaskOutcome, TaskStatus};
use crate::core::worker::Worker;
use crate::core::AgentError;
use crate::llm::output_parser::parse_json_value;
use crate::llm::prompts::agent_step_prompt;
use crate::llm::self_consistency::{ParseFn, ValidateFn};
use crate::llm::validator::OutputKind;
use crate::llm::{
    ConfidenceEvaluator, LlmClient, OutputValidator, SamplingParams, SelfConsistencyVoter, UncertaintyMetrics,
    UncertaintyTracker,
};
use crate::react::{AgentEvent, Planner, Reflector};
use crate::tools::ToolDescriptor;

/// 默认最大步数，防止死循环
pub const DEFAULT_MAX_STEPS: usize = 50;
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 任务完成判定
pub trait CompletionCheck: Send + Sync {
    fn is_complete(&self, goal: &str, ctx: &Context) -> bool;
}

/// 至少有一个结果且全部成功即视为完成；不验证目标是否真正达成
#[derive(Debug, Default, Clone, Copy)]
pub struct AllResultsSucceeded;

impl CompletionCheck for AllResultsSucceeded {
    fn is_complete(&self, _goal: &str, ctx: &Context) -> bool {
        !ctx.action_results.is_empty() && ctx.action_results.iter().all(|r| r.success)
    }
}

/// 完全由决策的 should_continue 结束
#[derive(Debug, Default, Clone, Copy)]
pub struct OracleDecides;

impl CompletionCheck for OracleDecides {
    fn is_complete(&self, _goal: &str, _ctx: &Context) -> bool {
        false
    }
}

fn send_event(tx: &Option<UnboundedSender<AgentEvent>>, ev: AgentEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

fn preview(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    text.chars().take(OBSERVATION_PREVIEW_CHARS).collect()
}

/// 决策 JSON → StepDecision：缺失字段取默认值，action 缺少工具名时视为无动作
pub fn decision_from_value(value: &Value) -> Result<StepDecision, AgentError> {
    let obj = value
        .as_object()
        .ok_or_else(|| AgentError::JsonParse("decision must be a JSON object".to_string()))?;
    let flag = |key: &str, default: bool| obj.get(key).and_then(Value::as_bool).unwrap_or(default);
    let text = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    Ok(StepDecision {
        action: obj
            .get("action")
            .filter(|a| a.is_object())
            .and_then(Action::from_value),
        should_continue: flag("should_continue", true),
        should_retry: flag("should_retry", false),
        should_skip: flag("should_skip", false),
        reasoning: text("reasoning"),
        confidence: obj
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0),
        next_step_description: text("next_step_description"),
    })
}

pub struct AgentExecutor {
    worker: Arc<Worker>,
    planner: Arc<Planner>,
    reflector: Arc<Reflector>,
    llm: Arc<dyn LlmClient>,
    params: SamplingParams,
    max_steps: usize,
    max_replans: usize,
    completion: Arc<dyn CompletionCheck>,
    voter: Option<SelfConsistencyVoter>,
    evaluator: Arc<ConfidenceEvaluator>,
    tracker: Arc<UncertaintyTracker>,
    event_tx: Option<UnboundedSender<AgentEvent>>,
}

impl AgentExecutor {
    pub fn new(worker: Arc<Worker>, planner: Arc<Planner>, reflector: Arc<Reflector>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            worker,
            planner,
            reflector,
            llm,
            params: SamplingParams::default(),
            max_steps: DEFAULT_MAX_STEPS,
            max_replans: 0,
            completion: Arc::new(AllResultsSucceeded),
            voter: None,
            evaluator: Arc::new(ConfidenceEvaluator::default()),
            tracker: Arc::new(UncertaintyTracker::default()),
            event_tx: None,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// 反思后允许重新规划的次数（默认 0）
    pub fn with_max_replans(mut self, max_replans: usize) -> Self {
        self.max_replans = max_replans;
        self
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_completion_check(mut self, check: Arc<dyn CompletionCheck>) -> Self {
        self.completion = check;
        self
    }

    /// 每步决策改为多次采样投票
    pub fn with_voter(mut self, voter: SelfConsistencyVoter) -> Self {
        self.voter = Some(voter);
        self
    }

    pub fn with_confidence_evaluator(mut self, evaluator: Arc<ConfidenceEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_uncertainty_tracker(mut self, tracker: Arc<UncertaintyTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn uncertainty_tracker(&self) -> &Arc<UncertaintyTracker> {
        &self.tracker
    }

    pub fn confidence_evaluator(&self) -> &Arc<ConfidenceEvaluator> {
        &self.evaluator
    }

    /// 执行任务；取消只在每轮开始时检查，进行中的工具调用会跑完
    pub async fn execute(
        &self,
        goal: &str,
        initial_vars: Option<&HashMap<String, Value>>,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        tracing::info!(goal, max_steps = self.max_steps, "Starting agent-mode task execution");
        let mut task = Task::new(goal);
        task.set_status(TaskStatus::Running);
        let mut ctx = Context::new(task);
        if let Some(vars) = initial_vars {
            ctx.extend_vars(vars);
        }

        let mut step = 0usize;
        let mut replans = 0usize;
        let mut cancelled = false;
        let mut oracle_error: Option<AgentError> = None;
        let mut last_action: Option<Action> = None;

        let reflection = loop {
            while step < self.max_steps {
                if cancel.is_cancelled() {
                    tracing::info!(step, "Task cancelled by user");
                    cancelled = true;
                    send_event(&self.event_tx, AgentEvent::Cancelled);
                    break;
                }
                step += 1;
                tracing::info!(step, max_steps = self.max_steps, "Deciding next action");
                send_event(
                    &self.event_tx,
                    AgentEvent::StepUpdate {
                        step,
                        max_steps: self.max_steps,
                    },
                );

                let tools = self.worker.descriptors();
                let decision = match self.decide(goal, &ctx, &tools).await {
                    Ok(decision) => decision,
                    Err(e) => {
                        tracing::error!(step, error = %e, "Oracle unreachable, aborting task");
                        send_event(&self.event_tx, AgentEvent::Error { text: e.to_string() });
                        oracle_error = Some(e);
                        break;
                    }
                };
                send_event(
                    &self.event_tx,
                    AgentEvent::Decision {
                        reasoning: decision.reasoning.clone(),
                        confidence: decision.confidence,
                        should_continue: decision.should_continue,
                    },
                );

                if !decision.should_continue {
                    tracing::info!(step, reasoning = %decision.reasoning, "Agent decided to stop");
                    break;
                }
                if decision.should_skip {
                    tracing::info!(step, "Agent decided to skip current step");
                    send_event(
                        &self.event_tx,
                        AgentEvent::Skipped {
                            reasoning: decision.reasoning.clone(),
                        },
                    );
                    continue;
                }

                let action = match (decision.action, decision.should_retry) {
                    (Some(action), _) => Some(action),
                    (None, true) => {
                        tracing::info!("Agent decided to retry last action");
                        last_action.clone()
                    }
                    (None, false) => None,
                };

                if let Some(action) = action {
                    tracing::info!(
                        tool = %action.tool,
                        description = %action.description,
                        confidence = decision.confidence,
                        "Executing action"
                    );
                    send_event(
                        &self.event_tx,
                        AgentEvent::ToolCall {
                            tool: action.tool.clone(),
                            args: action.args.clone(),
                        },
                    );
                    let result = self.worker.execute_with_retry(&action).await;
                    if result.success {
                        send_event(
                            &self.event_tx,
                            AgentEvent::Observation {
                                tool: result.tool.clone(),
                                preview: result.data.as_ref().map(preview).unwrap_or_else(|| result.message.clone()),
                            },
                        );
                        if let Some(data) = result.data.as_ref().filter(|d| !d.is_null()) {
                            ctx.set_var(format!("step_{step}_result"), data.clone());
                        }
                    } else {
                        tracing::warn!(tool = %result.tool, message = %result.message, "Action failed");
                        send_event(
                            &self.event_tx,
                            AgentEvent::ToolFailure {
                                tool: result.tool.clone(),
                                reason: result.error.clone().unwrap_or_else(|| result.message.clone()),
                            },
                        );
                    }
                    ctx.action_results.push(result);
                    last_action = Some(action);
                }

                if self.completion.is_complete(goal, &ctx) {
                    tracing::info!(step, "Task completed");
                    break;
                }
            }

            let state = if cancelled {
                "任务已取消"
            } else if oracle_error.is_some() {
                "LLM 不可用，任务中止"
            } else {
                "任务执行完成"
            };
            let reflection = self.reflector.reflect(&ctx.task, &ctx.action_results, state).await;
            send_event(
                &self.event_tx,
                AgentEvent::Reflection {
                    success: reflection.success,
                    analysis: reflection.analysis.clone(),
                    needs_replan: reflection.needs_replan,
                },
            );

            let can_replan = !cancelled
                && oracle_error.is_none()
                && reflection.needs_replan
                && !reflection.success
                && replans < self.max_replans
                && step < self.max_steps;
            if !can_replan {
                break reflection;
            }

            replans += 1;
            tracing::info!(replans, "Reflection requested a new plan");
            let plan = self
                .planner
                .replan(&ctx.task, &reflection, &self.worker.descriptors())
                .await;
            let outline: Vec<Value> = plan
                .subtasks
                .iter()
                .map(|s| {
                    json!({
                        "description": s.description,
                        "tools": s.actions.iter().map(|a| a.tool.as_str()).collect::<Vec<_>>(),
                    })
                })
                .collect();
            ctx.task.subtasks = plan.subtasks;
            ctx.set_var("replan_suggestions", json!(reflection.suggestions));
            ctx.set_var("replan_outline", Value::Array(outline));
        };

        let all_success = oracle_error.is_none() && ctx.action_results.iter().all(|r| r.success);
        let status = if cancelled {
            TaskStatus::Cancelled
        } else if all_success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        ctx.task.set_status(status);
        let success = all_success && !cancelled;
        tracing::info!(task_id = %ctx.task.id, ?status, steps = step, results = ctx.action_results.len(), "Agent task finished");
        send_event(&self.event_tx, AgentEvent::Finished { success, steps: step });

        TaskOutcome {
            task_id: ctx.task.id.clone(),
            success,
            status,
            variables: ctx.variables_json(),
            action_results: ctx.action_results,
            reflection: Some(reflection),
            step_count: step,
            executed_steps: Vec::new(),
            error: if cancelled {
                Some("任务已取消".to_string())
            } else {
                oracle_error.map(|e| format!("LLM 不可用: {e}"))
            },
        }
    }

    /// 调用 LLM 决定下一步；解析失败转为停止决策，oracle 在重试预算内仍不可用时返回错误
    async fn decide(&self, goal: &str, ctx: &Context, tools: &[ToolDescriptor]) -> Result<StepDecision, AgentError> {
        let prompt = agent_step_prompt(goal, ctx, tools);
        send_event(&self.event_tx, AgentEvent::Thinking);

        let (value, consistency) = match &self.voter {
            Some(voter) => {
                let parse: &ParseFn = &|text: &str| parse_json_value(text);
                let is_object: &ValidateFn = &|v: &Value| v.is_object();
                let voted = voter.sample_and_vote(&prompt, Some(parse), Some(is_object)).await;
                if voted.sample_count == 0 {
                    let error = AgentError::Llm("所有采样调用均失败".to_string());
                    self.worker.error_handler().context_for(&error, 0);
                    return Err(error);
                }
                if voted.valid_sample_count == 0 {
                    tracing::warn!(samples = voted.sample_count, "No valid decision samples");
                    return Ok(StepDecision::stop("解析决策响应失败: 所有采样均无法解析"));
                }
                (voted.best_result, Some((voted.consistency_score, voted.sample_count, voted.valid_sample_count)))
            }
            None => {
                let response = self
                    .worker
                    .error_handler()
                    .generate_with_recovery(self.llm.as_ref(), &prompt, &self.params, self.worker.policy())
                    .await?;
                match parse_json_value(&response) {
                    Ok(v) => (v, None),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to parse decision response");
                        return Ok(StepDecision::stop(format!("解析决策响应失败: {e}")));
                    }
                }
            }
        };

        let decision = match decision_from_value(&value) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to project decision");
                return Ok(StepDecision::stop(format!("解析决策响应失败: {e}")));
            }
        };
        self.assess(&prompt, &value, &decision, tools, consistency);
        Ok(decision)
    }

    /// 校验、评分并记录不确定性；低置信度只告警，不改变决策
    fn assess(
        &self,
        prompt: &str,
        value: &Value,
        decision: &StepDecision,
        tools: &[ToolDescriptor],
        consistency: Option<(f64, usize, usize)>,
    ) {
        let report = OutputValidator::new(tools, false).validate(value, OutputKind::Decision);
        if !report.errors.is_empty() {
            tracing::warn!(errors = ?report.errors, "Decision failed validation");
        }
        let score = self.evaluator.evaluate(value, tools, consistency.map(|c| c.0));

        let mut metrics = UncertaintyMetrics::new(prompt, score.overall)
            .with_validation(report.errors.len(), report.warnings.len());
        if let Some((score, samples, valid)) = consistency {
            metrics = metrics.with_consistency(score, samples, valid);
        }
        if let Some(action) = &decision.action {
            metrics = metrics.with_tool(action.tool.clone());
        }
        self.tracker.record(metrics);

        if decision.action.is_some() && !self.evaluator.should_accept(&score) {
            let recommendation = self.evaluator.recommendation(&score);
            tracing::warn!(score = score.overall, recommendation = %recommendation, "Low confidence decision");
            send_event(
                &self.event_tx,
                AgentEvent::LowConfidence {
                    score: score.overall,
                    recommendation,
                },
            );
        }
    }
}
