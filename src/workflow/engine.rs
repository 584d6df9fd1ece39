//! 工作流引擎
//!
//! 确定性执行预定义步骤：条件判断 → Worker 带重试执行 → 按出错策略决定中止、跳过或继续；
//! 结束后运行一次完成钩子（失败只记日志）。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::types::{Context, Task, TaskOutcome, TaskStatus};
use crate::core::worker::{RetryPolicy, Worker};
use crate::workflow::builder::WorkflowBuilder;
use crate::workflow::expr::{evaluate_condition, run_assignments, Bindings};
use crate::workflow::types::*;

/// 工作流执行器
pub struct WorkflowExecutor {
    worker: Arc<Worker>,
}

impl WorkflowExecutor {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    /// 从文件加载：`.yaml` / `.yml` 按 YAML 解析，其余按 JSON
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<WorkflowDefinition, WorkflowError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(WorkflowError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_lowercase().as_str(), "yaml" | "yml"))
            .unwrap_or(false);
        let data: Value = if is_yaml {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        let workflow = WorkflowBuilder::from_value(&data)?;
        tracing::info!(path = %path.display(), id = %workflow.id, steps = workflow.steps.len(), "Workflow loaded");
        Ok(workflow)
    }

    /// 从内存中的值加载
    pub fn load_from_value(data: &Value) -> Result<WorkflowDefinition, WorkflowError> {
        WorkflowBuilder::from_value(data)
    }

    /// 按名称、描述或 `variables.keywords` 匹配目标，返回第一个命中的工作流
    pub fn match_workflow<'a>(goal: &str, workflows: &'a [WorkflowDefinition]) -> Option<&'a WorkflowDefinition> {
        let goal = goal.to_lowercase();
        let hit = |needle: &str| {
            let needle = needle.trim().to_lowercase();
            !needle.is_empty() && goal.contains(&needle)
        };
        workflows
            .iter()
            .find(|wf| hit(&wf.name) || hit(&wf.description) || wf.keywords().into_iter().any(|k| hit(k)))
    }

    /// 执行工作流；取消在每个步骤开始前检查
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        goal: &str,
        initial_vars: Option<&HashMap<String, Value>>,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        tracing::info!(workflow = %workflow.name, id = %workflow.id, "Executing workflow");
        let mut task = Task::new(goal);
        task.set_status(TaskStatus::Running);
        let mut ctx = Context::new(task);
        if let Some(vars) = initial_vars {
            ctx.extend_vars(vars);
        }
        ctx.extend_vars(&workflow.variables);

        let mut executed_steps = Vec::new();
        let mut cancelled = false;
        let mut aborted_at: Option<String> = None;

        for step in &workflow.steps {
            if cancel.is_cancelled() {
                tracing::info!(step = %step.id, "Workflow cancelled by user");
                cancelled = true;
                break;
            }

            if let Some(condition) = &step.condition {
                let met = evaluate_condition(condition, &Bindings::from_context(&ctx)).unwrap_or_else(|e| {
                    tracing::warn!(step = %step.id, condition = %condition, error = %e, "Failed to evaluate condition");
                    false
                });
                if !met {
                    tracing::info!(step = %step.id, "Skipping step due to condition not met");
                    continue;
                }
            }

            tracing::info!(step = %step.id, name = %step.name, "Executing step");
            let policy = RetryPolicy {
                max_retries: step.attempts(),
                ..self.worker.policy().clone()
            };
            let result = self.worker.execute_with_policy(&step.action, &policy).await;
            if result.success {
                if let Some(data) = result.data.as_ref().filter(|d| !d.is_null()) {
                    ctx.set_var(format!("step_{}_result", step.id), data.clone());
                }
            }
            let failed = !result.success;
            ctx.action_results.push(result);
            executed_steps.push(step.id.clone());

            if failed {
                match workflow.error_policy(step) {
                    ErrorPolicy::Abort => {
                        tracing::error!(step = %step.id, "Step failed, aborting workflow");
                        aborted_at = Some(step.id.clone());
                        break;
                    }
                    ErrorPolicy::Skip => tracing::warn!(step = %step.id, "Step failed, skipping"),
                    ErrorPolicy::Continue => tracing::warn!(step = %step.id, "Step failed, continuing"),
                }
            }
        }

        if let Some(hook) = &workflow.on_complete {
            let mut bindings = Bindings::from_context(&ctx);
            match run_assignments(hook, &mut bindings) {
                Ok(assigned) => {
                    for (name, value) in assigned {
                        ctx.set_var(name, value);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Error executing completion handler"),
            }
        }

        let all_success = ctx.action_results.iter().all(|r| r.success);
        let status = if cancelled {
            TaskStatus::Cancelled
        } else if all_success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        ctx.task.set_status(status);
        tracing::info!(
            workflow = %workflow.id,
            ?status,
            executed = executed_steps.len(),
            "Workflow finished"
        );

        let error = if cancelled {
            Some("任务已取消".to_string())
        } else {
            aborted_at.map(|id| format!("步骤 {id} 失败，工作流已中止"))
        };
        TaskOutcome {
            task_id: ctx.task.id.clone(),
            success: all_success && !cancelled,
            status,
            step_count: executed_steps.len(),
            variables: ctx.variables_json(),
            action_results: ctx.action_results,
            reflection: None,
            executed_steps,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Action, ActionKind};
    use crate::tools::{register_browser_tools, BrowserSession, ToolExecutor, ToolRegistry};
    use serde_json::json;

    fn executor() -> (WorkflowExecutor, Arc<BrowserSession>) {
        let registry = Arc::new(ToolRegistry::new());
        let session = BrowserSession::new();
        register_browser_tools(&registry, &session);
        let policy = RetryPolicy {
            max_retries: 3,
            retry_delay: 0.0,
            exponential_backoff: false,
        };
        let worker = Arc::new(Worker::new(ToolExecutor::new(registry, 5), policy));
        (WorkflowExecutor::new(worker), session)
    }

    fn step(id: &str, tool: &str, args: Value) -> WorkflowStep {
        WorkflowStep::new(id, Action::new(ActionKind::Gui, tool, args))
    }

    #[tokio::test]
    async fn test_condition_skips_step() {
        let (exec, session) = executor();
        let wf = WorkflowBuilder::new("cond")
            .variable("go", json!(false))
            .step(step("open", "navigate", json!({"url": "https://a.com"})).with_condition("variables['go']"))
            .step(step("shot", "screenshot", json!({})).with_condition("len(action_results) == 0"))
            .build()
            .unwrap();
        let outcome = exec.execute(&wf, "g", None, &CancellationToken::new()).await;
        assert_eq!(outcome.executed_steps, vec!["shot"]);
        assert!(session.current_url().is_none());
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_bad_condition_is_false() {
        let (exec, _) = executor();
        let wf = WorkflowBuilder::new("bad")
            .step(step("open", "navigate", json!({"url": "https://a.com"})).with_condition("os.system('rm')"))
            .build()
            .unwrap();
        let outcome = exec.execute(&wf, "g", None, &CancellationToken::new()).await;
        assert!(outcome.executed_steps.is_empty());
    }

    #[tokio::test]
    async fn test_completion_hook_sets_variables() {
        let (exec, _) = executor();
        let wf = WorkflowBuilder::new("hook")
            .step(step("open", "navigate", json!({"url": "https://a.com"})))
            .on_complete("set visited = variables['step_open_result']['url']; set n = len(action_results)")
            .build()
            .unwrap();
        let outcome = exec.execute(&wf, "g", None, &CancellationToken::new()).await;
        assert_eq!(outcome.variables["visited"], "https://a.com");
        assert_eq!(outcome.variables["n"], 1);
    }

    #[tokio::test]
    async fn test_failing_hook_is_logged_not_propagated() {
        let (exec, _) = executor();
        let wf = WorkflowBuilder::new("hook")
            .step(step("open", "navigate", json!({"url": "https://a.com"})))
            .on_complete("set x = undefined_name")
            .build()
            .unwrap();
        let outcome = exec.execute(&wf, "g", None, &CancellationToken::new()).await;
        assert!(outcome.success);
        assert!(outcome.variables.get("x").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_steps() {
        let (exec, _) = executor();
        let wf = WorkflowBuilder::new("c")
            .step(step("open", "navigate", json!({"url": "https://a.com"})))
            .build()
            .unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = exec.execute(&wf, "g", None, &token).await;
        assert_eq!(outcome.status, TaskStatus::Cancelled);
        assert!(outcome.executed_steps.is_empty());
    }

    #[test]
    fn test_match_workflow() {
        let search = WorkflowBuilder::new("百度搜索")
            .variable("keywords", json!(["search", "查找"]))
            .build()
            .unwrap();
        let login = WorkflowBuilder::new("login").build().unwrap();
        let all = vec![search, login];
        assert_eq!(WorkflowExecutor::match_workflow("帮我查找 rust", &all).map(|w| w.name.as_str()), Some("百度搜索"));
        assert_eq!(WorkflowExecutor::match_workflow("Login to site", &all).map(|w| w.name.as_str()), Some("login"));
        assert!(WorkflowExecutor::match_workflow("nothing", &all).is_none());
    }
}
