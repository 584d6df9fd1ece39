//! 编排器：按构造时确定的模式运行任务
//!
//! Agent 模式先检索相似历史任务，再交给 AgentExecutor 逐步决策；Workflow 模式执行预先加载的工作流。
//! 每次运行结束后把任务结果、反思与工具使用写入任务记忆。模式在实例生命周期内不变，
//! 缺少所选模式需要的协作者时构造直接失败。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::core::error::AgentError;
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::types::{ExecutionMode, Task, TaskOutcome, ToolUsage};
use crate::core::worker::Worker;
use crate::memory::{TaskMemory, ToolStats};
use crate::react::AgentExecutor;
use crate::workflow::{WorkflowDefinition, WorkflowExecutor};

/// Agent 模式运行前检索的相似任务条数
const SIMILAR_TASK_LIMIT: usize = 3;

/// 构造编排器所需的协作者；按模式只需提供对应的执行器
pub struct OrchestratorParts {
    pub worker: Arc<Worker>,
    pub memory: Arc<dyn TaskMemory>,
    pub agent: Option<AgentExecutor>,
    pub workflow: Option<WorkflowDefinition>,
}

enum Runner {
    Agent(AgentExecutor),
    Workflow {
        executor: WorkflowExecutor,
        definition: WorkflowDefinition,
    },
}

pub struct Orchestrator {
    mode: ExecutionMode,
    runner: Runner,
    memory: Arc<dyn TaskMemory>,
    supervisor: SessionSupervisor,
}

impl Orchestrator {
    pub fn new(mode: ExecutionMode, parts: OrchestratorParts) -> Result<Self, AgentError> {
        let runner = match mode {
            ExecutionMode::Agent => {
                let agent = parts
                    .agent
                    .ok_or_else(|| AgentError::Config("AgentExecutor is required for agent mode".to_string()))?;
                Runner::Agent(agent)
            }
            ExecutionMode::Workflow => {
                let definition = parts
                    .workflow
                    .ok_or_else(|| AgentError::Config("workflow definition is required for workflow mode".to_string()))?;
                Runner::Workflow {
                    executor: WorkflowExecutor::new(parts.worker),
                    definition,
                }
            }
        };
        tracing::info!(mode = %mode, "Orchestrator initialized");
        Ok(Self {
            mode,
            runner,
            memory: parts.memory,
            supervisor: SessionSupervisor::new(),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub async fn execute(&self, goal: &str) -> TaskOutcome {
        self.execute_with_vars(goal, HashMap::new()).await
    }

    /// 运行一个目标；`vars` 作为初始上下文变量
    pub async fn execute_with_vars(&self, goal: &str, mut vars: HashMap<String, Value>) -> TaskOutcome {
        tracing::info!(goal = %goal, mode = %self.mode, "Starting task execution");
        let cancel = self.supervisor.begin();

        let outcome = match &self.runner {
            Runner::Agent(agent) => {
                match self.memory.retrieve_similar_tasks(goal, SIMILAR_TASK_LIMIT).await {
                    Ok(similar) if !similar.is_empty() => {
                        tracing::info!(count = similar.len(), "Found similar tasks in memory");
                        let summary: Vec<Value> = similar
                            .iter()
                            .map(|m| {
                                json!({
                                    "goal": m.task_goal,
                                    "success": m.task_result.get("success").cloned().unwrap_or(Value::Null),
                                })
                            })
                            .collect();
                        vars.entry("similar_tasks".to_string()).or_insert(Value::Array(summary));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to retrieve similar tasks"),
                }
                agent.execute(goal, Some(&vars), &cancel).await
            }
            Runner::Workflow { executor, definition } => executor.execute(definition, goal, Some(&vars), &cancel).await,
        };

        self.remember(goal, &outcome).await;
        outcome
    }

    /// 取消正在运行的任务；在下一轮循环开始时生效
    pub fn cancel(&self) {
        tracing::info!("Cancellation requested");
        self.supervisor.cancel();
    }

    pub async fn tool_stats(&self, tool_name: Option<&str>) -> Result<BTreeMap<String, ToolStats>, AgentError> {
        self.memory.get_tool_stats(tool_name).await
    }

    /// 写入任务记忆与逐条工具使用；失败只记日志
    async fn remember(&self, goal: &str, outcome: &TaskOutcome) {
        let mut task = Task::new(goal);
        task.id = outcome.task_id.clone();
        task.set_status(outcome.status);

        let usage: Vec<ToolUsage> = outcome.action_results.iter().map(ToolUsage::from).collect();
        let result = serde_json::to_value(outcome).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to serialize task outcome");
            json!({"success": outcome.success})
        });
        if let Err(e) = self
            .memory
            .store_task(&task, &result, outcome.reflection.as_ref(), &usage)
            .await
        {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to store task memory");
        }
        for record in &usage {
            if let Err(e) = self.memory.store_tool_usage(record).await {
                tracing::warn!(tool = %record.tool_name, error = %e, "Failed to store tool usage");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::worker::RetryPolicy;
    use crate::llm::MockLlmClient;
    use crate::memory::InMemoryTaskMemory;
    use crate::react::{Planner, Reflector};
    use crate::tools::{register_browser_tools, BrowserSession, ToolExecutor, ToolRegistry};
    use crate::workflow::WorkflowBuilder;

    fn worker() -> Arc<Worker> {
        let registry = Arc::new(ToolRegistry::new());
        register_browser_tools(&registry, &BrowserSession::new());
        let policy = RetryPolicy {
            max_retries: 1,
            retry_delay: 0.0,
            exponential_backoff: false,
        };
        Arc::new(Worker::new(ToolExecutor::new(registry, 5), policy))
    }

    fn agent(worker: Arc<Worker>, llm: Arc<MockLlmClient>) -> AgentExecutor {
        AgentExecutor::new(
            worker,
            Arc::new(Planner::new(llm.clone())),
            Arc::new(Reflector::new(llm.clone())),
            llm,
        )
        .with_max_steps(3)
    }

    #[test]
    fn test_missing_collaborator_fails_fast() {
        let memory: Arc<dyn TaskMemory> = Arc::new(InMemoryTaskMemory::new());
        let parts = OrchestratorParts {
            worker: worker(),
            memory: memory.clone(),
            agent: None,
            workflow: None,
        };
        assert!(matches!(Orchestrator::new(ExecutionMode::Agent, parts), Err(AgentError::Config(_))));

        let parts = OrchestratorParts {
            worker: worker(),
            memory,
            agent: None,
            workflow: None,
        };
        assert!(matches!(Orchestrator::new(ExecutionMode::Workflow, parts), Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_workflow_run_is_remembered() {
        let memory = Arc::new(InMemoryTaskMemory::new());
        let definition = WorkflowBuilder::from_value(&json!({
            "name": "open",
            "steps": [
                {"id": "go", "action": {"tool": "navigate", "args": {"url": "https://a.com"}}},
                {"id": "shot", "action": {"tool": "screenshot"}}
            ]
        }))
        .unwrap();
        let orch = Orchestrator::new(
            ExecutionMode::Workflow,
            OrchestratorParts {
                worker: worker(),
                memory: memory.clone(),
                agent: None,
                workflow: Some(definition),
            },
        )
        .unwrap();

        let outcome = orch.execute("open site").await;
        assert!(outcome.success);
        assert_eq!(memory.task_count(), 1);
        let stored = memory.get_work_memory(&outcome.task_id).await.unwrap().unwrap();
        assert_eq!(stored.task_goal, "open site");
        assert_eq!(stored.tool_usage.len(), 2);

        let stats = orch.tool_stats(None).await.unwrap();
        assert_eq!(stats["navigate"].total, 1);
        assert_eq!(stats["screenshot"].success_count, 1);
    }

    #[tokio::test]
    async fn test_agent_mode_sees_similar_tasks() {
        let memory = Arc::new(InMemoryTaskMemory::new());
        memory
            .store_task(&Task::new("search rust"), &json!({"success": true}), None, &[])
            .await
            .unwrap();
        let llm = Arc::new(MockLlmClient::scripted([
            r#"{"reasoning": "done", "should_continue": false}"#,
        ]));
        let w = worker();
        let orch = Orchestrator::new(
            ExecutionMode::Agent,
            OrchestratorParts {
                worker: w.clone(),
                memory: memory.clone(),
                agent: Some(agent(w, llm.clone())),
                workflow: None,
            },
        )
        .unwrap();

        let outcome = orch.execute("search crates").await;
        assert_eq!(outcome.variables["similar_tasks"][0]["goal"], "search rust");
        assert!(llm.prompts()[0].contains("search rust"));
        assert_eq!(memory.task_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_before_run_does_not_leak() {
        let memory = Arc::new(InMemoryTaskMemory::new());
        let definition = WorkflowBuilder::from_value(&json!({
            "steps": [{"action": {"tool": "wait", "args": {"timeout": 0}}}]
        }))
        .unwrap();
        let orch = Orchestrator::new(
            ExecutionMode::Workflow,
            OrchestratorParts {
                worker: worker(),
                memory,
                agent: None,
                workflow: Some(definition),
            },
        )
        .unwrap();
        orch.cancel();
        let outcome = orch.execute("wait").await;
        assert!(outcome.success);
        assert_eq!(outcome.executed_steps.len(), 1);
    }
}
