//! 工作流集成测试：从 YAML/JSON 文件加载定义，经 AgentBuilder 装配后执行

use std::io::Write;
use std::sync::Arc;

use helm::config::AppConfig;
use helm::core::{ExecutionMode, TaskStatus};
use helm::llm::MockLlmClient;
use helm::memory::{InMemoryTaskMemory, TaskMemory};
use helm::workflow::WorkflowExecutor;
use helm::{AgentBuilder, Runtime};
use tempfile::NamedTempFile;

const SEARCH_YAML: &str = r##"
name: search
description: 打开搜索页并提交
variables:
  query: rust
  keywords: [search]
steps:
  - id: open
    action:
      tool: navigate
      args:
        url: https://search.example.com
  - id: type
    action:
      tool: input
      args:
        target: "#q"
        text: rust
  - id: submit
    on_error: ${ON_ERROR}
    action:
      tool: click
      description: 点击提交按钮
  - id: shot
    action:
      tool: screenshot
on_complete: "set steps_run = len(action_results)"
"##;

fn write_workflow(body: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

async fn runtime(file: &NamedTempFile, memory: Arc<InMemoryTaskMemory>) -> Runtime {
    let mut cfg = AppConfig::default();
    cfg.agent.mode = "workflow".into();
    cfg.agent.retry_delay = 0.0;
    cfg.agent.max_retries = 1;
    cfg.workflow.path = Some(file.path().to_path_buf());
    AgentBuilder::new(cfg)
        .with_llm(Arc::new(MockLlmClient::new()))
        .with_memory(memory)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_abort_stops_at_failed_step() {
    let file = write_workflow(&SEARCH_YAML.replace("${ON_ERROR}", "abort"), ".yaml");
    let memory = Arc::new(InMemoryTaskMemory::new());
    let runtime = runtime(&file, memory.clone()).await;
    assert_eq!(runtime.orchestrator.mode(), ExecutionMode::Workflow);

    let outcome = runtime.orchestrator.execute("search for rust").await;
    assert!(!outcome.success);
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert_eq!(outcome.executed_steps, vec!["open", "type", "submit"]);
    assert!(outcome.error.as_deref().unwrap().contains("submit"));
    assert_eq!(outcome.variables["steps_run"], 3);
    assert_eq!(outcome.variables["query"], "rust");
    assert_eq!(runtime.session.value_of("#q").as_deref(), Some("rust"));

    // 导航后页面元素未知，缺少 target 的点击无法定位
    let stats = memory.get_tool_stats(Some("click")).await.unwrap();
    assert_eq!(stats["click"].success_count, 0);
    assert!(outcome.action_results[2].error.as_deref().unwrap().contains("target"));
}

#[tokio::test]
async fn test_skip_runs_remaining_steps() {
    let file = write_workflow(&SEARCH_YAML.replace("${ON_ERROR}", "skip"), ".yml");
    let memory = Arc::new(InMemoryTaskMemory::new());
    let runtime = runtime(&file, memory.clone()).await;

    let outcome = runtime.orchestrator.execute("search for rust").await;
    assert_eq!(outcome.executed_steps, vec!["open", "type", "submit", "shot"]);
    assert_eq!(outcome.status, TaskStatus::Failed);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.variables["steps_run"], 4);
    assert!(outcome.variables.get("step_submit_result").is_none());
    assert_eq!(outcome.variables["step_open_result"]["url"], "https://search.example.com");
    assert_eq!(memory.task_count(), 1);
}

#[tokio::test]
async fn test_json_definition_and_matching() {
    let file = write_workflow(
        r#"{"name": "login", "description": "sign in", "steps": [
            {"id": "open", "action": {"tool": "navigate", "args": {"url": "https://a.com/login"}}}
        ]}"#,
        ".json",
    );
    let login = WorkflowExecutor::load_from_file(file.path()).unwrap();
    assert_eq!(login.steps.len(), 1);

    let yaml = write_workflow(&SEARCH_YAML.replace("${ON_ERROR}", "continue"), ".yaml");
    let search = WorkflowExecutor::load_from_file(yaml.path()).unwrap();
    let all = vec![login, search];
    assert_eq!(
        WorkflowExecutor::match_workflow("please SEARCH the web", &all).map(|w| w.name.as_str()),
        Some("search")
    );
    assert_eq!(
        WorkflowExecutor::match_workflow("Sign In now", &all).map(|w| w.name.as_str()),
        Some("login")
    );
}

#[tokio::test]
async fn test_invalid_definition_rejected() {
    let file = write_workflow("steps: {not: a list}", ".yaml");
    assert!(WorkflowExecutor::load_from_file(file.path()).is_err());
}
