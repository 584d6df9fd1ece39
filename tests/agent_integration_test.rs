//! Agent 模式端到端测试：脚本化 oracle 驱动完整的决策 → 执行 → 反思流程

use std::sync::Arc;

use helm::config::AppConfig;
use helm::core::{ExecutionMode, TaskStatus};
use helm::llm::MockLlmClient;
use helm::memory::{InMemoryTaskMemory, TaskMemory};
use helm::react::AgentEvent;
use helm::tools::BrowserSession;
use helm::{AgentBuilder, AgentError};

const NAVIGATE: &str = r#"{"reasoning": "先打开搜索页", "confidence": 0.9, "should_continue": true,
  "action": {"type": "gui", "tool": "navigate", "args": {"url": "https://search.example.com"}}}"#;
const CLICK: &str = r##"```json
{"reasoning": "点击搜索按钮", "confidence": 0.85, "should_continue": true,
 "action": {"type": "gui", "tool": "click", "args": {"target": "#search-btn"}}}
```"##;
const STOP: &str = r#"{"reasoning": "目标已完成", "confidence": 0.95, "should_continue": false}"#;
const REFLECTION: &str = r#"{"success": true, "analysis": "打开页面并点击了按钮", "suggestions": [], "needs_replan": false, "confidence": 0.9}"#;
const SKIP: &str = r#"{"reasoning": "暂时跳过", "should_continue": true, "should_skip": true}"#;

fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.memory.backend = "memory".into();
    cfg.agent.completion = "oracle".into();
    cfg.agent.retry_delay = 0.0;
    cfg
}

#[tokio::test]
async fn test_navigate_then_click() {
    let llm = Arc::new(MockLlmClient::scripted([NAVIGATE, CLICK, STOP, REFLECTION]));
    let session = BrowserSession::new();
    let memory = Arc::new(InMemoryTaskMemory::new());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let runtime = AgentBuilder::new(config())
        .with_llm(llm.clone())
        .with_memory(memory.clone())
        .with_session(session.clone())
        .with_event_tx(tx)
        .build()
        .await
        .unwrap();
    assert_eq!(runtime.orchestrator.mode(), ExecutionMode::Agent);

    let outcome = runtime.orchestrator.execute("在搜索页点击搜索按钮").await;
    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.status, TaskStatus::Completed);
    assert_eq!(outcome.action_results.len(), 2);
    assert_eq!(outcome.action_results[0].tool, "navigate");
    assert_eq!(outcome.action_results[1].tool, "click");
    assert_eq!(outcome.variables["step_1_result"]["url"], "https://search.example.com");
    assert_eq!(outcome.variables["step_2_result"]["target"], "#search-btn");

    let reflection = outcome.reflection.as_ref().unwrap();
    assert!(reflection.success);
    assert!(!reflection.needs_replan);

    assert_eq!(session.current_url().as_deref(), Some("https://search.example.com"));
    assert_eq!(session.history().len(), 2);
    assert_eq!(llm.call_count(), 4);

    let stats = runtime.orchestrator.tool_stats(None).await.unwrap();
    assert_eq!(stats["navigate"].success_count, 1);
    assert_eq!(stats["click"].total, 1);
    assert!(memory.get_work_memory(&outcome.task_id).await.unwrap().is_some());

    drop(runtime);
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    assert!(events.iter().any(|e| matches!(e, AgentEvent::ToolCall { tool, .. } if tool == "click")));
    assert!(matches!(events.last(), Some(AgentEvent::Finished { success: true, .. })));
}

#[tokio::test]
async fn test_max_steps_bound() {
    let llm = Arc::new(MockLlmClient::scripted([SKIP]));
    let mut cfg = config();
    cfg.agent.max_steps = 4;
    let runtime = AgentBuilder::new(cfg).with_llm(llm.clone()).build().await.unwrap();

    let outcome = runtime.orchestrator.execute("永远不会结束的目标").await;
    assert!(outcome.action_results.is_empty());
    assert_eq!(outcome.step_count, 4);
    assert_eq!(outcome.status, TaskStatus::Completed);
    // 4 次决策 + 1 次反思
    assert_eq!(llm.call_count(), 5);
}

#[tokio::test]
async fn test_first_success_completes_by_default() {
    let llm = Arc::new(MockLlmClient::scripted([NAVIGATE, CLICK, STOP, REFLECTION]));
    let mut cfg = config();
    cfg.agent.completion = "all_succeeded".into();
    let runtime = AgentBuilder::new(cfg).with_llm(llm.clone()).build().await.unwrap();

    let outcome = runtime.orchestrator.execute("打开搜索页").await;
    assert_eq!(outcome.action_results.len(), 1);
    assert_eq!(outcome.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_misconfigured_orchestrator_fails_fast() {
    let mut cfg = config();
    cfg.agent.mode = "workflow".into();
    let err = AgentBuilder::new(cfg)
        .with_llm(Arc::new(MockLlmClient::new()))
        .build()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AgentError::Config(_)));

    let mut cfg = config();
    cfg.agent.mode = "swarm".into();
    let result = AgentBuilder::new(cfg).with_llm(Arc::new(MockLlmClient::new())).build().await;
    assert!(matches!(result, Err(AgentError::Config(_))));
}
