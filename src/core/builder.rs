//! 运行时构建器：从 AppConfig 统一装配 LLM、工具、Worker、记忆与编排器
//!
//! CLI 与集成测试共用同一套装配逻辑；测试可以用 `with_llm` / `with_memory` 替换协作者。

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::AppConfig;
use crate::core::error::AgentError;
use crate::core::orchestrator::{Orchestrator, OrchestratorParts};
use crate::core::types::ExecutionMode;
use crate::core::worker::Worker;
use crate::llm::{
    ConfidenceEvaluator, LlmClient, MockLlmClient, OllamaClient, OpenAiClient, SamplingParams, SelfConsistencyVoter,
};
use crate::mcp::{register_mcp_tools, McpClient};
use crate::memory::{InMemoryTaskMemory, SqliteTaskMemory, TaskMemory};
use crate::react::{AgentEvent, AgentExecutor, AllResultsSucceeded, CompletionCheck, OracleDecides, Planner, Reflector};
use crate::tools::{register_browser_tools, BrowserSession, EchoTool, LlmElementLocator, ToolExecutor, ToolRegistry};
use crate::workflow::WorkflowExecutor;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// 根据 `[llm]` 段选择后端（Ollama / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    let llm = &cfg.llm;
    match llm.provider.trim().to_lowercase().as_str() {
        "ollama" => {
            tracing::info!(model = %llm.model, base_url = %llm.base_url, "Using Ollama LLM");
            let client = OllamaClient::new(&llm.base_url, &llm.model, llm.timeout_secs)?.with_temperature(llm.temperature);
            Ok(Arc::new(client))
        }
        "openai" => {
            let base = Some(llm.base_url.as_str()).filter(|b| !b.is_empty() && *b != DEFAULT_OLLAMA_URL);
            tracing::info!(model = %llm.model, "Using OpenAI-compatible LLM");
            Ok(Arc::new(OpenAiClient::new(base, &llm.model, llm.api_key.as_deref(), llm.timeout_secs)))
        }
        "mock" => {
            tracing::warn!("Using Mock LLM");
            Ok(Arc::new(MockLlmClient::new()))
        }
        other => Err(AgentError::Config(format!("unknown llm provider '{other}'"))),
    }
}

/// 装配结果：编排器与 CLI 需要直接访问的共享部件
pub struct Runtime {
    pub orchestrator: Orchestrator,
    pub registry: Arc<ToolRegistry>,
    pub session: Arc<BrowserSession>,
    pub mcp: Option<Arc<McpClient>>,
}

impl Runtime {
    /// 断开远程工具服务
    pub async fn shutdown(&self) {
        if let Some(client) = &self.mcp {
            client.disconnect().await;
        }
    }
}

pub struct AgentBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    memory: Option<Arc<dyn TaskMemory>>,
    session: Option<Arc<BrowserSession>>,
    event_tx: Option<UnboundedSender<AgentEvent>>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            memory: None,
            session: None,
            event_tx: None,
        }
    }

    /// 替换配置中的 LLM 后端
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 替换配置中的记忆后端
    pub fn with_memory(mut self, memory: Arc<dyn TaskMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// 使用外部准备好的页面会话（测试中预置页面元素）
    pub fn with_session(mut self, session: Arc<BrowserSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<AgentEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 构建记忆后端
    pub fn build_memory(&self) -> Result<Arc<dyn TaskMemory>, AgentError> {
        if let Some(memory) = &self.memory {
            return Ok(memory.clone());
        }
        match self.config.memory.backend.as_str() {
            "memory" => Ok(Arc::new(InMemoryTaskMemory::new())),
            _ => Ok(Arc::new(SqliteTaskMemory::open(&self.config.memory.database_path)?)),
        }
    }

    /// 连接 MCP 服务并注册远程工具；连接失败只记日志，本地工具照常可用
    async fn attach_mcp(&self, registry: &ToolRegistry) -> Option<Arc<McpClient>> {
        let mcp = &self.config.mcp;
        if !mcp.enabled {
            return None;
        }
        let client = Arc::new(McpClient::new(
            mcp.server_command.clone(),
            mcp.transport.clone(),
            mcp.request_timeout_secs,
        ));
        if !client.connect().await {
            tracing::warn!("MCP server unavailable, continuing with local tools");
            return Some(client);
        }
        let count = register_mcp_tools(registry, &client);
        tracing::info!(count, "Registered MCP tools");
        Some(client)
    }

    fn completion_check(&self) -> Arc<dyn CompletionCheck> {
        match self.config.agent.completion.as_str() {
            "oracle" => Arc::new(OracleDecides),
            _ => Arc::new(AllResultsSucceeded),
        }
    }

    fn voter(&self, llm: &Arc<dyn LlmClient>) -> Option<SelfConsistencyVoter> {
        self.config
            .agent
            .self_consistency
            .then(|| SelfConsistencyVoter::new(llm.clone()).with_samples(self.config.agent.num_samples))
    }

    /// 校验配置并装配全部部件
    pub async fn build(self) -> Result<Runtime, AgentError> {
        self.config.validate()?;
        let mode = self.config.agent.execution_mode()?;
        let llm = match &self.llm {
            Some(llm) => llm.clone(),
            None => create_llm_from_config(&self.config)?,
        };
        let memory = self.build_memory()?;

        let registry = Arc::new(ToolRegistry::new());
        let session = self.session.clone().unwrap_or_else(BrowserSession::new);
        register_browser_tools(&registry, &session);
        registry.register(EchoTool);
        let mcp = self.attach_mcp(&registry).await;

        let agent_cfg = &self.config.agent;
        let worker = Arc::new(
            Worker::new(ToolExecutor::new(registry.clone(), agent_cfg.action_timeout), agent_cfg.retry_policy())
                .with_locator(Arc::new(LlmElementLocator::new(llm.clone(), session.clone()))),
        );

        let (agent, workflow) = match mode {
            ExecutionMode::Agent => {
                let params = SamplingParams::with_temperature(self.config.llm.temperature);
                let mut planner = Planner::new(llm.clone())
                    .with_params(params.clone())
                    .with_recovery(worker.error_handler().clone(), agent_cfg.retry_policy());
                if let Some(voter) = self.voter(&llm) {
                    planner = planner.with_voter(voter);
                }
                let mut agent = AgentExecutor::new(
                    worker.clone(),
                    Arc::new(planner),
                    Arc::new(Reflector::new(llm.clone())),
                    llm.clone(),
                )
                .with_max_steps(agent_cfg.max_steps)
                .with_max_replans(agent_cfg.max_replans)
                .with_params(params)
                .with_completion_check(self.completion_check())
                .with_confidence_evaluator(Arc::new(ConfidenceEvaluator::new(self.config.confidence.clone())));
                if let Some(voter) = self.voter(&llm) {
                    agent = agent.with_voter(voter);
                }
                if let Some(tx) = self.event_tx.clone() {
                    agent = agent.with_event_tx(tx);
                }
                (Some(agent), None)
            }
            ExecutionMode::Workflow => {
                let path = self
                    .config
                    .workflow
                    .path
                    .as_ref()
                    .ok_or_else(|| AgentError::Config("workflow mode requires workflow.path".to_string()))?;
                (None, Some(WorkflowExecutor::load_from_file(path)?))
            }
        };

        let orchestrator = Orchestrator::new(
            mode,
            OrchestratorParts {
                worker,
                memory,
                agent,
                workflow,
            },
        )?;
        Ok(Runtime {
            orchestrator,
            registry,
            session,
            mcp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: &str) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.agent.mode = mode.to_string();
        cfg.memory.backend = "memory".to_string();
        cfg
    }

    #[test]
    fn test_create_llm_from_config() {
        let mut cfg = AppConfig::default();
        assert!(create_llm_from_config(&cfg).is_ok());
        cfg.llm.provider = "mock".into();
        assert!(create_llm_from_config(&cfg).is_ok());
        cfg.llm.provider = "gpt-local".into();
        assert!(matches!(create_llm_from_config(&cfg), Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_build_agent_runtime() {
        let runtime = AgentBuilder::new(config("agent"))
            .with_llm(Arc::new(MockLlmClient::new()))
            .build()
            .await
            .unwrap();
        assert_eq!(runtime.orchestrator.mode(), ExecutionMode::Agent);
        assert!(runtime.registry.has("navigate"));
        assert!(runtime.registry.has("echo"));
        assert!(runtime.mcp.is_none());
    }

    #[tokio::test]
    async fn test_workflow_mode_without_path_fails() {
        let result = AgentBuilder::new(config("workflow"))
            .with_llm(Arc::new(MockLlmClient::new()))
            .build()
            .await;
        assert!(matches!(result, Err(AgentError::Config(_))));
    }

    #[tokio::test]
    async fn test_workflow_file_missing_is_error() {
        let mut cfg = config("workflow");
        cfg.workflow.path = Some("definitely/missing.yaml".into());
        let result = AgentBuilder::new(cfg).with_llm(Arc::new(MockLlmClient::new())).build().await;
        assert!(matches!(result, Err(AgentError::Workflow(_))));
    }
}
