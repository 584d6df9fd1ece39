//! 应用配置：从 config/default.toml、显式配置文件与环境变量加载
//!
//! 加载顺序：先读默认文件，再叠加 `--config` 指定的文件，最后用环境变量 `HELM__*` 覆盖
//! （双下划线表示嵌套，如 `HELM__LLM__MODEL=qwen2.5`）。

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::error::AgentError;
use crate::core::types::ExecutionMode;
use crate::core::worker::RetryPolicy;
use crate::llm::ConfidenceThreshold;

/// 应用配置根
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub confidence: ConfidenceThreshold,
    pub mcp: McpSection,
    pub memory: MemorySection,
    pub workflow: WorkflowSection,
    pub log: LogSection,
}

/// [llm] 段：后端选择、地址与采样
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// ollama / openai / mock
    pub provider: String,
    pub base_url: String,
    pub model: String,
    /// 未设置时 openai 后端读取 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub temperature: f64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:latest".to_string(),
            api_key: None,
            timeout_secs: 120,
            temperature: 0.7,
        }
    }
}

/// [agent] 段：执行模式、步数与重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// agent / workflow
    pub mode: String,
    pub max_steps: usize,
    /// 反思要求重新规划时最多重规划几次
    pub max_replans: usize,
    pub max_retries: u32,
    /// 基础重试延迟（秒）
    pub retry_delay: f64,
    pub exponential_backoff: bool,
    /// 单次工具调用超时（秒）
    pub action_timeout: u64,
    /// all_succeeded：全部结果成功即结束；oracle：只由决策中的 should_continue 结束
    pub completion: String,
    pub self_consistency: bool,
    pub num_samples: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            mode: "agent".to_string(),
            max_steps: 50,
            max_replans: 0,
            max_retries: 3,
            retry_delay: 1.0,
            exponential_backoff: true,
            action_timeout: 30,
            completion: "all_succeeded".to_string(),
            self_consistency: false,
            num_samples: 5,
        }
    }
}

impl AgentSection {
    pub fn execution_mode(&self) -> Result<ExecutionMode, AgentError> {
        match self.mode.trim().to_lowercase().as_str() {
            "agent" => Ok(ExecutionMode::Agent),
            "workflow" => Ok(ExecutionMode::Workflow),
            other => Err(AgentError::Config(format!("unknown execution mode '{other}'"))),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            exponential_backoff: self.exponential_backoff,
        }
    }
}

/// [mcp] 段：远程工具服务
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSection {
    pub enabled: bool,
    /// 启动子进程的完整命令行
    pub server_command: Option<String>,
    pub transport: String,
    pub request_timeout_secs: u64,
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            enabled: false,
            server_command: None,
            transport: "stdio".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// [memory] 段：任务记忆后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// sqlite / memory
    pub backend: String,
    pub database_path: PathBuf,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            database_path: PathBuf::from("./data/memory.db"),
        }
    }
}

/// [workflow] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WorkflowSection {
    /// 工作流模式下加载的定义文件
    pub path: Option<PathBuf>,
}

/// [log] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub json: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// 检查模式与协作者配置是否自洽；权重和阈值必须在 [0, 1]
    pub fn validate(&self) -> Result<(), AgentError> {
        let mode = self.agent.execution_mode()?;
        if mode == ExecutionMode::Workflow && self.workflow.path.is_none() {
            return Err(AgentError::Config("workflow mode requires workflow.path".to_string()));
        }
        if self.mcp.enabled && self.mcp.server_command.as_deref().map_or(true, |c| c.trim().is_empty()) {
            return Err(AgentError::Config("mcp.enabled requires mcp.server_command".to_string()));
        }
        if !matches!(self.agent.completion.as_str(), "all_succeeded" | "oracle") {
            return Err(AgentError::Config(format!(
                "unknown completion check '{}'",
                self.agent.completion
            )));
        }
        if !matches!(self.memory.backend.as_str(), "sqlite" | "memory") {
            return Err(AgentError::Config(format!("unknown memory backend '{}'", self.memory.backend)));
        }
        if self.agent.max_steps == 0 {
            return Err(AgentError::Config("agent.max_steps must be positive".to_string()));
        }

        let c = &self.confidence;
        let bounded = [
            ("tool_weight", c.tool_weight),
            ("param_weight", c.param_weight),
            ("structure_weight", c.structure_weight),
            ("consistency_weight", c.consistency_weight),
            ("min_confidence", c.min_confidence),
            ("high_confidence", c.high_confidence),
        ];
        for (name, value) in bounded {
            if !(0.0..=1.0).contains(&value) {
                return Err(AgentError::Config(format!("confidence.{name} = {value} is outside [0, 1]")));
            }
        }
        Ok(())
    }
}

/// 加载配置
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在）
/// 3. 最后叠加环境变量 HELM__*
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HELM")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.provider, "ollama");
        assert_eq!(cfg.agent.max_steps, 50);
        assert_eq!(cfg.agent.retry_policy().max_retries, 3);
        assert_eq!(cfg.memory.database_path, PathBuf::from("./data/memory.db"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_misconfiguration() {
        let mut cfg = AppConfig::default();
        cfg.agent.mode = "hybrid".into();
        assert!(matches!(cfg.validate(), Err(AgentError::Config(_))));

        let mut cfg = AppConfig::default();
        cfg.agent.mode = "workflow".into();
        assert!(cfg.validate().is_err());
        cfg.workflow.path = Some(PathBuf::from("wf.yaml"));
        assert!(cfg.validate().is_ok());

        let mut cfg = AppConfig::default();
        cfg.mcp.enabled = true;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.confidence.tool_weight = 1.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tool_weight"));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[llm]\nmodel = \"qwen2.5\"\n\n[agent]\nmode = \"workflow\"\nmax_steps = 7\n\n[confidence]\nmin_confidence = 0.5\n\n[workflow]\npath = \"flows/login.yaml\""
        )
        .unwrap();
        let cfg = load_config(Some(file.path())).unwrap();
        assert_eq!(cfg.llm.model, "qwen2.5");
        assert_eq!(cfg.llm.base_url, "http://localhost:11434");
        assert_eq!(cfg.agent.max_steps, 7);
        assert_eq!(cfg.agent.execution_mode().unwrap(), ExecutionMode::Workflow);
        assert!((cfg.confidence.min_confidence - 0.5).abs() < 1e-9);
        assert!((cfg.confidence.tool_weight - 0.3).abs() < 1e-9);
        assert!(cfg.validate().is_ok());
    }
}
