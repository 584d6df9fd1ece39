//! 核心层：数据模型、错误分类与恢复、Worker、编排器、会话监管与运行时装配

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod types;
pub mod worker;

pub use builder::{create_llm_from_config, AgentBuilder, Runtime};
pub use error::AgentError;
pub use orchestrator::{Orchestrator, OrchestratorParts};
pub use recovery::{ErrorContext, ErrorHandler, ErrorKind, RecoveryAction, RecoveryStrategy};
pub use session_supervisor::SessionSupervisor;
pub use types::*;
pub use worker::{RetryPolicy, Worker};
