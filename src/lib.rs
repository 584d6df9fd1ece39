//! Helm - 目标驱动的智能体编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 数据模型、错误与恢复、Worker、编排器与运行时装配
//! - **llm**: oracle 抽象与实现、提示词、输出解析修复、置信度与投票
//! - **mcp**: stdio JSON-RPC 远程工具客户端
//! - **memory**: 任务记忆（内存 / SQLite）
//! - **observability**: tracing 初始化
//! - **react**: Planner、Reflector、逐步决策主循环
//! - **tools**: 工具契约、注册表、执行器与内置交互工具
//! - **workflow**: 工作流定义、表达式求值与执行

pub mod config;
pub mod core;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
pub mod workflow;

pub use crate::core::{AgentBuilder, AgentError, Orchestrator, Runtime};
