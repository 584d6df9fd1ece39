//! LLM 层：oracle 抽象与实现（Ollama / OpenAI 兼容 / Mock）、提示词、输出解析与修复、
//! 输出验证、置信度、Self-Consistency 投票与不确定性跟踪

pub mod confidence;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod output_parser;
pub mod prompts;
pub mod self_consistency;
pub mod traits;
pub mod uncertainty;
pub mod validator;

pub use confidence::{ConfidenceEvaluator, ConfidenceLevel, ConfidenceScore, ConfidenceThreshold};
pub use mock::MockLlmClient;
pub use ollama::OllamaClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use output_parser::{extract_json, repair_json, ParseSource, ParsedPlan, PlanParser};
pub use self_consistency::{ConsistencyResult, SelfConsistencyVoter, VotingStrategy};
pub use traits::{LlmClient, SamplingParams};
pub use uncertainty::{UncertaintyMetrics, UncertaintyReport, UncertaintyTracker};
pub use validator::{OutputKind, OutputValidator, ValidationReport};
