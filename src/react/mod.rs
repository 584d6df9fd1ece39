//! 认知层：Planner、Reflector、AgentExecutor 逐步决策主循环与过程事件

pub mod events;
pub mod loop_;
pub mod planner;
pub mod reflector;

pub use events::AgentEvent;
pub use loop_::{decision_from_value, AgentExecutor, AllResultsSucceeded, CompletionCheck, OracleDecides, DEFAULT_MAX_STEPS};
pub use planner::Planner;
pub use reflector::{ErrorAnalysis, Reflector, StrategyEvaluation};
