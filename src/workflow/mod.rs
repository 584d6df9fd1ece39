//! 工作流模块：预定义步骤的确定性执行

pub mod builder;
pub mod engine;
pub mod expr;
pub mod types;

pub use builder::WorkflowBuilder;
pub use engine::WorkflowExecutor;
pub use expr::{evaluate, evaluate_condition, run_assignments, Bindings};
pub use types::*;
