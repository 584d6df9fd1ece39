//! 任务记忆：任务结果、反思与工具使用记录的持久化边界
//!
//! 核心只依赖 [`TaskMemory`] trait；提供内存实现与 SQLite 实现。

pub mod sqlite;
pub mod store;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::AgentError;
use crate::core::types::{Reflection, Task, ToolUsage};

pub use sqlite::SqliteTaskMemory;
pub use store::InMemoryTaskMemory;

/// 一条任务记忆
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// `memory_<task_id>`，同一任务重复写入时覆盖
    pub id: String,
    pub task_id: String,
    pub task_goal: String,
    pub task_result: Value,
    pub reflection: Option<Value>,
    pub tool_usage: Vec<ToolUsage>,
    pub created_at: DateTime<Local>,
}

impl MemoryEntry {
    pub fn new(task: &Task, result: &Value, reflection: Option<&Reflection>, tool_usage: &[ToolUsage]) -> Self {
        Self {
            id: format!("memory_{}", task.id),
            task_id: task.id.clone(),
            task_goal: task.goal.clone(),
            task_result: result.clone(),
            reflection: reflection.and_then(|r| serde_json::to_value(r).ok()),
            tool_usage: tool_usage.to_vec(),
            created_at: Local::now(),
        }
    }
}

/// 单个工具的使用统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStats {
    pub total: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub avg_execution_time: f64,
}

impl ToolStats {
    pub(crate) fn from_totals(total: u64, success_count: u64, time_sum: f64) -> Self {
        let (success_rate, avg_execution_time) = if total > 0 {
            (success_count as f64 / total as f64, time_sum / total as f64)
        } else {
            (0.0, 0.0)
        };
        Self {
            total,
            success_count,
            success_rate,
            avg_execution_time,
        }
    }
}

/// 相似检索使用的关键词：目标按空白切分后的第一个词（小写）
pub(crate) fn first_keyword(goal: &str) -> Option<String> {
    goal.split_whitespace().next().map(str::to_lowercase)
}

/// 任务记忆 trait
#[async_trait]
pub trait TaskMemory: Send + Sync {
    /// 保存任务结果、反思与工具使用快照；同一任务再次写入时覆盖
    async fn store_task(
        &self,
        task: &Task,
        result: &Value,
        reflection: Option<&Reflection>,
        tool_usage: &[ToolUsage],
    ) -> Result<(), AgentError>;

    /// 按关键词检索相似任务，新的在前
    async fn retrieve_similar_tasks(&self, goal: &str, limit: usize) -> Result<Vec<MemoryEntry>, AgentError>;

    /// 某个任务最近一次写入的记忆
    async fn get_work_memory(&self, task_id: &str) -> Result<Option<MemoryEntry>, AgentError>;

    /// 追加一条工具使用记录，计入统计
    async fn store_tool_usage(&self, usage: &ToolUsage) -> Result<(), AgentError>;

    /// 指定工具时只返回该工具（无记录则为空）；否则按工具名返回全部
    async fn get_tool_stats(&self, tool_name: Option<&str>) -> Result<BTreeMap<String, ToolStats>, AgentError>;
}
