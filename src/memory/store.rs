//! 内存任务记忆：进程内保存，适合测试与不需要持久化的场景

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::AgentError;
use crate::core::types::{Reflection, Task, ToolUsage};
use crate::memory::{first_keyword, MemoryEntry, TaskMemory, ToolStats};

#[derive(Default)]
pub struct InMemoryTaskMemory {
    /// 按写入顺序保存；覆盖时先移除旧条目再追加
    tasks: RwLock<Vec<MemoryEntry>>,
    usage: RwLock<Vec<ToolUsage>>,
}

impl InMemoryTaskMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl TaskMemory for InMemoryTaskMemory {
    async fn store_task(
        &self,
        task: &Task,
        result: &Value,
        reflection: Option<&Reflection>,
        tool_usage: &[ToolUsage],
    ) -> Result<(), AgentError> {
        let entry = MemoryEntry::new(task, result, reflection, tool_usage);
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| t.id != entry.id);
        tasks.push(entry);
        tracing::info!(task_id = %task.id, "Stored task memory");
        Ok(())
    }

    async fn retrieve_similar_tasks(&self, goal: &str, limit: usize) -> Result<Vec<MemoryEntry>, AgentError> {
        let keyword = first_keyword(goal);
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        Ok(tasks
            .iter()
            .rev()
            .filter(|t| match &keyword {
                Some(k) => t.task_goal.to_lowercase().contains(k),
                None => true,
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_work_memory(&self, task_id: &str) -> Result<Option<MemoryEntry>, AgentError> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.iter().rev().find(|t| t.task_id == task_id).cloned())
    }

    async fn store_tool_usage(&self, usage: &ToolUsage) -> Result<(), AgentError> {
        self.usage
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(usage.clone());
        Ok(())
    }

    async fn get_tool_stats(&self, tool_name: Option<&str>) -> Result<BTreeMap<String, ToolStats>, AgentError> {
        let usage = self.usage.read().unwrap_or_else(|e| e.into_inner());
        let mut totals: BTreeMap<String, (u64, u64, f64)> = BTreeMap::new();
        for u in usage.iter().filter(|u| tool_name.map_or(true, |n| u.tool_name == n)) {
            let slot = totals.entry(u.tool_name.clone()).or_default();
            slot.0 += 1;
            slot.1 += u64::from(u.success);
            slot.2 += u.execution_time;
        }
        Ok(totals
            .into_iter()
            .map(|(name, (total, ok, time))| (name, ToolStats::from_totals(total, ok, time)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;
    use serde_json::json;

    fn usage(tool: &str, success: bool, time: f64) -> ToolUsage {
        ToolUsage {
            tool_name: tool.to_string(),
            success,
            execution_time: time,
            error: None,
            timestamp: Local::now(),
        }
    }

    #[tokio::test]
    async fn test_similar_tasks_newest_first() {
        let mem = InMemoryTaskMemory::new();
        let a = Task::new("search rust docs");
        let b = Task::new("open settings");
        let c = Task::new("Search crates");
        for t in [&a, &b, &c] {
            mem.store_task(t, &json!({"success": true}), None, &[]).await.unwrap();
        }
        let found = mem.retrieve_similar_tasks("search again", 5).await.unwrap();
        let ids: Vec<_> = found.iter().map(|m| m.task_id.as_str()).collect();
        assert_eq!(ids, vec![c.id.as_str(), a.id.as_str()]);
        assert_eq!(mem.retrieve_similar_tasks("   ", 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_store_task_overwrites() {
        let mem = InMemoryTaskMemory::new();
        let task = Task::new("g");
        mem.store_task(&task, &json!({"n": 1}), None, &[]).await.unwrap();
        mem.store_task(&task, &json!({"n": 2}), None, &[usage("click", true, 0.1)]).await.unwrap();
        assert_eq!(mem.task_count(), 1);
        let entry = mem.get_work_memory(&task.id).await.unwrap().unwrap();
        assert_eq!(entry.task_result["n"], 2);
        assert_eq!(entry.tool_usage.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_stats() {
        let mem = InMemoryTaskMemory::new();
        mem.store_tool_usage(&usage("click", true, 1.0)).await.unwrap();
        mem.store_tool_usage(&usage("click", false, 3.0)).await.unwrap();
        mem.store_tool_usage(&usage("navigate", true, 0.5)).await.unwrap();

        let all = mem.get_tool_stats(None).await.unwrap();
        assert_eq!(all.len(), 2);
        let click = &all["click"];
        assert_eq!(click.total, 2);
        assert_eq!(click.success_count, 1);
        assert!((click.success_rate - 0.5).abs() < 1e-9);
        assert!((click.avg_execution_time - 2.0).abs() < 1e-9);

        assert_eq!(mem.get_tool_stats(Some("navigate")).await.unwrap().len(), 1);
        assert!(mem.get_tool_stats(Some("scroll")).await.unwrap().is_empty());
    }
}
