//! SQLite 任务记忆
//!
//! 两张表：`task_memories`（任务结果 / 反思 / 工具使用快照，JSON 文本）与
//! `tool_usage`（逐条工具调用记录，用于统计）。rusqlite 是同步接口，
//! 所有语句在 `spawn_blocking` 中执行，连接由互斥锁串行化。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::core::error::AgentError;
use crate::core::types::{Reflection, Task, ToolUsage};
use crate::memory::{first_keyword, MemoryEntry, TaskMemory, ToolStats};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_memories (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    task_goal TEXT NOT NULL,
    task_result TEXT NOT NULL,
    reflection TEXT,
    tool_usage TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_memories_created ON task_memories(created_at DESC);

CREATE TABLE IF NOT EXISTS tool_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_name TEXT NOT NULL,
    success INTEGER NOT NULL,
    execution_time REAL NOT NULL,
    error TEXT,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tool_usage_name ON tool_usage(tool_name);
"#;

const SELECT_ENTRY: &str =
    "SELECT id, task_id, task_goal, task_result, reflection, tool_usage, created_at FROM task_memories";

/// 从库中读出的原始行，JSON 列在锁外解析
struct RawEntry {
    id: String,
    task_id: String,
    task_goal: String,
    task_result: String,
    reflection: Option<String>,
    tool_usage: Option<String>,
    created_at: String,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            task_goal: row.get(2)?,
            task_result: row.get(3)?,
            reflection: row.get(4)?,
            tool_usage: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<MemoryEntry, AgentError> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|d| d.with_timezone(&Local))
            .map_err(|e| AgentError::Other(format!("invalid created_at '{}': {e}", self.created_at)))?;
        Ok(MemoryEntry {
            id: self.id,
            task_id: self.task_id,
            task_goal: self.task_goal,
            task_result: serde_json::from_str(&self.task_result)?,
            reflection: self.reflection.as_deref().map(serde_json::from_str).transpose()?,
            tool_usage: match self.tool_usage.as_deref() {
                Some(text) => serde_json::from_str(text)?,
                None => Vec::new(),
            },
            created_at,
        })
    }
}

fn storage_err(e: rusqlite::Error) -> AgentError {
    AgentError::Other(format!("task memory storage error: {e}"))
}

fn timestamp(t: &DateTime<Local>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, false)
}

pub struct SqliteTaskMemory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskMemory {
    /// 打开（必要时创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(storage_err)?;
        let memory = Self::with_connection(conn)?;
        tracing::info!(path = %path.display(), "Memory database initialized");
        Ok(memory)
    }

    /// 内存数据库，进程结束即丢弃
    pub fn in_memory() -> Result<Self, AgentError> {
        Self::with_connection(Connection::open_in_memory().map_err(storage_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| AgentError::Other(format!("task memory worker failed: {e}")))?
        .map_err(storage_err)
    }
}

#[async_trait]
impl TaskMemory for SqliteTaskMemory {
    async fn store_task(
        &self,
        task: &Task,
        result: &Value,
        reflection: Option<&Reflection>,
        tool_usage: &[ToolUsage],
    ) -> Result<(), AgentError> {
        let entry = MemoryEntry::new(task, result, reflection, tool_usage);
        let result_text = serde_json::to_string(&entry.task_result)?;
        let reflection_text = entry.reflection.as_ref().map(serde_json::to_string).transpose()?;
        let usage_text = serde_json::to_string(&entry.tool_usage)?;
        let created_at = timestamp(&entry.created_at);
        let task_id = entry.task_id.clone();

        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO task_memories
                 (id, task_id, task_goal, task_result, reflection, tool_usage, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id,
                    entry.task_id,
                    entry.task_goal,
                    result_text,
                    reflection_text,
                    usage_text,
                    created_at
                ],
            )
        })
        .await?;
        tracing::info!(task_id = %task_id, "Stored task memory");
        Ok(())
    }

    async fn retrieve_similar_tasks(&self, goal: &str, limit: usize) -> Result<Vec<MemoryEntry>, AgentError> {
        let pattern = first_keyword(goal)
            .map(|k| format!("%{k}%"))
            .unwrap_or_else(|| "%".to_string());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_ENTRY} WHERE lower(task_goal) LIKE ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![pattern, limit], RawEntry::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        rows.into_iter().map(RawEntry::decode).collect()
    }

    async fn get_work_memory(&self, task_id: &str) -> Result<Option<MemoryEntry>, AgentError> {
        let task_id = task_id.to_string();
        let row = self
            .run(move |conn| {
                conn.query_row(
                    &format!("{SELECT_ENTRY} WHERE task_id = ?1 ORDER BY created_at DESC LIMIT 1"),
                    params![task_id],
                    RawEntry::from_row,
                )
                .optional()
            })
            .await?;
        row.map(RawEntry::decode).transpose()
    }

    async fn store_tool_usage(&self, usage: &ToolUsage) -> Result<(), AgentError> {
        let usage = usage.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO tool_usage (tool_name, success, execution_time, error, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    usage.tool_name,
                    i64::from(usage.success),
                    usage.execution_time,
                    usage.error,
                    timestamp(&usage.timestamp)
                ],
            )
        })
        .await?;
        Ok(())
    }

    async fn get_tool_stats(&self, tool_name: Option<&str>) -> Result<BTreeMap<String, ToolStats>, AgentError> {
        let tool_name = tool_name.map(str::to_string);
        let rows = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT tool_name, COUNT(*), SUM(success), SUM(execution_time)
                     FROM tool_usage
                     WHERE ?1 IS NULL OR tool_name = ?1
                     GROUP BY tool_name",
                )?;
                let rows = stmt.query_map(params![tool_name], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                    ))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(name, total, ok, time)| {
                let stats = ToolStats::from_totals(
                    u64::try_from(total).unwrap_or(0),
                    u64::try_from(ok.unwrap_or(0)).unwrap_or(0),
                    time.unwrap_or(0.0),
                );
                (name, stats)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskStatus;
    use serde_json::json;

    fn usage(tool: &str, success: bool, time: f64) -> ToolUsage {
        ToolUsage {
            tool_name: tool.to_string(),
            success,
            execution_time: time,
            error: (!success).then(|| "boom".to_string()),
            timestamp: Local::now(),
        }
    }

    #[tokio::test]
    async fn test_store_and_retrieve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mem = SqliteTaskMemory::open(dir.path().join("data").join("memory.db")).unwrap();

        let mut task = Task::new("Search rust async book");
        task.set_status(TaskStatus::Completed);
        let reflection = Reflection {
            task_id: task.id.clone(),
            success: true,
            analysis: "顺利完成".to_string(),
            suggestions: vec![],
            needs_replan: false,
            confidence: 0.9,
            timestamp: Local::now(),
        };
        mem.store_task(&task, &json!({"success": true}), Some(&reflection), &[usage("navigate", true, 0.2)])
            .await
            .unwrap();
        mem.store_task(&Task::new("open settings"), &json!({"success": false}), None, &[])
            .await
            .unwrap();

        let found = mem.retrieve_similar_tasks("search docs", 5).await.unwrap();
        assert_eq!(found.len(), 1);
        let entry = &found[0];
        assert_eq!(entry.id, format!("memory_{}", task.id));
        assert_eq!(entry.task_result["success"], true);
        assert_eq!(entry.reflection.as_ref().unwrap()["analysis"], "顺利完成");
        assert_eq!(entry.tool_usage[0].tool_name, "navigate");

        assert_eq!(mem.retrieve_similar_tasks("", 10).await.unwrap().len(), 2);
        assert!(mem.get_work_memory(&task.id).await.unwrap().is_some());
        assert!(mem.get_work_memory("task_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_newest_first_and_limit() {
        let mem = SqliteTaskMemory::in_memory().unwrap();
        let older = Task::new("login portal");
        let newer = Task::new("login mail");
        mem.store_task(&older, &json!({}), None, &[]).await.unwrap();
        mem.store_task(&newer, &json!({}), None, &[]).await.unwrap();
        let found = mem.retrieve_similar_tasks("Login", 1).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].task_id, newer.id);
    }

    #[tokio::test]
    async fn test_tool_stats() {
        let mem = SqliteTaskMemory::in_memory().unwrap();
        for u in [usage("click", true, 1.0), usage("click", false, 2.0), usage("wait", true, 4.0)] {
            mem.store_tool_usage(&u).await.unwrap();
        }
        let all = mem.get_tool_stats(None).await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["click", "wait"]);
        let click = &all["click"];
        assert_eq!((click.total, click.success_count), (2, 1));
        assert!((click.avg_execution_time - 1.5).abs() < 1e-9);

        let wait = mem.get_tool_stats(Some("wait")).await.unwrap();
        assert_eq!(wait.len(), 1);
        assert!((wait["wait"].success_rate - 1.0).abs() < 1e-9);
        assert!(mem.get_tool_stats(Some("scroll")).await.unwrap().is_empty());
    }
}
