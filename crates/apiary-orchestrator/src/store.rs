//! Durable swarm state.
//!
//! SQLite-backed persistence for background swarms: the swarm record itself
//! (status, counters, incrementally appended results), the shared board of
//! spawned follow-up tasks, and the cross-task insight ledger. The store is
//! the only component that must survive a process restart; everything else
//! re-learns its state quickly.
//!
//! `update_task` is a single transaction doing a JSON append plus a counter
//! increment. Multiple background completions race against the same swarm
//! id, so a read-modify-write of the full result list would lose updates.

use crate::error::Result;
use crate::result::Finding;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Swarm retention window; older records are reaped by `cleanup`.
const RETENTION: Duration = Duration::from_secs(60 * 60);

/// Lifecycle of a background swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    /// Live workers still running.
    Processing,
    /// Every task has reported a terminal result.
    Completed,
    /// Aborted by the orchestrator.
    Failed,
}

impl SwarmStatus {
    fn as_str(self) -> &'static str {
        match self {
            SwarmStatus::Processing => "processing",
            SwarmStatus::Completed => "completed",
            SwarmStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "completed" => SwarmStatus::Completed,
            "failed" => SwarmStatus::Failed,
            _ => SwarmStatus::Processing,
        }
    }
}

/// One task's terminal result as persisted into a swarm record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmResult {
    /// Task identifier (role name).
    pub role: String,
    /// Subject file the task analyzed.
    pub file_path: String,
    /// Terminal status tag (`success`, `exhausted`, `fatal_error`).
    pub status: String,
    /// Findings reported by the task, empty on failure.
    pub findings: Vec<Finding>,
}

/// Durable state of one swarm.
#[derive(Debug, Clone, Serialize)]
pub struct SwarmState {
    /// Swarm identifier.
    pub id: String,
    /// Lifecycle status.
    pub status: SwarmStatus,
    /// Results appended so far, in completion order.
    pub results: Vec<SwarmResult>,
    /// Number of live tasks launched.
    pub total_tasks: usize,
    /// Number of tasks that have reported.
    pub completed_tasks: usize,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
}

/// Category of a cross-task insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    /// Something another task should know about.
    Discovery,
    /// A finding another task already reported.
    Deduplication,
    /// Progress is blocked on something.
    Blocker,
    /// Suggested follow-up work.
    Recommendation,
}

impl InsightType {
    fn as_str(self) -> &'static str {
        match self {
            InsightType::Discovery => "discovery",
            InsightType::Deduplication => "deduplication",
            InsightType::Blocker => "blocker",
            InsightType::Recommendation => "recommendation",
        }
    }
}

/// One insight posted to a swarm's shared ledger.
#[derive(Debug, Clone, Serialize)]
pub struct Insight {
    /// Category tag.
    pub insight_type: String,
    /// Structured payload.
    pub content: serde_json::Value,
    /// Task that posted it.
    pub source_agent: String,
    /// Post time, epoch milliseconds.
    pub created_at: i64,
}

/// SQLite-backed swarm persistence.
pub struct SwarmStore {
    conn: Arc<Mutex<Connection>>,
}

impl SwarmStore {
    /// Opens (or creates) a store at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be initialized.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init_schema()?;
        info!(path = %path.display(), "Swarm store opened");
        Ok(store)
    }

    /// Opens an in-memory store (tests and ephemeral hosts).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS swarms (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                total_tasks INTEGER NOT NULL,
                completed_tasks INTEGER NOT NULL,
                results_json TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS board_tasks (
                id TEXT PRIMARY KEY,
                swarm_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                context_json TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY(swarm_id) REFERENCES swarms(id)
            );
            CREATE TABLE IF NOT EXISTS insights (
                id TEXT PRIMARY KEY,
                swarm_id TEXT NOT NULL,
                task_id TEXT,
                insight_type TEXT NOT NULL,
                content_json TEXT NOT NULL,
                source_agent TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(swarm_id) REFERENCES swarms(id)
            );
            CREATE INDEX IF NOT EXISTS idx_board_swarm ON board_tasks(swarm_id);
            CREATE INDEX IF NOT EXISTS idx_insights_swarm ON insights(swarm_id);
            CREATE INDEX IF NOT EXISTS idx_swarms_created ON swarms(created_at);",
        )?;
        Ok(())
    }

    /// Creates a swarm record before any work starts. Reaps stale swarms
    /// opportunistically on every creation.
    pub fn create(&self, id: &str, total_tasks: usize) -> Result<SwarmState> {
        self.cleanup()?;

        let created_at = Utc::now().timestamp_millis();
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO swarms (id, status, total_tasks, completed_tasks, results_json, created_at)
             VALUES (?1, ?2, ?3, 0, '[]', ?4)",
            params![id, SwarmStatus::Processing.as_str(), total_tasks, created_at],
        )?;

        debug!(swarm_id = %id, total_tasks = total_tasks, "Swarm created");
        Ok(SwarmState {
            id: id.to_string(),
            status: SwarmStatus::Processing,
            results: Vec::new(),
            total_tasks,
            completed_tasks: 0,
            created_at,
        })
    }

    /// Loads a swarm record.
    pub fn get(&self, id: &str) -> Result<Option<SwarmState>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let row = conn
            .query_row(
                "SELECT status, total_tasks, completed_tasks, results_json, created_at
                 FROM swarms WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, usize>(1)?,
                        row.get::<_, usize>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((status, total_tasks, completed_tasks, results_json, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(SwarmState {
            id: id.to_string(),
            status: SwarmStatus::parse(&status),
            results: serde_json::from_str(&results_json)?,
            total_tasks,
            completed_tasks,
            created_at,
        }))
    }

    /// Records one task completion: appends the result and increments the
    /// counter in a single transaction, promoting the swarm to `completed`
    /// exactly once when the counter reaches the total.
    pub fn update_task(&self, id: &str, result: &SwarmResult) -> Result<()> {
        let payload = serde_json::to_string(result)?;
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE swarms
             SET results_json = json_insert(results_json, '$[#]', json(?1)),
                 completed_tasks = MIN(completed_tasks + 1, total_tasks)
             WHERE id = ?2",
            params![payload, id],
        )?;
        if updated == 0 {
            warn!(swarm_id = %id, "Task completion for unknown swarm dropped");
            tx.rollback()?;
            return Ok(());
        }

        tx.execute(
            "UPDATE swarms SET status = 'completed'
             WHERE id = ?1 AND status = 'processing' AND completed_tasks >= total_tasks",
            params![id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Marks a swarm as failed.
    pub fn fail_swarm(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE swarms SET status = 'failed' WHERE id = ?1",
            params![id],
        )?;
        warn!(swarm_id = %id, "Swarm marked failed");
        Ok(())
    }

    /// Deletes swarms (and their board/insight rows) older than the
    /// retention window.
    pub fn cleanup(&self) -> Result<usize> {
        let horizon = Utc::now().timestamp_millis() - RETENTION.as_millis() as i64;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM board_tasks WHERE swarm_id IN (SELECT id FROM swarms WHERE created_at < ?1)",
            params![horizon],
        )?;
        conn.execute(
            "DELETE FROM insights WHERE swarm_id IN (SELECT id FROM swarms WHERE created_at < ?1)",
            params![horizon],
        )?;
        let reaped = conn.execute("DELETE FROM swarms WHERE created_at < ?1", params![horizon])?;
        if reaped > 0 {
            debug!(reaped = reaped, "Stale swarms reaped");
        }
        Ok(reaped)
    }

    /// Seeds a board row for a live task launched with the swarm.
    pub fn record_task(&self, swarm_id: &str, context: &serde_json::Value) -> Result<String> {
        self.insert_board_task(swarm_id, "original", context)
    }

    /// Spawns a follow-up task on the board from within a running task.
    pub fn spawn_subtask(
        &self,
        swarm_id: &str,
        parent_task_id: &str,
        task_type: &str,
        context: &serde_json::Value,
    ) -> Result<String> {
        let mut payload = context.clone();
        if let Some(map) = payload.as_object_mut() {
            map.insert("parent_id".to_string(), serde_json::Value::String(parent_task_id.to_string()));
        }
        self.insert_board_task(swarm_id, task_type, &payload)
    }

    fn insert_board_task(&self, swarm_id: &str, task_type: &str, context: &serde_json::Value) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO board_tasks (id, swarm_id, task_type, context_json, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
            params![id, swarm_id, task_type, serde_json::to_string(context)?, now],
        )?;
        Ok(id)
    }

    /// Marks a board task as claimed by a worker.
    pub fn claim_task(&self, task_id: &str, worker: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE board_tasks
             SET status = 'claimed',
                 context_json = json_set(context_json, '$.claimed_by', ?2),
                 updated_at = ?3
             WHERE id = ?1",
            params![task_id, worker, now],
        )?;
        Ok(())
    }

    /// Marks a board task as completed or failed.
    pub fn settle_task(&self, task_id: &str, success: bool) -> Result<()> {
        let status = if success { "completed" } else { "failed" };
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE board_tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![task_id, status, now],
        )?;
        Ok(())
    }

    /// Posts a cross-task insight to the swarm's shared ledger.
    pub fn post_insight(
        &self,
        swarm_id: &str,
        task_id: Option<&str>,
        insight_type: InsightType,
        content: &serde_json::Value,
        source_agent: &str,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO insights (id, swarm_id, task_id, insight_type, content_json, source_agent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, swarm_id, task_id, insight_type.as_str(), serde_json::to_string(content)?, source_agent, now],
        )?;
        Ok(id)
    }

    /// Insights posted to a swarm, newest first.
    pub fn insights_for(&self, swarm_id: &str) -> Result<Vec<Insight>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT insight_type, content_json, source_agent, created_at
             FROM insights WHERE swarm_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![swarm_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut insights = Vec::new();
        for row in rows {
            let (insight_type, content_json, source_agent, created_at) = row?;
            insights.push(Insight {
                insight_type,
                content: serde_json::from_str(&content_json)?,
                source_agent,
                created_at,
            });
        }
        Ok(insights)
    }

    /// Number of insights posted to a swarm.
    pub fn insight_count(&self, swarm_id: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count = conn.query_row(
            "SELECT COUNT(*) FROM insights WHERE swarm_id = ?1",
            params![swarm_id],
            |row| row.get::<_, usize>(0),
        )?;
        Ok(count)
    }

    /// Number of follow-up tasks spawned on a swarm's board.
    pub fn subtask_count(&self, swarm_id: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count = conn.query_row(
            "SELECT COUNT(*) FROM board_tasks WHERE swarm_id = ?1 AND task_type != 'original'",
            params![swarm_id],
            |row| row.get::<_, usize>(0),
        )?;
        Ok(count)
    }

    /// Number of deduplication insights on a swarm.
    pub fn dedup_count(&self, swarm_id: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let count = conn.query_row(
            "SELECT COUNT(*) FROM insights WHERE swarm_id = ?1 AND insight_type = 'deduplication'",
            params![swarm_id],
            |row| row.get::<_, usize>(0),
        )?;
        Ok(count)
    }
}

impl Clone for SwarmStore {
    fn clone(&self) -> Self {
        Self { conn: Arc::clone(&self.conn) }
    }
}

impl std::fmt::Debug for SwarmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmStore").finish_non_exhaustive()
    }
}
