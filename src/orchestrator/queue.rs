//! Durable Task Queue
//!
//! Carries the fire-and-forget work of a detection pass (narratives, risk
//! recomputes) and the detection triggers themselves. Delivery is
//! at-least-once: a failed task goes back to pending until its attempts run out.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::task;
use uuid::Uuid;

use crate::insight::NarrativeRequest;
use crate::store::sqlite::connect;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// Work items the worker knows how to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    DetectShipment { shipment_id: String },
    ExplainAuditEntry { audit_id: String, request: NarrativeRequest },
    RecomputeRisk { shipment_id: String },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::DetectShipment { .. } => "detect_shipment",
            Job::ExplainAuditEntry { .. } => "explain_audit_entry",
            Job::RecomputeRisk { .. } => "recompute_risk",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: String,
    pub payload: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Task {
    pub fn job(&self) -> Result<Job> {
        serde_json::from_str(&self.payload).with_context(|| format!("Malformed payload for task {}", self.id))
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<String>;
    /// Claim the oldest pending task, marking it running.
    async fn dequeue(&self) -> Result<Option<Task>>;
    async fn complete(&self, task_id: &str) -> Result<()>;
    async fn fail(&self, task_id: &str, error: &str, should_retry: bool) -> Result<()>;
    async fn get_status(&self, task_id: &str) -> Result<Option<TaskStatus>>;
    async fn count(&self, status: TaskStatus) -> Result<i64>;
    /// Return tasks left running by a crashed worker to pending.
    async fn requeue_running(&self) -> Result<usize>;
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Clone)]
pub struct SqliteTaskQueue {
    db_path: PathBuf,
}

impl SqliteTaskQueue {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = connect(&path_clone)?;

            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    attempts INTEGER DEFAULT 0,
                    last_error TEXT
                );
                "#,
                [],
            )?;

            conn.execute("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);", [])?;
            conn.execute("CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);", [])?;

            Ok::<_, anyhow::Error>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, job: &Job) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let payload_json = serde_json::to_string(job)?;
        let kind = job.kind();
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let now = now_text();

            conn.execute(
                "INSERT INTO tasks (id, kind, payload, status, created_at, updated_at, attempts) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![&id, kind, &payload_json, TaskStatus::Pending.as_str(), &now, &now],
            )
            .context("Failed to enqueue task")?;
            Ok::<_, anyhow::Error>(id)
        })
        .await?
    }

    async fn dequeue(&self) -> Result<Option<Task>> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let task_row: Option<(String, String, String, String, String, u32, Option<String>)> = tx
                .query_row(
                    "SELECT id, kind, payload, created_at, updated_at, attempts, last_error
                     FROM tasks
                     WHERE status = 'pending'
                     ORDER BY created_at ASC, rowid ASC
                     LIMIT 1",
                    [],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, kind, payload, created_at, _updated_at, attempts, last_error)) = task_row else {
                return Ok(None);
            };

            let now = Utc::now();
            tx.execute(
                "UPDATE tasks SET status = 'running', updated_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339_opts(SecondsFormat::Micros, true), &id],
            )?;
            tx.commit()?;

            Ok(Some(Task {
                id,
                kind,
                payload,
                status: TaskStatus::Running,
                created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
                updated_at: now,
                attempts,
                last_error,
            }))
        })
        .await?
    }

    async fn complete(&self, task_id: &str) -> Result<()> {
        let path = self.db_path.clone();
        let id = task_id.to_string();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            conn.execute(
                "UPDATE tasks SET status = 'completed', updated_at = ?1 WHERE id = ?2",
                params![now_text(), &id],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    async fn fail(&self, task_id: &str, error: &str, should_retry: bool) -> Result<()> {
        let path = self.db_path.clone();
        let id = task_id.to_string();
        let err_msg = error.to_string();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let new_status = if should_retry {
                TaskStatus::Pending
            } else {
                TaskStatus::Failed
            };

            conn.execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2, attempts = attempts + 1, last_error = ?3 WHERE id = ?4",
                params![new_status.as_str(), now_text(), &err_msg, &id],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await?
    }

    async fn get_status(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let path = self.db_path.clone();
        let id = task_id.to_string();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let status: Option<String> = conn
                .query_row("SELECT status FROM tasks WHERE id = ?1", params![&id], |row| row.get(0))
                .optional()?;
            status
                .map(|s| s.parse::<TaskStatus>().map_err(anyhow::Error::msg))
                .transpose()
        })
        .await?
    }

    async fn count(&self, status: TaskStatus) -> Result<i64> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            Ok::<_, anyhow::Error>(count)
        })
        .await?
    }

    async fn requeue_running(&self) -> Result<usize> {
        let path = self.db_path.clone();

        task::spawn_blocking(move || {
            let conn = connect(&path)?;
            let changed = conn.execute(
                "UPDATE tasks SET status = 'pending', updated_at = ?1 WHERE status = 'running'",
                params![now_text()],
            )?;
            Ok::<_, anyhow::Error>(changed)
        })
        .await?
    }
}
