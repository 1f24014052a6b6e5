// ABOUTME: Storage layer for tasks and task logs in SQLite
// ABOUTME: Conditional status transitions guard every finalizing write against racing writers

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

use crate::types::{LogCategory, NewTask, Task, TaskLog, TaskPatch, TaskStatus};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Task not found: {0}")]
    NotFound(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Run embedded migrations against a pool.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ========================================================================
    // TASK OPERATIONS
    // ========================================================================

    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let task = Task {
            id: format!("task_{}", uuid::Uuid::new_v4().to_string().replace('-', "")),
            prompt: new.prompt,
            repo_url: new.repo_url,
            status: TaskStatus::Pending,
            branch_name: None,
            source_branch: new.source_branch,
            selected_agent: new.selected_agent,
            selected_model: new.selected_model,
            keep_alive: new.keep_alive,
            max_duration_minutes: new.max_duration_minutes,
            sandbox_id: None,
            agent_session_id: None,
            error_message: None,
            has_unpushed_changes: false,
            created_at: Utc::now(),
            completed_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, prompt, repo_url, status, branch_name, source_branch,
                selected_agent, selected_model, keep_alive, max_duration_minutes,
                sandbox_id, agent_session_id, error_message, has_unpushed_changes,
                created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.prompt)
        .bind(&task.repo_url)
        .bind(task.status.as_str())
        .bind(&task.branch_name)
        .bind(&task.source_branch)
        .bind(&task.selected_agent)
        .bind(&task.selected_model)
        .bind(task.keep_alive)
        .bind(task.max_duration_minutes)
        .bind(&task.sandbox_id)
        .bind(&task.agent_session_id)
        .bind(&task.error_message)
        .bind(task.has_unpushed_changes)
        .bind(task.created_at.to_rfc3339())
        .bind(task.completed_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_task(row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Cheap single-column read used by every race check.
    pub async fn get_status(&self, id: &str) -> Result<TaskStatus> {
        let row = sqlx::query("SELECT status FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => TaskStatus::from_str(&row.get::<String, _>("status")),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Durable pointers into the provider, read without loading the full row.
    pub async fn get_runtime_refs(&self, id: &str) -> Result<(Option<String>, Option<String>)> {
        let row = sqlx::query("SELECT sandbox_id, agent_session_id FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok((row.get("sandbox_id"), row.get("agent_session_id"))),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Apply a patch unconditionally (non-finalizing fields only).
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<()> {
        let (sets, binds) = patch_clauses(&patch);
        if sets.is_empty() {
            return Ok(());
        }

        let query = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        let mut q = sqlx::query(&query);
        for bind in binds {
            q = apply_bind(q, bind);
        }

        let result = q.bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Conditional status transition: set `to` (plus patch) only while the
    /// current status is one of `expected`. Returns whether a row changed.
    ///
    /// This is the race guard between the in-flight orchestrator, the timeout
    /// supervisor and external stop requests; a `false` return means another
    /// writer already owns the terminal state.
    pub async fn transition(
        &self,
        id: &str,
        expected: &[TaskStatus],
        to: TaskStatus,
        patch: TaskPatch,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut sets = vec!["status = ?".to_string()];
        let mut binds = vec![Bind::Text(to.as_str().to_string())];

        let (patch_sets, patch_binds) = patch_clauses(&patch);
        sets.extend(patch_sets);
        binds.extend(patch_binds);

        // Timestamps follow the status: terminal states stamp completed_at,
        // a continuation back into processing resets the previous outcome.
        if to.is_terminal() {
            sets.push("completed_at = ?".to_string());
            binds.push(Bind::Text(now.to_rfc3339()));
        } else if to == TaskStatus::Processing {
            sets.push("completed_at = NULL".to_string());
            if patch.error_message.is_none() {
                sets.push("error_message = NULL".to_string());
            }
            if patch.has_unpushed_changes.is_none() {
                sets.push("has_unpushed_changes = 0".to_string());
            }
        }

        let placeholders = vec!["?"; expected.len()].join(", ");
        let query = format!(
            "UPDATE tasks SET {} WHERE id = ? AND status IN ({})",
            sets.join(", "),
            placeholders
        );

        let mut q = sqlx::query(&query);
        for bind in binds {
            q = apply_bind(q, bind);
        }
        q = q.bind(id);
        for status in expected {
            q = q.bind(status.as_str());
        }

        let result = q.execute(&self.pool).await?;
        let applied = result.rows_affected() > 0;
        debug!(task_id = id, to = to.as_str(), applied, "task transition");
        Ok(applied)
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM tasks WHERE status = ? ORDER BY created_at DESC")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.into_iter().map(row_to_task).collect()
    }

    /// Terminal tasks still holding a sandbox pointer; input for the
    /// keep-alive reaper.
    pub async fn tasks_with_sandboxes(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE sandbox_id IS NOT NULL
               AND status IN ('completed', 'error', 'stopped')
             ORDER BY completed_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_task).collect()
    }

    // ========================================================================
    // LOG OPERATIONS
    // ========================================================================

    pub async fn append_log(
        &self,
        task_id: &str,
        category: LogCategory,
        message: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_logs (task_id, category, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(category.as_str())
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn logs(&self, task_id: &str) -> Result<Vec<TaskLog>> {
        let rows = sqlx::query(
            "SELECT id, task_id, category, message, created_at
             FROM task_logs WHERE task_id = ? ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TaskLog {
                    id: row.get("id"),
                    task_id: row.get("task_id"),
                    category: LogCategory::from_str(&row.get::<String, _>("category"))?,
                    message: row.get("message"),
                    created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
                })
            })
            .collect()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

enum Bind {
    Text(String),
    Bool(bool),
}

type SqliteQuery<'q> = sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

fn apply_bind(q: SqliteQuery<'_>, bind: Bind) -> SqliteQuery<'_> {
    match bind {
        Bind::Text(s) => q.bind(s),
        Bind::Bool(b) => q.bind(b),
    }
}

fn patch_clauses(patch: &TaskPatch) -> (Vec<String>, Vec<Bind>) {
    let mut sets = Vec::new();
    let mut binds = Vec::new();

    if let Some(branch_name) = &patch.branch_name {
        sets.push("branch_name = ?".to_string());
        binds.push(Bind::Text(branch_name.clone()));
    }
    if patch.clear_sandbox {
        // Session continuity never survives the sandbox it belongs to.
        sets.push("sandbox_id = NULL".to_string());
        sets.push("agent_session_id = NULL".to_string());
    } else {
        if let Some(sandbox_id) = &patch.sandbox_id {
            sets.push("sandbox_id = ?".to_string());
            binds.push(Bind::Text(sandbox_id.clone()));
        }
        if let Some(session_id) = &patch.agent_session_id {
            sets.push("agent_session_id = ?".to_string());
            binds.push(Bind::Text(session_id.clone()));
        }
    }
    if let Some(error_message) = &patch.error_message {
        sets.push("error_message = ?".to_string());
        binds.push(Bind::Text(error_message.clone()));
    }
    if let Some(flag) = patch.has_unpushed_changes {
        sets.push("has_unpushed_changes = ?".to_string());
        binds.push(Bind::Bool(flag));
    }

    (sets, binds)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp(s.to_string()))
}

fn row_to_task(row: sqlx::sqlite::SqliteRow) -> Result<Task> {
    Ok(Task {
        id: row.get("id"),
        prompt: row.get("prompt"),
        repo_url: row.get("repo_url"),
        status: TaskStatus::from_str(&row.get::<String, _>("status"))?,
        branch_name: row.get("branch_name"),
        source_branch: row.get("source_branch"),
        selected_agent: row.get("selected_agent"),
        selected_model: row.get("selected_model"),
        keep_alive: row.get("keep_alive"),
        max_duration_minutes: row.get("max_duration_minutes"),
        sandbox_id: row.get("sandbox_id"),
        agent_session_id: row.get("agent_session_id"),
        error_message: row.get("error_message"),
        has_unpushed_changes: row.get("has_unpushed_changes"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> TaskStore {
        // One connection so every pooled acquire sees the same in-memory database.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate(&pool).await.unwrap();
        TaskStore::new(pool)
    }

    fn sample_task() -> NewTask {
        NewTask {
            prompt: "Add a healthcheck endpoint".to_string(),
            repo_url: "https://github.com/acme/api".to_string(),
            source_branch: Some("main".to_string()),
            selected_agent: "claude-code".to_string(),
            selected_model: None,
            keep_alive: false,
            max_duration_minutes: 30,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_task() {
        let store = test_store().await;
        let task = store.create_task(sample_task()).await.unwrap();
        assert!(task.id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Pending);

        let fetched = store.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.prompt, task.prompt);
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert!(fetched.sandbox_id.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_task() {
        let store = test_store().await;
        assert!(matches!(
            store.get_task("task_missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_applies_when_expected_matches() {
        let store = test_store().await;
        let task = store.create_task(sample_task()).await.unwrap();

        let applied = store
            .transition(
                &task.id,
                &[TaskStatus::Pending],
                TaskStatus::Processing,
                TaskPatch::default(),
            )
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(
            store.get_status(&task.id).await.unwrap(),
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_transition_rejected_when_precondition_fails() {
        let store = test_store().await;
        let task = store.create_task(sample_task()).await.unwrap();

        // Stop wins the race.
        assert!(store
            .transition(
                &task.id,
                &[TaskStatus::Pending, TaskStatus::Processing],
                TaskStatus::Stopped,
                TaskPatch::default(),
            )
            .await
            .unwrap());

        // A late completion write must not clobber the stop.
        let applied = store
            .transition(
                &task.id,
                &[TaskStatus::Processing],
                TaskStatus::Completed,
                TaskPatch::default(),
            )
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(
            store.get_status(&task.id).await.unwrap(),
            TaskStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_terminal_transition_stamps_completed_at() {
        let store = test_store().await;
        let task = store.create_task(sample_task()).await.unwrap();

        store
            .transition(
                &task.id,
                &[TaskStatus::Pending],
                TaskStatus::Completed,
                TaskPatch::default(),
            )
            .await
            .unwrap();

        let fetched = store.get_task(&task.id).await.unwrap();
        assert!(fetched.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_continuation_resets_outcome_fields() {
        let store = test_store().await;
        let task = store.create_task(sample_task()).await.unwrap();

        store
            .transition(
                &task.id,
                &[TaskStatus::Pending],
                TaskStatus::Error,
                TaskPatch {
                    error_message: Some("boom".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Follow-up message re-enters processing.
        let applied = store
            .transition(
                &task.id,
                &[TaskStatus::Completed, TaskStatus::Error, TaskStatus::Stopped],
                TaskStatus::Processing,
                TaskPatch::default(),
            )
            .await
            .unwrap();
        assert!(applied);

        let fetched = store.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Processing);
        assert!(fetched.completed_at.is_none());
        assert!(fetched.error_message.is_none());
    }

    #[tokio::test]
    async fn test_clear_sandbox_clears_session_too() {
        let store = test_store().await;
        let task = store.create_task(sample_task()).await.unwrap();

        store
            .update_task(
                &task.id,
                TaskPatch {
                    sandbox_id: Some("sbx_1".to_string()),
                    agent_session_id: Some("sess_1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (sandbox, session) = store.get_runtime_refs(&task.id).await.unwrap();
        assert_eq!(sandbox.as_deref(), Some("sbx_1"));
        assert_eq!(session.as_deref(), Some("sess_1"));

        store
            .update_task(
                &task.id,
                TaskPatch {
                    clear_sandbox: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (sandbox, session) = store.get_runtime_refs(&task.id).await.unwrap();
        assert!(sandbox.is_none());
        assert!(session.is_none());
    }

    #[tokio::test]
    async fn test_tasks_with_sandboxes_only_returns_terminal_holders() {
        let store = test_store().await;
        let held = store.create_task(sample_task()).await.unwrap();
        let running = store.create_task(sample_task()).await.unwrap();
        let bare = store.create_task(sample_task()).await.unwrap();

        store
            .update_task(
                &held.id,
                TaskPatch {
                    sandbox_id: Some("sbx_held".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .transition(
                &held.id,
                &[TaskStatus::Pending],
                TaskStatus::Completed,
                TaskPatch::default(),
            )
            .await
            .unwrap();

        store
            .update_task(
                &running.id,
                TaskPatch {
                    sandbox_id: Some("sbx_running".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .transition(
                &running.id,
                &[TaskStatus::Pending],
                TaskStatus::Processing,
                TaskPatch::default(),
            )
            .await
            .unwrap();

        store
            .transition(
                &bare.id,
                &[TaskStatus::Pending],
                TaskStatus::Completed,
                TaskPatch::default(),
            )
            .await
            .unwrap();

        let holders = store.tasks_with_sandboxes().await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].id, held.id);
    }

    #[tokio::test]
    async fn test_log_append_and_read() {
        let store = test_store().await;
        let task = store.create_task(sample_task()).await.unwrap();

        store
            .append_log(&task.id, LogCategory::Info, "Creating sandbox")
            .await
            .unwrap();
        store
            .append_log(&task.id, LogCategory::Success, "Task completed")
            .await
            .unwrap();

        let logs = store.logs(&task.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].category, LogCategory::Info);
        assert_eq!(logs[1].category, LogCategory::Success);
        assert_eq!(logs[1].message, "Task completed");
    }
}
