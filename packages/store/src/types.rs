// ABOUTME: Task and log entry type definitions
// ABOUTME: Status enums with string round-tripping for SQLite TEXT columns

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{Result, StoreError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            _ => Err(StoreError::InvalidStatus(s.to_string())),
        }
    }

    /// Terminal statuses cannot be overwritten by an in-flight cycle;
    /// re-entering processing requires an explicit continuation transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub repo_url: String,
    pub status: TaskStatus,
    pub branch_name: Option<String>,
    pub source_branch: Option<String>,
    pub selected_agent: String,
    pub selected_model: Option<String>,
    pub keep_alive: bool,
    pub max_duration_minutes: i64,

    // Durable pointers into the sandbox provider; sandbox_id outlives any
    // process-local handle, agent_session_id enables conversational resume.
    pub sandbox_id: Option<String>,
    pub agent_session_id: Option<String>,

    pub error_message: Option<String>,
    pub has_unpushed_changes: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub prompt: String,
    pub repo_url: String,
    pub source_branch: Option<String>,
    pub selected_agent: String,
    pub selected_model: Option<String>,
    pub keep_alive: bool,
    pub max_duration_minutes: i64,
}

/// Field-level patch applied by `update_task` / `transition`.
///
/// `clear_sandbox` nulls both sandbox_id and agent_session_id together:
/// session continuity never survives the sandbox it belongs to.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub branch_name: Option<String>,
    pub sandbox_id: Option<String>,
    pub agent_session_id: Option<String>,
    pub error_message: Option<String>,
    pub has_unpushed_changes: Option<bool>,
    pub clear_sandbox: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Info,
    Command,
    Error,
    Success,
}

impl LogCategory {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Info => "info",
            Self::Command => "command",
            Self::Error => "error",
            Self::Success => "success",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(Self::Info),
            "command" => Ok(Self::Command),
            "error" => Ok(Self::Error),
            "success" => Ok(Self::Success),
            _ => Err(StoreError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLog {
    pub id: i64,
    pub task_id: String,
    pub category: LogCategory,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
