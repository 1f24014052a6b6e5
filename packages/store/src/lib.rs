// ABOUTME: Persisted task store for the Maestro orchestrator
// ABOUTME: Tasks, conditional status transitions and the append-only task log sink

pub mod storage;
pub mod types;

pub use storage::{migrate, Result, StoreError, TaskStore};
pub use types::{LogCategory, NewTask, Task, TaskLog, TaskPatch, TaskStatus};
