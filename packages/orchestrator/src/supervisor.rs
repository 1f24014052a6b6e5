// ABOUTME: Deadline supervision and stop-request handling for task runs
// ABOUTME: Store-driven termination that works without any process-local sandbox handle

use std::sync::Arc;
use std::time::Duration;

use maestro_store::{LogCategory, TaskPatch, TaskStatus};
use tracing::{debug, error, info};

use crate::orchestrator::{Secrets, TaskOrchestrator};
use crate::Result;

impl TaskOrchestrator {
    /// Wrap exactly one processing cycle with the task's absolute deadline.
    ///
    /// On expiry the persisted record is consulted and settled first; only
    /// then is the in-process future aborted. The absolute timeout always
    /// wins over an in-flight success, enforced by the conditional store
    /// write rather than by task scheduling.
    pub async fn run_supervised(self: &Arc<Self>, task_id: &str, secrets: Secrets) -> Result<()> {
        self.supervised(task_id, secrets, false).await
    }

    /// Supervised continuation run for a task in a terminal state.
    pub async fn continue_supervised(
        self: &Arc<Self>,
        task_id: &str,
        secrets: Secrets,
    ) -> Result<()> {
        self.supervised(task_id, secrets, true).await
    }

    async fn supervised(
        self: &Arc<Self>,
        task_id: &str,
        secrets: Secrets,
        continuation: bool,
    ) -> Result<()> {
        let task = self.store().get_task(task_id).await?;
        let deadline = Duration::from_secs(task.max_duration_minutes.max(1) as u64 * 60);

        let orchestrator = Arc::clone(self);
        let run_task_id = task_id.to_string();
        let mut run = tokio::spawn(async move {
            if continuation {
                orchestrator.continue_task(&run_task_id, &secrets).await
            } else {
                orchestrator.process_task(&run_task_id, &secrets).await
            }
        });

        tokio::select! {
            result = &mut run => {
                result.map_err(|e| crate::OrchestratorError::Join(e.to_string()))?
            }
            _ = tokio::time::sleep(deadline) => {
                self.expire_task(task_id).await?;
                run.abort();
                Ok(())
            }
        }
    }

    /// Deadline expiry handler.
    ///
    /// Callable from any process: the sandbox is resolved through the
    /// persisted id, never through a local handle, and the error write is
    /// conditional so a completion that landed just before the deadline is
    /// left untouched.
    pub async fn expire_task(&self, task_id: &str) -> Result<()> {
        let status = self.store().get_status(task_id).await?;
        if status.is_terminal() {
            debug!("Task {} already terminal; timeout is a no-op", task_id);
            return Ok(());
        }

        self.cancellations().set(task_id).await;

        let (sandbox_id, _) = self.store().get_runtime_refs(task_id).await?;
        if let Some(sandbox_id) = sandbox_id {
            // "Already gone" comes back as success from the adapter; any
            // other failure is logged and the status write still proceeds.
            if let Err(e) = self.provider().shutdown(&sandbox_id).await {
                error!("Failed to shut down sandbox {}: {}", sandbox_id, e);
            }
        }

        let applied = self
            .store()
            .transition(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Processing],
                TaskStatus::Error,
                TaskPatch {
                    error_message: Some("Task timed out".to_string()),
                    clear_sandbox: true,
                    ..Default::default()
                },
            )
            .await?;

        if applied {
            info!("Task {} timed out", task_id);
            self.store()
                .append_log(task_id, LogCategory::Error, "Task timed out")
                .await?;
        }
        Ok(())
    }

    /// External stop request.
    ///
    /// The store write lands first so any concurrent cycle observes it on
    /// its next cancellation check; the sandbox is then resolved from the
    /// store and shut down. Stopping an already-stopped task is a successful
    /// no-op.
    pub async fn stop_task(&self, task_id: &str) -> Result<TaskStatus> {
        let applied = self
            .store()
            .transition(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Processing],
                TaskStatus::Stopped,
                TaskPatch::default(),
            )
            .await?;

        if !applied {
            let current = self.store().get_status(task_id).await?;
            debug!(
                "Stop for {} ignored; task already {}",
                task_id,
                current.as_str()
            );
            return Ok(current);
        }

        self.cancellations().set(task_id).await;
        self.store()
            .append_log(task_id, LogCategory::Info, "Task stopped")
            .await?;

        let (sandbox_id, _) = self.store().get_runtime_refs(task_id).await?;
        if let Some(sandbox_id) = sandbox_id {
            match self.provider().shutdown(&sandbox_id).await {
                Ok(()) => {
                    self.store()
                        .update_task(
                            task_id,
                            TaskPatch {
                                clear_sandbox: true,
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                // Shutdown failures leave the refs in place for the reaper.
                Err(e) => error!("Failed to shut down sandbox {}: {}", sandbox_id, e),
            }
        }

        Ok(TaskStatus::Stopped)
    }
}
