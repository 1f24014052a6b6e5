// ABOUTME: Background reaper for keep-alive sandboxes that outlived their window
// ABOUTME: Periodic sweep shutting down and unlinking sandboxes held by terminal tasks

use std::sync::Arc;

use chrono::Utc;
use maestro_sandbox::SandboxProvider;
use maestro_store::{TaskPatch, TaskStore};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::Result;

/// Start the periodic reaper task. Errors are logged and the loop continues.
pub fn start_reaper(
    store: Arc<TaskStore>,
    provider: Arc<dyn SandboxProvider>,
    config: &OrchestratorConfig,
) -> tokio::task::JoinHandle<()> {
    let interval = config.reaper_interval;
    let window = config.keepalive_window;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Started sandbox reaper (interval: {:?})", interval);

        loop {
            ticker.tick().await;
            match sweep_once(&store, provider.as_ref(), window).await {
                Ok(reaped) if reaped > 0 => info!("Reaped {} expired sandboxes", reaped),
                Ok(_) => {}
                Err(e) => error!("Reaper sweep failed: {}", e),
            }
        }
    })
}

/// One reaper pass: shut down sandboxes held by terminal tasks past the
/// keep-alive window and clear their refs. Returns how many were reaped.
pub async fn sweep_once(
    store: &TaskStore,
    provider: &dyn SandboxProvider,
    window: std::time::Duration,
) -> Result<usize> {
    let window = chrono::Duration::seconds(window.as_secs() as i64);
    let now = Utc::now();
    let mut reaped = 0;

    for task in store.tasks_with_sandboxes().await? {
        let Some(sandbox_id) = &task.sandbox_id else {
            continue;
        };
        let finished = task.completed_at.unwrap_or(task.created_at);
        if now.signed_duration_since(finished) < window {
            continue;
        }

        match provider.shutdown(sandbox_id).await {
            Ok(()) => {
                store
                    .update_task(
                        &task.id,
                        TaskPatch {
                            clear_sandbox: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                info!("Reaped expired sandbox {} of task {}", sandbox_id, task.id);
                reaped += 1;
            }
            // Leave the refs; the next sweep retries.
            Err(e) => warn!("Failed to reap sandbox {}: {}", sandbox_id, e),
        }
    }

    Ok(reaped)
}
