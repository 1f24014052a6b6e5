// ABOUTME: Task orchestrator running one end-to-end processing cycle per task
// ABOUTME: Composes sandbox resolution, git, agent execution and conditional status finalization

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use maestro_agents::{resolve_credentials, AgentKind, Credentials};
use maestro_engine::{ExecutionEngine, ExecutionRequest};
use maestro_sandbox::{
    commit_message, feature_branch_name, GitWorkspace, HealthProber, ProbeOutcome, PushOutcome,
    SandboxHandle, SandboxProvider,
};
use maestro_store::{LogCategory, Task, TaskPatch, TaskStatus, TaskStore};
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationRegistry;
use crate::config::OrchestratorConfig;
use crate::{OrchestratorError, Result};

/// Per-request secrets; never persisted, never logged.
#[derive(Clone, Default)]
pub struct Secrets {
    /// User-provided agent API key, overriding the process environment
    pub agent_api_key: Option<String>,
    /// Token for cloning and pushing the task repository
    pub repo_token: Option<String>,
}

/// How a processing cycle ended internally.
enum CycleEnd {
    /// The cycle wrote (or lost the race for) its own terminal status.
    Finalized,
    /// An external canceller owns the terminal write; nothing more to do.
    Cancelled,
}

pub struct TaskOrchestrator {
    store: Arc<TaskStore>,
    provider: Arc<dyn SandboxProvider>,
    engine: ExecutionEngine,
    prober: HealthProber,
    cancellations: CancellationRegistry,
    config: OrchestratorConfig,
}

impl TaskOrchestrator {
    pub fn new(store: Arc<TaskStore>, provider: Arc<dyn SandboxProvider>) -> Self {
        Self::with_parts(
            store,
            provider,
            ExecutionEngine::new(),
            HealthProber::new(),
            OrchestratorConfig::from_env(),
        )
    }

    pub fn with_parts(
        store: Arc<TaskStore>,
        provider: Arc<dyn SandboxProvider>,
        engine: ExecutionEngine,
        prober: HealthProber,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            provider,
            engine,
            prober,
            cancellations: CancellationRegistry::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn SandboxProvider> {
        &self.provider
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one processing cycle for a pending task.
    ///
    /// Configuration errors (missing credentials, unknown agent) surface as
    /// `Err` before any sandbox exists; every later failure is resolved here
    /// into a terminal task status.
    pub async fn process_task(&self, task_id: &str, secrets: &Secrets) -> Result<()> {
        self.run(task_id, secrets, &[TaskStatus::Pending]).await
    }

    /// Continuation request: re-enter processing from a terminal state.
    ///
    /// A healthy keep-alive sandbox resumes the agent session; otherwise a
    /// fresh sandbox is created and the feature branch is reused.
    pub async fn continue_task(&self, task_id: &str, secrets: &Secrets) -> Result<()> {
        self.run(
            task_id,
            secrets,
            &[TaskStatus::Completed, TaskStatus::Error, TaskStatus::Stopped],
        )
        .await
    }

    async fn run(&self, task_id: &str, secrets: &Secrets, entry: &[TaskStatus]) -> Result<()> {
        let task = self.store.get_task(task_id).await?;
        let agent = AgentKind::from_str(&task.selected_agent)?;
        // Credential resolution comes first: a missing key is fatal and no
        // sandbox may exist yet.
        let credentials = resolve_credentials(agent, secrets.agent_api_key.as_deref())?;

        let entered = self
            .store
            .transition(task_id, entry, TaskStatus::Processing, TaskPatch::default())
            .await?;
        if !entered {
            // Duplicate delivery or a concurrent run already owns this cycle.
            warn!("Task {} not in an entry state; skipping run", task_id);
            return Ok(());
        }
        self.store
            .append_log(task_id, LogCategory::Info, "Processing started")
            .await?;

        let flag = self.cancellations.register(task_id).await;
        let outcome = self
            .run_cycle(&task, agent, &credentials, secrets, &flag)
            .await;
        self.cancellations.remove(task_id).await;

        match outcome {
            Ok(CycleEnd::Finalized) => Ok(()),
            Ok(CycleEnd::Cancelled) => {
                info!("Task {} cancelled externally; cycle abandoned", task_id);
                Ok(())
            }
            Err(e) => {
                self.finalize_failure(&task, e).await;
                Ok(())
            }
        }
    }

    async fn run_cycle(
        &self,
        task: &Task,
        agent: AgentKind,
        credentials: &Credentials,
        secrets: &Secrets,
        flag: &Arc<AtomicBool>,
    ) -> Result<CycleEnd> {
        let task_id = &task.id;
        let started = Instant::now();

        let (handle, resumed) = self.resolve_sandbox(task).await?;
        let mut session_id = if resumed {
            task.agent_session_id.clone()
        } else {
            None
        };

        let git = GitWorkspace::new(
            self.provider.as_ref(),
            &handle,
            self.config.repo_dir.clone(),
            secrets.repo_token.as_deref(),
        );

        if !resumed {
            self.store
                .append_log(task_id, LogCategory::Command, "Cloning repository")
                .await?;
            git.clone_repo(&task.repo_url).await?;

            if let Some(source) = &task.source_branch {
                git.checkout_branch(source).await?;
            }

            if let Some(install) = &self.config.install_command {
                self.store
                    .append_log(task_id, LogCategory::Command, "Installing dependencies")
                    .await?;
                let output = self
                    .provider
                    .run_command(
                        &handle,
                        install,
                        Some(&self.config.repo_dir),
                        &HashMap::new(),
                        self.config.install_timeout,
                    )
                    .await?;
                if !output.success() {
                    debug!("Dependency install stderr: {}", output.stderr);
                    return Err(OrchestratorError::CommandFailed(
                        "dependency install failed".to_string(),
                    ));
                }
            }

            self.store
                .append_log(task_id, LogCategory::Command, "Preparing agent CLI")
                .await?;
            let output = self
                .provider
                .run_command(
                    &handle,
                    agent.install_command(),
                    None,
                    &HashMap::new(),
                    self.config.install_timeout,
                )
                .await?;
            if !output.success() {
                debug!("Agent install stderr: {}", output.stderr);
                return Err(OrchestratorError::CommandFailed(format!(
                    "{} install failed",
                    agent.as_str()
                )));
            }
        }

        // Feature branch: reuse the persisted name across cycles, create a
        // deterministic one on the first.
        let branch = match &task.branch_name {
            Some(branch) => {
                if !resumed && git.checkout_branch(branch).await.is_err() {
                    // Never pushed in a previous cycle; recreate it locally.
                    git.create_branch(branch).await?;
                }
                branch.clone()
            }
            None => {
                let branch = feature_branch_name(task_id, &task.prompt);
                git.create_branch(&branch).await?;
                self.store
                    .update_task(
                        task_id,
                        TaskPatch {
                            branch_name: Some(branch.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;
                branch
            }
        };

        self.store
            .append_log(task_id, LogCategory::Command, "Running agent")
            .await?;

        let cancel_store = self.store.clone();
        let cancel_flag = flag.clone();
        let cancel_task_id = task_id.clone();
        let cancel_check = move || {
            let store = cancel_store.clone();
            let flag = cancel_flag.clone();
            let task_id = cancel_task_id.clone();
            async move {
                if flag.load(Ordering::SeqCst) {
                    return true;
                }
                matches!(store.get_status(&task_id).await, Ok(TaskStatus::Stopped))
            }
        };

        let request = ExecutionRequest {
            instruction: &task.prompt,
            agent,
            model: task.selected_model.as_deref(),
            resume_session: session_id.as_deref(),
            credentials,
            workdir: &self.config.repo_dir,
        };
        let result = self
            .engine
            .execute(self.provider.as_ref(), &handle, request, cancel_check)
            .await?;

        // Persist the session pointer as soon as it exists so a follow-up
        // can resume even after a later failure.
        if let Some(sid) = &result.session_id {
            session_id = Some(sid.clone());
            self.store
                .update_task(
                    task_id,
                    TaskPatch {
                        agent_session_id: Some(sid.clone()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        if result.cancelled {
            return Ok(CycleEnd::Cancelled);
        }
        if !result.success {
            return Err(OrchestratorError::AgentFailed(
                result
                    .error
                    .unwrap_or_else(|| "agent reported an unsuccessful result".to_string()),
            ));
        }

        let mut unpublished = false;
        if result.changes_detected {
            // The canceller may have claimed the terminal status while the
            // agent was finishing; check once more before any publish step.
            if self.check_cancelled(task_id, flag).await {
                return Ok(CycleEnd::Cancelled);
            }

            self.store
                .append_log(task_id, LogCategory::Command, "Committing changes")
                .await?;
            git.commit_all(&commit_message(&task.prompt)).await?;

            match git.push(&branch).await? {
                PushOutcome::Pushed => {
                    self.store
                        .append_log(task_id, LogCategory::Success, "Changes pushed")
                        .await?;
                }
                PushOutcome::PermissionDenied => {
                    unpublished = true;
                    self.store
                        .append_log(
                            task_id,
                            LogCategory::Error,
                            "Push not permitted; changes remain unpublished in the sandbox",
                        )
                        .await?;
                }
            }
        } else {
            self.store
                .append_log(task_id, LogCategory::Info, "No changes detected")
                .await?;
        }

        // Keep the sandbox only when the task asked for it and enough of the
        // time budget remains for a follow-up to be worth it.
        let budget = Duration::from_secs(task.max_duration_minutes.max(1) as u64 * 60);
        let keep =
            task.keep_alive && started.elapsed() + self.config.min_reuse_budget < budget;

        let mut patch = TaskPatch {
            branch_name: Some(branch),
            has_unpushed_changes: Some(unpublished),
            ..Default::default()
        };
        if keep {
            patch.sandbox_id = Some(handle.id.clone());
            patch.agent_session_id = session_id;
        } else {
            if let Err(e) = self.provider.shutdown(&handle.id).await {
                error!("Failed to shut down sandbox {}: {}", handle.id, e);
            }
            patch.clear_sandbox = true;
        }

        let applied = self
            .store
            .transition(task_id, &[TaskStatus::Processing], TaskStatus::Completed, patch)
            .await?;
        if applied {
            self.store
                .append_log(task_id, LogCategory::Success, "Task completed")
                .await?;
        } else {
            // A stop or timeout landed first; its terminal state stands.
            info!("Terminal status for {} already written elsewhere", task_id);
        }

        Ok(CycleEnd::Finalized)
    }

    /// Resolve the sandbox for a cycle: probe-and-reuse for keep-alive tasks
    /// with a persisted id, otherwise create fresh with bounded retry.
    async fn resolve_sandbox(&self, task: &Task) -> Result<(SandboxHandle, bool)> {
        if task.keep_alive {
            if let Some(sandbox_id) = &task.sandbox_id {
                match self.prober.probe(self.provider.as_ref(), sandbox_id).await {
                    ProbeOutcome::Healthy {
                        handle,
                        response_time_ms,
                    } => {
                        info!(
                            "Reusing healthy sandbox {} ({}ms)",
                            sandbox_id, response_time_ms
                        );
                        self.store
                            .append_log(&task.id, LogCategory::Info, "Reusing existing sandbox")
                            .await?;
                        return Ok((handle, true));
                    }
                    ProbeOutcome::Unhealthy { reason } => {
                        // The unhealthy id is never reused within this cycle.
                        // Losing the refs costs session continuity, not task
                        // continuity.
                        warn!("Sandbox {} unhealthy: {}", sandbox_id, reason);
                        self.store
                            .append_log(
                                &task.id,
                                LogCategory::Info,
                                "Existing sandbox unavailable; creating a new one",
                            )
                            .await?;
                        self.store
                            .update_task(
                                &task.id,
                                TaskPatch {
                                    clear_sandbox: true,
                                    ..Default::default()
                                },
                            )
                            .await?;
                    }
                }
            }
        }

        let handle = self.create_with_retry(task).await?;
        self.store
            .update_task(
                &task.id,
                TaskPatch {
                    sandbox_id: Some(handle.id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        Ok((handle, false))
    }

    async fn create_with_retry(&self, task: &Task) -> Result<SandboxHandle> {
        let mut config = self.config.sandbox.clone();
        config
            .labels
            .insert("maestro.task".to_string(), task.id.clone());
        config.ttl_minutes = Some(
            task.max_duration_minutes.max(1) as u64
                + self.config.keepalive_window.as_secs() / 60,
        );

        self.store
            .append_log(&task.id, LogCategory::Info, "Creating sandbox")
            .await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.provider.create(&config).await {
                Ok(handle) => {
                    info!("Created sandbox {} for task {}", handle.id, task.id);
                    return Ok(handle);
                }
                Err(e) if e.is_transient() && attempt < self.config.create_retries => {
                    warn!("Sandbox creation attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(self.config.create_retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) async fn check_cancelled(&self, task_id: &str, flag: &Arc<AtomicBool>) -> bool {
        if flag.load(Ordering::SeqCst) {
            return true;
        }
        matches!(
            self.store.get_status(task_id).await,
            Ok(TaskStatus::Stopped)
        )
    }

    /// Resolve an internal failure into a terminal `error` status.
    ///
    /// The raw error goes to operator logs; the task record and log sink get
    /// the static per-category line.
    async fn finalize_failure(&self, task: &Task, e: OrchestratorError) {
        error!("Processing cycle for {} failed: {}", task.id, e);
        if let Err(log_err) = self
            .store
            .append_log(&task.id, LogCategory::Error, e.user_message())
            .await
        {
            error!("Failed to append error log for {}: {}", task.id, log_err);
        }

        let mut patch = TaskPatch {
            error_message: Some(e.task_error_message()),
            ..Default::default()
        };

        if !task.keep_alive {
            if let Ok((Some(sandbox_id), _)) = self.store.get_runtime_refs(&task.id).await {
                match self.provider.shutdown(&sandbox_id).await {
                    Ok(()) => patch.clear_sandbox = true,
                    Err(shutdown_err) => error!(
                        "Failed to shut down sandbox {}: {}",
                        sandbox_id, shutdown_err
                    ),
                }
            }
        }

        match self
            .store
            .transition(&task.id, &[TaskStatus::Processing], TaskStatus::Error, patch)
            .await
        {
            Ok(true) => {}
            Ok(false) => info!(
                "Terminal status for {} already written elsewhere",
                task.id
            ),
            Err(store_err) => error!("Failed to finalize {}: {}", task.id, store_err),
        }
    }
}
