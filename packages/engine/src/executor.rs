// ABOUTME: Polling-based execution of detached agent processes inside sandboxes
// ABOUTME: Distinguishes completion, cancellation, stall and per-step timeout outcomes

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use maestro_agents::{extract_session_id, parse_output, AgentKind, Credentials};
use maestro_sandbox::{ProcessEvent, ProviderError, SandboxHandle, SandboxProvider};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// One agent execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'a> {
    pub instruction: &'a str,
    pub agent: AgentKind,
    pub model: Option<&'a str>,
    pub resume_session: Option<&'a str>,
    pub credentials: &'a Credentials,
    pub workdir: &'a str,
}

/// Produced once per execution attempt and consumed immediately.
///
/// `stalled` (no output for the inactivity window) is reported distinctly
/// from `cancelled` and from the per-step timeout for diagnosability.
#[derive(Debug, Clone, Default)]
pub struct AgentExecutionResult {
    pub success: bool,
    pub cancelled: bool,
    pub stalled: bool,
    pub output: String,
    pub error: Option<String>,
    pub changes_detected: bool,
    pub session_id: Option<String>,
}

/// Engine timers. All four orchestration timers in the system are
/// independent; these two cover only the agent step itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub inactivity_timeout: Duration,
    pub step_timeout: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: env_duration("MAESTRO_ENGINE_POLL_INTERVAL_SECONDS", 1..=60)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            inactivity_timeout: env_duration("MAESTRO_ENGINE_INACTIVITY_TIMEOUT_SECONDS", 10..=3600)
                .unwrap_or(DEFAULT_INACTIVITY_TIMEOUT),
            step_timeout: env_duration("MAESTRO_ENGINE_STEP_TIMEOUT_SECONDS", 30..=7200)
                .unwrap_or(DEFAULT_STEP_TIMEOUT),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_duration(key: &str, range: std::ops::RangeInclusive<u64>) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| range.contains(v))
        .map(Duration::from_secs)
}

pub struct ExecutionEngine {
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::from_env(),
        }
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Launch the agent CLI detached and poll it to an outcome.
    ///
    /// `cancel_check` is consulted every tick; returning `true` means an
    /// external writer has already claimed the terminal status and this
    /// attempt must abandon its work. Termination issued from here is
    /// advisory only; the enclosing sandbox shutdown is the reliable stop
    /// and belongs to the orchestrator/supervisor.
    pub async fn execute<F, Fut>(
        &self,
        provider: &dyn SandboxProvider,
        handle: &SandboxHandle,
        request: ExecutionRequest<'_>,
        cancel_check: F,
    ) -> Result<AgentExecutionResult>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = bool> + Send,
    {
        let command = request
            .agent
            .command(request.instruction, request.model, request.resume_session);
        let env = request.credentials.to_env();

        info!(agent = request.agent.as_str(), "Launching agent process");
        let mut detached = provider
            .start_detached(handle, &command, Some(request.workdir), &env)
            .await?;

        let started = Instant::now();
        let mut last_output = Instant::now();
        let mut buffer = String::new();
        let mut exit_code: Option<i64> = None;
        let mut stream_closed = false;

        loop {
            // Drain everything the process produced since the last tick.
            loop {
                match detached.events.try_recv() {
                    Ok(ProcessEvent::Output(chunk)) => {
                        buffer.push_str(&chunk);
                        last_output = Instant::now();
                    }
                    Ok(ProcessEvent::Exited(code)) => {
                        exit_code = Some(code);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        stream_closed = true;
                        break;
                    }
                }
            }

            // 1. Structured completion marker wins over everything else.
            if let Some(completion) = parse_output(request.agent, &buffer) {
                debug!(success = completion.success, "Agent reported completion");
                let changes_detected = completion.success
                    && self.detect_changes(provider, handle, request.workdir).await;
                return Ok(AgentExecutionResult {
                    success: completion.success,
                    session_id: completion
                        .session_id
                        .or_else(|| extract_session_id(request.agent, &buffer)),
                    error: (!completion.success)
                        .then(|| "agent reported an unsuccessful result".to_string()),
                    changes_detected,
                    output: buffer,
                    ..Default::default()
                });
            }

            // Process exit without a marker: plain-text agents end this way.
            if let Some(code) = exit_code {
                let success = code == 0;
                let changes_detected =
                    success && self.detect_changes(provider, handle, request.workdir).await;
                return Ok(AgentExecutionResult {
                    success,
                    session_id: extract_session_id(request.agent, &buffer),
                    error: (!success).then(|| format!("agent exited with code {}", code)),
                    changes_detected,
                    output: buffer,
                    ..Default::default()
                });
            }

            if stream_closed {
                return Ok(AgentExecutionResult {
                    success: false,
                    error: Some("agent output stream closed unexpectedly".to_string()),
                    output: buffer,
                    ..Default::default()
                });
            }

            // 2. External stop: the canceller owns the terminal write.
            if cancel_check().await {
                info!("Cancellation observed; abandoning agent execution");
                if let Err(e) = provider.request_cancel(handle, &detached.exec_id).await {
                    debug!("Advisory cancel failed: {}", e);
                }
                return Ok(AgentExecutionResult {
                    cancelled: true,
                    output: buffer,
                    ..Default::default()
                });
            }

            // 3. Inactivity: the agent went quiet without finishing.
            if last_output.elapsed() >= self.config.inactivity_timeout {
                warn!(
                    "Agent stalled: no output for {:?}",
                    self.config.inactivity_timeout
                );
                if let Err(e) = provider.request_cancel(handle, &detached.exec_id).await {
                    debug!("Advisory cancel failed: {}", e);
                }
                return Ok(AgentExecutionResult {
                    stalled: true,
                    error: Some(format!(
                        "agent produced no output for {}s",
                        self.config.inactivity_timeout.as_secs()
                    )),
                    output: buffer,
                    ..Default::default()
                });
            }

            // 4. Per-step ceiling, independent of the task's max duration.
            if started.elapsed() >= self.config.step_timeout {
                warn!("Agent step exceeded {:?}", self.config.step_timeout);
                if let Err(e) = provider.request_cancel(handle, &detached.exec_id).await {
                    debug!("Advisory cancel failed: {}", e);
                }
                return Ok(AgentExecutionResult {
                    error: Some(format!(
                        "agent step exceeded {}s",
                        self.config.step_timeout.as_secs()
                    )),
                    output: buffer,
                    ..Default::default()
                });
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Whether the agent left uncommitted changes in the working tree.
    async fn detect_changes(
        &self,
        provider: &dyn SandboxProvider,
        handle: &SandboxHandle,
        workdir: &str,
    ) -> bool {
        match provider
            .run_command(
                handle,
                "git status --porcelain",
                Some(workdir),
                &HashMap::new(),
                Duration::from_secs(30),
            )
            .await
        {
            Ok(output) if output.success() => !output.stdout.trim().is_empty(),
            Ok(output) => {
                warn!("Change detection exited {}", output.exit_code);
                false
            }
            Err(e) => {
                warn!("Change detection failed: {}", e);
                false
            }
        }
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new()
    }
}
