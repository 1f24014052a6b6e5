// ABOUTME: Provider trait and implementations for sandbox execution backends
// ABOUTME: Defines the abstract interface for remote sandbox lifecycle and command execution

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod docker;
pub mod runner;

pub use docker::DockerProvider;
pub use runner::RunnerProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Sandbox error: {0}")]
    SandboxError(String),

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Sandbox already gone: {0}")]
    Gone(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl ProviderError {
    /// "Already gone" is a first-class outcome: for teardown paths the
    /// desired end state (no running sandbox) is already true.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }

    /// Transient failures are retryable at the creation boundary only.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionError(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Configuration for creating a sandbox
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub cpu_cores: f32,
    pub memory_mb: u64,
    pub env_vars: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Provider-side lifetime cap, where the backend supports one.
    pub ttl_minutes: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "node:20-bookworm".to_string(),
            cpu_cores: 2.0,
            memory_mb: 4096,
            env_vars: HashMap::new(),
            labels: HashMap::new(),
            ttl_minutes: None,
        }
    }
}

/// Ephemeral, process-local wrapper around a live sandbox connection.
///
/// Owned exclusively by the orchestrator run that created or reconnected it;
/// only the `id` survives process restarts (persisted on the task record).
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub id: String,
    pub provider: String,
}

/// Result of running a command to completion inside a sandbox
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Event emitted by a detached command
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Output(String),
    Exited(i64),
}

/// A command launched without awaiting completion.
///
/// The exec id is the only cancellation token; the receiver yields output
/// chunks until the process exits or the stream is torn down with the
/// sandbox. A detached remote process has no killable OS handle here —
/// `request_cancel` is advisory, sandbox shutdown is the reliable stop.
pub struct DetachedCommand {
    pub exec_id: String,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Provider trait for sandbox backends.
///
/// Callers never branch on backend identity; every variant implements the
/// same capability set.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Check if the backend is reachable and configured correctly
    async fn is_available(&self) -> Result<bool>;

    /// Provision and start a new sandbox
    async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle>;

    /// Rebuild a live connection from a durable sandbox id.
    /// A sandbox that no longer exists surfaces as `ProviderError::Gone`.
    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle>;

    /// Run a shell command to completion
    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        cwd: Option<&str>,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Launch a shell command without awaiting it
    async fn start_detached(
        &self,
        handle: &SandboxHandle,
        command: &str,
        cwd: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<DetachedCommand>;

    /// Best-effort termination of a detached command; may be a no-op
    async fn request_cancel(&self, handle: &SandboxHandle, exec_id: &str) -> Result<()>;

    /// Terminate the sandbox. "Already gone" is normalized to success.
    async fn shutdown(&self, sandbox_id: &str) -> Result<()>;
}

/// Build the shell script actually executed for a command, honoring an
/// optional working directory. Both backends wrap it in `sh -lc`.
pub(crate) fn shell_script(command: &str, cwd: Option<&str>) -> String {
    match cwd {
        Some(dir) => format!("cd {} && {}", dir, command),
        None => command.to_string(),
    }
}
