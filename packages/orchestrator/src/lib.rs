// ABOUTME: Task orchestration for Maestro
// ABOUTME: Processing cycles, timeout supervision, stop handling and sandbox reaping

use thiserror::Error;

pub mod cancel;
pub mod config;
pub mod orchestrator;
pub mod reaper;
pub mod supervisor;

pub use cancel::CancellationRegistry;
pub use config::OrchestratorConfig;
pub use orchestrator::{Secrets, TaskOrchestrator};
pub use reaper::{start_reaper, sweep_once};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Store(#[from] maestro_store::StoreError),

    #[error("Provider error: {0}")]
    Provider(#[from] maestro_sandbox::ProviderError),

    #[error("Git error: {0}")]
    Git(#[from] maestro_sandbox::GitError),

    #[error("Engine error: {0}")]
    Engine(#[from] maestro_engine::EngineError),

    #[error("Agent error: {0}")]
    Agent(#[from] maestro_agents::AgentError),

    #[error("Agent execution failed: {0}")]
    AgentFailed(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Task join error: {0}")]
    Join(String),
}

impl OrchestratorError {
    /// Static, user-facing line for the task log sink. Raw detail stays in
    /// operator logs only.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Store(_) => "Internal storage error",
            Self::Provider(_) => "Sandbox provider error",
            Self::Git(_) => "Git operation failed",
            Self::Engine(_) => "Agent could not be launched",
            Self::Agent(_) => "Agent configuration error",
            Self::AgentFailed(_) => "Agent execution failed",
            Self::CommandFailed(_) => "Sandbox command failed",
            Self::Join(_) => "Internal execution error",
        }
    }

    /// Message stored on the task record. Messages this crate composed are
    /// kept verbatim; everything else collapses to the static description.
    pub fn task_error_message(&self) -> String {
        match self {
            Self::AgentFailed(msg) | Self::CommandFailed(msg) => msg.clone(),
            other => other.user_message().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
