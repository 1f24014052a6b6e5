// ABOUTME: Sandbox provider adapter for the Maestro orchestrator
// ABOUTME: Uniform backend interface, health probing and in-sandbox git operations

pub mod git;
pub mod health;
pub mod providers;

pub use git::{commit_message, feature_branch_name, GitError, GitWorkspace, PushOutcome};
pub use health::{HealthProber, ProbeOutcome};
pub use providers::{
    CommandOutput, DetachedCommand, DockerProvider, ProcessEvent, ProviderError, RunnerProvider,
    SandboxConfig, SandboxHandle, SandboxProvider,
};
