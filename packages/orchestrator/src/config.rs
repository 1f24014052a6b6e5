// ABOUTME: Runtime configuration for the orchestrator
// ABOUTME: Environment-variable tunables with validated fallbacks

use maestro_sandbox::SandboxConfig;
use std::time::Duration;

const DEFAULT_REPO_DIR: &str = "/workspace/repo";
const DEFAULT_CREATE_RETRIES: u32 = 3;
const DEFAULT_CREATE_RETRY_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_KEEPALIVE_WINDOW: Duration = Duration::from_secs(10 * 60);
const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_MIN_REUSE_BUDGET: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Where repositories are cloned inside a sandbox
    pub repo_dir: String,
    /// Base sandbox configuration; per-task labels/TTL are layered on top
    pub sandbox: SandboxConfig,
    /// Bounded retry at the creation boundary only, never mid-execution
    pub create_retries: u32,
    pub create_retry_delay: Duration,
    /// Timeout for agent CLI install and optional project dependency install
    pub install_timeout: Duration,
    /// Optional project dependency install command run after clone
    pub install_command: Option<String>,
    /// How long a keep-alive sandbox may outlive its task's terminal state
    pub keepalive_window: Duration,
    pub reaper_interval: Duration,
    /// Minimum remaining time budget required to keep a sandbox for reuse
    pub min_reuse_budget: Duration,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let mut sandbox = SandboxConfig::default();
        if let Ok(image) = std::env::var("MAESTRO_SANDBOX_IMAGE") {
            if !image.is_empty() {
                sandbox.image = image;
            }
        }

        Self {
            repo_dir: DEFAULT_REPO_DIR.to_string(),
            sandbox,
            create_retries: env_u64("MAESTRO_CREATE_RETRIES", 1..=10)
                .map(|v| v as u32)
                .unwrap_or(DEFAULT_CREATE_RETRIES),
            create_retry_delay: DEFAULT_CREATE_RETRY_DELAY,
            install_timeout: env_secs("MAESTRO_INSTALL_TIMEOUT_SECONDS", 30..=3600)
                .unwrap_or(DEFAULT_INSTALL_TIMEOUT),
            install_command: std::env::var("MAESTRO_INSTALL_COMMAND")
                .ok()
                .filter(|v| !v.is_empty()),
            keepalive_window: env_secs("MAESTRO_KEEPALIVE_WINDOW_MINUTES", 1..=720)
                .map(|d| d * 60)
                .unwrap_or(DEFAULT_KEEPALIVE_WINDOW),
            reaper_interval: env_secs("MAESTRO_REAPER_INTERVAL_SECONDS", 10..=3600)
                .unwrap_or(DEFAULT_REAPER_INTERVAL),
            min_reuse_budget: DEFAULT_MIN_REUSE_BUDGET,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_u64(key: &str, range: std::ops::RangeInclusive<u64>) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| range.contains(v))
}

fn env_secs(key: &str, range: std::ops::RangeInclusive<u64>) -> Option<Duration> {
    env_u64(key, range).map(Duration::from_secs)
}
