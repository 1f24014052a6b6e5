// ABOUTME: Health probing for previously created sandboxes before reuse
// ABOUTME: A trivial remote command decides between reconnect and fresh creation

use crate::providers::{SandboxHandle, SandboxProvider};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of probing a reconnect candidate.
///
/// `Healthy` carries the live handle so the caller reuses the connection the
/// probe already established. Anything that is not provably healthy is
/// `Unhealthy`: the caller must discard the agent session id and create a
/// fresh sandbox. Session continuity is sacrificed; task continuity is not.
#[derive(Debug)]
pub enum ProbeOutcome {
    Healthy {
        handle: SandboxHandle,
        response_time_ms: u64,
    },
    Unhealthy {
        reason: String,
    },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

pub struct HealthProber {
    timeout: Duration,
}

impl HealthProber {
    pub fn new() -> Self {
        let timeout = std::env::var("MAESTRO_PROBE_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| (1..=60).contains(&v))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PROBE_TIMEOUT);

        Self { timeout }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Probe a sandbox id with a trivial command.
    pub async fn probe(&self, provider: &dyn SandboxProvider, sandbox_id: &str) -> ProbeOutcome {
        let start = std::time::Instant::now();

        let handle = match provider.connect(sandbox_id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Probe reconnect failed for {}: {}", sandbox_id, e);
                return ProbeOutcome::Unhealthy {
                    reason: format!("reconnect failed: {}", e),
                };
            }
        };

        match provider
            .run_command(&handle, "echo ok", None, &HashMap::new(), self.timeout)
            .await
        {
            Ok(output) if output.success() && output.stdout.trim() == "ok" => {
                let response_time_ms = start.elapsed().as_millis() as u64;
                debug!(
                    "Sandbox {} healthy ({}ms)",
                    sandbox_id, response_time_ms
                );
                ProbeOutcome::Healthy {
                    handle,
                    response_time_ms,
                }
            }
            Ok(output) => ProbeOutcome::Unhealthy {
                reason: format!("probe command exited {}", output.exit_code),
            },
            Err(e) => {
                warn!("Probe command failed for {}: {}", sandbox_id, e);
                ProbeOutcome::Unhealthy {
                    reason: format!("probe failed: {}", e),
                }
            }
        }
    }
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        CommandOutput, DetachedCommand, ProviderError, Result, SandboxConfig,
    };
    use async_trait::async_trait;

    enum ProbeBehavior {
        Ok,
        WrongOutput,
        NonZeroExit,
        GoneOnConnect,
        ErrorOnCommand,
    }

    struct ProbeProvider {
        behavior: ProbeBehavior,
    }

    #[async_trait]
    impl SandboxProvider for ProbeProvider {
        fn name(&self) -> &str {
            "probe-test"
        }

        async fn is_available(&self) -> Result<bool> {
            Ok(true)
        }

        async fn create(&self, _config: &SandboxConfig) -> Result<SandboxHandle> {
            Err(ProviderError::NotSupported("create".to_string()))
        }

        async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle> {
            if matches!(self.behavior, ProbeBehavior::GoneOnConnect) {
                return Err(ProviderError::Gone(sandbox_id.to_string()));
            }
            Ok(SandboxHandle {
                id: sandbox_id.to_string(),
                provider: "probe-test".to_string(),
            })
        }

        async fn run_command(
            &self,
            _handle: &SandboxHandle,
            _command: &str,
            _cwd: Option<&str>,
            _env: &HashMap<String, String>,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            match self.behavior {
                ProbeBehavior::Ok => Ok(CommandOutput {
                    exit_code: 0,
                    stdout: "ok\n".to_string(),
                    stderr: String::new(),
                }),
                ProbeBehavior::WrongOutput => Ok(CommandOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                }),
                ProbeBehavior::NonZeroExit => Ok(CommandOutput {
                    exit_code: 127,
                    stdout: String::new(),
                    stderr: "sh: echo: not found".to_string(),
                }),
                _ => Err(ProviderError::Timeout("probe".to_string())),
            }
        }

        async fn start_detached(
            &self,
            _handle: &SandboxHandle,
            _command: &str,
            _cwd: Option<&str>,
            _env: &HashMap<String, String>,
        ) -> Result<DetachedCommand> {
            Err(ProviderError::NotSupported("start_detached".to_string()))
        }

        async fn request_cancel(
            &self,
            _handle: &SandboxHandle,
            _exec_id: &str,
        ) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self, _sandbox_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_probe_healthy() {
        let provider = ProbeProvider {
            behavior: ProbeBehavior::Ok,
        };
        let prober = HealthProber::with_timeout(Duration::from_secs(5));
        let outcome = prober.probe(&provider, "sbx_1").await;
        assert!(outcome.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_wrong_output_is_unhealthy() {
        let provider = ProbeProvider {
            behavior: ProbeBehavior::WrongOutput,
        };
        let prober = HealthProber::with_timeout(Duration::from_secs(5));
        assert!(!prober.probe(&provider, "sbx_1").await.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_nonzero_exit_is_unhealthy() {
        let provider = ProbeProvider {
            behavior: ProbeBehavior::NonZeroExit,
        };
        let prober = HealthProber::with_timeout(Duration::from_secs(5));
        assert!(!prober.probe(&provider, "sbx_1").await.is_healthy());
    }

    #[tokio::test]
    async fn test_probe_gone_is_unhealthy() {
        let provider = ProbeProvider {
            behavior: ProbeBehavior::GoneOnConnect,
        };
        let prober = HealthProber::with_timeout(Duration::from_secs(5));
        let outcome = prober.probe(&provider, "sbx_1").await;
        match outcome {
            ProbeOutcome::Unhealthy { reason } => assert!(reason.contains("reconnect failed")),
            ProbeOutcome::Healthy { .. } => panic!("gone sandbox reported healthy"),
        }
    }

    #[tokio::test]
    async fn test_probe_command_error_is_unhealthy() {
        let provider = ProbeProvider {
            behavior: ProbeBehavior::ErrorOnCommand,
        };
        let prober = HealthProber::with_timeout(Duration::from_secs(5));
        assert!(!prober.probe(&provider, "sbx_1").await.is_healthy());
    }
}
