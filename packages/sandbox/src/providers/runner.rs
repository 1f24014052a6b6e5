// ABOUTME: Remote runner provider speaking the sandbox runner daemon REST API
// ABOUTME: Provisions sandboxes over HTTP and polls detached exec output into event channels

use super::{
    shell_script, CommandOutput, DetachedCommand, ProcessEvent, ProviderError, Result,
    SandboxConfig, SandboxHandle, SandboxProvider,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PROVIDER_NAME: &str = "runner";
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLL_FAILURES: u32 = 5;

/// Client for a remote sandbox runner daemon.
///
/// Protocol:
///   POST   /v1/sandboxes                         create
///   GET    /v1/sandboxes/:id                     inspect
///   POST   /v1/sandboxes/:id/exec                run (sync or detached)
///   GET    /v1/sandboxes/:id/exec/:eid/output    poll detached output
///   POST   /v1/sandboxes/:id/exec/:eid/cancel    advisory cancel
///   DELETE /v1/sandboxes/:id                     terminate
pub struct RunnerProvider {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    image: &'a str,
    cpu_cores: f32,
    memory_mb: u64,
    env: &'a HashMap<String, String>,
    labels: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SandboxInfo {
    id: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: &'a str,
    detach: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_seconds: Option<u64>,
    env: &'a HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ExecResponse {
    #[serde(default)]
    exec_id: Option<String>,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(Debug, Deserialize)]
struct ExecOutput {
    #[serde(default)]
    output: String,
    offset: u64,
    #[serde(default)]
    exit_code: Option<i64>,
}

impl RunnerProvider {
    pub fn new(base_url: String, api_token: String) -> Result<Self> {
        if base_url.is_empty() || api_token.is_empty() {
            return Err(ProviderError::ConfigError(
                "runner base URL and API token are required".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        sandbox_id: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let response = request
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        match response.status() {
            s if s.is_success() => Ok(response),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                Err(ProviderError::Gone(sandbox_id.to_string()))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ProviderError::ConfigError(
                "runner rejected API token".to_string(),
            )),
            s if s.is_server_error() => Err(ProviderError::ConnectionError(format!(
                "runner returned {}",
                s
            ))),
            s => Err(ProviderError::SandboxError(format!(
                "unexpected runner status {}",
                s
            ))),
        }
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        body: &ExecRequest<'_>,
        client_timeout: Option<Duration>,
    ) -> Result<ExecResponse> {
        let request = self
            .http
            .post(self.url(&format!("/v1/sandboxes/{}/exec", handle.id)))
            .json(body);
        let request = match client_timeout {
            Some(t) => request.timeout(t),
            None => request,
        };

        self.send(&handle.id, request)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::CommandError(format!("malformed exec response: {}", e)))
    }
}

#[async_trait]
impl SandboxProvider for RunnerProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn is_available(&self) -> Result<bool> {
        let request = self.http.get(self.url("/v1/health"));
        match self.send("health", request).await {
            Ok(_) => Ok(true),
            Err(ProviderError::ConnectionError(e)) => {
                warn!("Runner not available: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle> {
        let body = CreateRequest {
            image: &config.image,
            cpu_cores: config.cpu_cores,
            memory_mb: config.memory_mb,
            env: &config.env_vars,
            labels: &config.labels,
            ttl_minutes: config.ttl_minutes,
        };

        let request = self.http.post(self.url("/v1/sandboxes")).json(&body);
        let info: SandboxInfo = self
            .send("create", request)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::SandboxError(format!("malformed create response: {}", e)))?;

        info!("Created runner sandbox: {}", info.id);

        Ok(SandboxHandle {
            id: info.id,
            provider: PROVIDER_NAME.to_string(),
        })
    }

    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        let request = self
            .http
            .get(self.url(&format!("/v1/sandboxes/{}", sandbox_id)));
        let info: SandboxInfo = self
            .send(sandbox_id, request)
            .await?
            .json()
            .await
            .map_err(|e| {
                ProviderError::SandboxError(format!("malformed inspect response: {}", e))
            })?;

        if info.status != "running" {
            return Err(ProviderError::Gone(sandbox_id.to_string()));
        }

        Ok(SandboxHandle {
            id: info.id,
            provider: PROVIDER_NAME.to_string(),
        })
    }

    async fn run_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
        cwd: Option<&str>,
        env: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let script = shell_script(command, cwd);
        let body = ExecRequest {
            command: &script,
            detach: false,
            timeout_seconds: Some(timeout.as_secs()),
            env,
        };

        // Client-side timeout gets a grace period over the server-side one so
        // the runner's own timeout error wins when both fire.
        let response = self
            .exec(handle, &body, Some(timeout + Duration::from_secs(10)))
            .await?;

        Ok(CommandOutput {
            exit_code: response.exit_code.unwrap_or(-1),
            stdout: response.stdout,
            stderr: response.stderr,
        })
    }

    async fn start_detached(
        &self,
        handle: &SandboxHandle,
        command: &str,
        cwd: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<DetachedCommand> {
        let script = shell_script(command, cwd);
        let body = ExecRequest {
            command: &script,
            detach: true,
            timeout_seconds: None,
            env,
        };

        let response = self.exec(handle, &body, None).await?;
        let exec_id = response.exec_id.ok_or_else(|| {
            ProviderError::CommandError("runner did not return an exec id".to_string())
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let http = self.http.clone();
        let token = self.api_token.clone();
        let output_url = self.url(&format!(
            "/v1/sandboxes/{}/exec/{}/output",
            handle.id, exec_id
        ));

        tokio::spawn(async move {
            let mut offset: u64 = 0;
            let mut failures: u32 = 0;

            loop {
                tokio::time::sleep(OUTPUT_POLL_INTERVAL).await;

                let poll = http
                    .get(&output_url)
                    .query(&[("offset", offset)])
                    .bearer_auth(&token)
                    .send()
                    .await;

                let response = match poll {
                    Ok(r) if r.status().is_success() => r,
                    Ok(r)
                        if r.status() == StatusCode::NOT_FOUND
                            || r.status() == StatusCode::GONE =>
                    {
                        // Sandbox or exec vanished under us; report an abnormal exit.
                        let _ = tx.send(ProcessEvent::Exited(-1));
                        return;
                    }
                    Ok(r) => {
                        failures += 1;
                        debug!("Output poll returned {}", r.status());
                        if failures >= MAX_POLL_FAILURES {
                            let _ = tx.send(ProcessEvent::Exited(-1));
                            return;
                        }
                        continue;
                    }
                    Err(e) => {
                        failures += 1;
                        debug!("Output poll failed: {}", e);
                        if failures >= MAX_POLL_FAILURES {
                            let _ = tx.send(ProcessEvent::Exited(-1));
                            return;
                        }
                        continue;
                    }
                };
                failures = 0;

                let Ok(chunk) = response.json::<ExecOutput>().await else {
                    continue;
                };

                offset = chunk.offset;
                if !chunk.output.is_empty()
                    && tx.send(ProcessEvent::Output(chunk.output)).is_err()
                {
                    return; // Receiver dropped
                }
                if let Some(code) = chunk.exit_code {
                    let _ = tx.send(ProcessEvent::Exited(code));
                    return;
                }
            }
        });

        Ok(DetachedCommand {
            exec_id,
            events: rx,
        })
    }

    async fn request_cancel(&self, handle: &SandboxHandle, exec_id: &str) -> Result<()> {
        let request = self.http.post(self.url(&format!(
            "/v1/sandboxes/{}/exec/{}/cancel",
            handle.id, exec_id
        )));

        match self.send(&handle.id, request).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_gone() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&self, sandbox_id: &str) -> Result<()> {
        info!("Shutting down runner sandbox: {}", sandbox_id);

        let request = self
            .http
            .delete(self.url(&format!("/v1/sandboxes/{}", sandbox_id)));

        match self.send(sandbox_id, request).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_gone() => {
                debug!("Sandbox {} already gone", sandbox_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_config() {
        assert!(matches!(
            RunnerProvider::new(String::new(), "token".to_string()),
            Err(ProviderError::ConfigError(_))
        ));
        assert!(matches!(
            RunnerProvider::new("https://runner.local".to_string(), String::new()),
            Err(ProviderError::ConfigError(_))
        ));
        assert!(RunnerProvider::new(
            "https://runner.local".to_string(),
            "token".to_string()
        )
        .is_ok());
    }

    #[test]
    fn test_url_normalizes_trailing_slash() {
        let provider =
            RunnerProvider::new("https://runner.local/".to_string(), "token".to_string()).unwrap();
        assert_eq!(
            provider.url("/v1/sandboxes"),
            "https://runner.local/v1/sandboxes"
        );
    }
}
