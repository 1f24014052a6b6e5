// ABOUTME: Docker provider implementation for container-based sandboxes
// ABOUTME: Uses bollard to manage long-lived containers running agent workloads

use super::{
    shell_script, CommandOutput, DetachedCommand, ProcessEvent, ProviderError, Result,
    SandboxConfig, SandboxHandle, SandboxProvider,
};
use async_trait::async_trait;
use bollard::{
    container::{Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions},
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PROVIDER_NAME: &str = "docker";
const LABEL_PREFIX: &str = "maestro.sandbox";

pub struct DockerProvider {
    client: Docker,
    /// Timeout for image pull operations
    pull_timeout: Duration,
}

impl DockerProvider {
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            pull_timeout: timeout,
        })
    }

    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            pull_timeout: Duration::from_secs(600),
        }
    }

    fn to_container_config(&self, config: &SandboxConfig) -> Config<String> {
        let mut labels = config.labels.clone();
        labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());

        let env: Vec<String> = config
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            cpu_shares: Some((config.cpu_cores * 1024.0) as i64),
            memory: Some((config.memory_mb * 1024 * 1024) as i64),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            // The container itself is inert; all work happens through execs.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            working_dir: Some("/workspace".to_string()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let pull = async {
            let mut stream = self.client.create_image(Some(options), None, None);
            while let Some(result) = stream.next().await {
                let info = result
                    .map_err(|e| ProviderError::SandboxError(format!("image pull: {}", e)))?;
                if let Some(error) = info.error {
                    return Err(ProviderError::SandboxError(format!(
                        "image pull {}: {}",
                        image, error
                    )));
                }
            }
            Ok(())
        };

        tokio::time::timeout(self.pull_timeout, pull)
            .await
            .map_err(|_| ProviderError::Timeout(format!("pulling image {}", image)))?
    }

    async fn create_exec(
        &self,
        container_id: &str,
        script: String,
        env: &HashMap<String, String>,
    ) -> Result<String> {
        let env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let exec = self
            .client
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh".to_string(), "-lc".to_string(), script]),
                    env: Some(env),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_docker_error(container_id, e))?;

        Ok(exec.id)
    }
}

fn map_docker_error(id: &str, e: bollard::errors::Error) -> ProviderError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 410,
            ..
        } => ProviderError::Gone(id.to_string()),
        e => ProviderError::SandboxError(e.to_string()),
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle> {
        self.ensure_image(&config.image).await?;

        let name = format!(
            "maestro-sbx-{}",
            &uuid::Uuid::new_v4().to_string().replace('-', "")[..12]
        );
        info!("Creating sandbox container: {}", name);

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), self.to_container_config(config))
            .await
            .map_err(|e| ProviderError::SandboxError(e.to_string()))?;

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProviderError::SandboxError(e.to_string()))?;

        debug!("Started sandbox container: {}", container.id);

        Ok(SandboxHandle {
            id: container.id,
            provider: PROVIDER_NAME.to_string(),
        })
    }

    async fn connect(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        let inspect = self
            .client
            .inspect_container(sandbox_id, None)
            .await
            .map_err(|e| map_docker_error(sandbox_id, e))?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        if !running {
            // A stopped container may be restartable; anything else is gone.
            self.client
                .start_container(sandbox_id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|_| ProviderError::Gone(sandbox_id.to_string()))?;
        }

        Ok(SandboxHandle {
            id: sandbox_id.to_string(),
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
        let exec_id = self
            .create_exec(&handle.id, shell_script(command, cwd), env)
            .await?;

        let start = self
            .client
            .start_exec(&exec_id, None)
            .await
            .map_err(|e| map_docker_error(&handle.id, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let collect = async {
            match start {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(msg) = output.next().await {
                        match msg {
                            Ok(bollard::container::LogOutput::StdOut { message }) => {
                                stdout.extend_from_slice(&message)
                            }
                            Ok(bollard::container::LogOutput::StdErr { message }) => {
                                stderr.extend_from_slice(&message)
                            }
                            Ok(bollard::container::LogOutput::Console { message }) => {
                                stdout.extend_from_slice(&message)
                            }
                            _ => {}
                        }
                    }
                    Ok(())
                }
                StartExecResults::Detached => Err(ProviderError::CommandError(
                    "exec was detached unexpectedly".to_string(),
                )),
            }
        };

        tokio::time::timeout(timeout, collect)
            .await
            .map_err(|_| ProviderError::Timeout(format!("command after {:?}", timeout)))??;

        let inspect = self
            .client
            .inspect_exec(&exec_id)
            .await
            .map_err(|e| map_docker_error(&handle.id, e))?;

        Ok(CommandOutput {
            exit_code: inspect.exit_code.unwrap_or(0),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }

    async fn start_detached(
        &self,
        handle: &SandboxHandle,
        command: &str,
        cwd: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<DetachedCommand> {
        let exec_id = self
            .create_exec(&handle.id, shell_script(command, cwd), env)
            .await?;

        let start = self
            .client
            .start_exec(&exec_id, None)
            .await
            .map_err(|e| map_docker_error(&handle.id, e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let forward_exec_id = exec_id.clone();

        tokio::spawn(async move {
            if let StartExecResults::Attached { mut output, .. } = start {
                while let Some(msg) = output.next().await {
                    let data = match msg {
                        Ok(bollard::container::LogOutput::StdOut { message })
                        | Ok(bollard::container::LogOutput::StdErr { message })
                        | Ok(bollard::container::LogOutput::Console { message }) => message,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("Detached exec stream error: {}", e);
                            break;
                        }
                    };
                    if tx
                        .send(ProcessEvent::Output(
                            String::from_utf8_lossy(&data).to_string(),
                        ))
                        .is_err()
                    {
                        return; // Receiver dropped
                    }
                }
            }

            let exit_code = match client.inspect_exec(&forward_exec_id).await {
                Ok(inspect) => inspect.exit_code.unwrap_or(-1),
                Err(_) => -1,
            };
            let _ = tx.send(ProcessEvent::Exited(exit_code));
        });

        Ok(DetachedCommand {
            exec_id,
            events: rx,
        })
    }

    async fn request_cancel(&self, handle: &SandboxHandle, exec_id: &str) -> Result<()> {
        // Exec processes have no kill API; resolve the pid and signal it.
        let inspect = self
            .client
            .inspect_exec(exec_id)
            .await
            .map_err(|e| map_docker_error(&handle.id, e))?;

        let Some(pid) = inspect.pid.filter(|pid| *pid > 0) else {
            debug!("No pid for exec {}, cancel is a no-op", exec_id);
            return Ok(());
        };

        let kill = self
            .run_command(
                handle,
                &format!("kill -TERM {}", pid),
                None,
                &HashMap::new(),
                Duration::from_secs(5),
            )
            .await?;

        if !kill.success() {
            debug!("Advisory kill of pid {} exited {}", pid, kill.exit_code);
        }
        Ok(())
    }

    async fn shutdown(&self, sandbox_id: &str) -> Result<()> {
        info!("Shutting down sandbox container: {}", sandbox_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.client.remove_container(sandbox_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 410,
                ..
            }) => {
                debug!("Sandbox {} already gone", sandbox_id);
                Ok(())
            }
            Err(e) => Err(ProviderError::SandboxError(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_config_conversion() {
        let Ok(provider) = DockerProvider::new() else {
            return; // No Docker socket in this environment
        };

        let mut config = SandboxConfig::default();
        config
            .env_vars
            .insert("FOO".to_string(), "bar".to_string());
        config
            .labels
            .insert("maestro.sandbox.task".to_string(), "task_1".to_string());

        let container = provider.to_container_config(&config);
        assert_eq!(container.image, Some("node:20-bookworm".to_string()));
        assert_eq!(
            container.cmd,
            Some(vec!["sleep".to_string(), "infinity".to_string()])
        );
        let labels = container.labels.unwrap();
        assert_eq!(labels.get("maestro.sandbox.managed"), Some(&"true".to_string()));
        assert_eq!(labels.get("maestro.sandbox.task"), Some(&"task_1".to_string()));
    }
}
