// ABOUTME: Git operations executed inside a sandbox through the provider adapter
// ABOUTME: Clone, branch, commit and push with soft/hard push failure classification

use crate::providers::{ProviderError, SandboxHandle, SandboxProvider};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const BOT_NAME: &str = "maestro-bot";
const BOT_EMAIL: &str = "bot@maestro.run";

const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const PUSH_TIMEOUT: Duration = Duration::from_secs(120);

/// Credential helper reading the token from the exec environment, so the
/// token never appears in command text or on-disk config.
const CREDENTIAL_HELPER: &str =
    "!f() { echo username=x-access-token; echo password=$GIT_TOKEN; }; f";

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("git {op} failed: {detail}")]
    CommandFailed { op: &'static str, detail: String },
}

pub type Result<T> = std::result::Result<T, GitError>;

/// Result of a push attempt.
///
/// Permission denial is a soft outcome: the work still exists in the
/// sandbox's local clone, the task just could not publish it.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    PermissionDenied,
}

/// Git operations bound to one repository checkout inside one sandbox.
pub struct GitWorkspace<'a> {
    provider: &'a dyn SandboxProvider,
    handle: &'a SandboxHandle,
    repo_dir: String,
    env: HashMap<String, String>,
}

impl<'a> GitWorkspace<'a> {
    pub fn new(
        provider: &'a dyn SandboxProvider,
        handle: &'a SandboxHandle,
        repo_dir: impl Into<String>,
        token: Option<&str>,
    ) -> Self {
        let mut env = HashMap::new();
        if let Some(token) = token {
            env.insert("GIT_TOKEN".to_string(), token.to_string());
        }

        Self {
            provider,
            handle,
            repo_dir: repo_dir.into(),
            env,
        }
    }

    pub fn repo_dir(&self) -> &str {
        &self.repo_dir
    }

    async fn run(
        &self,
        op: &'static str,
        command: &str,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<crate::providers::CommandOutput> {
        debug!("git {}: {}", op, command);
        let output = self
            .provider
            .run_command(self.handle, command, cwd, &self.env, timeout)
            .await?;

        if !output.success() {
            return Err(GitError::CommandFailed {
                op,
                detail: truncate(&output.stderr, 400),
            });
        }
        Ok(output)
    }

    /// Clone the repository and configure the bot identity plus the
    /// env-backed credential helper for subsequent pushes.
    pub async fn clone_repo(&self, repo_url: &str) -> Result<()> {
        info!("Cloning repository into {}", self.repo_dir);
        self.run(
            "clone",
            &format!(
                "git clone {} {}",
                shell_quote(repo_url),
                shell_quote(&self.repo_dir)
            ),
            None,
            CLONE_TIMEOUT,
        )
        .await?;

        let configure = format!(
            "git config user.name {} && git config user.email {} && git config credential.helper {}",
            shell_quote(BOT_NAME),
            shell_quote(BOT_EMAIL),
            shell_quote(CREDENTIAL_HELPER),
        );
        self.run("config", &configure, Some(&self.repo_dir), COMMAND_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Branch the checkout currently sits on (the clone default).
    pub async fn current_branch(&self) -> Result<String> {
        let output = self
            .run(
                "symbolic-ref",
                "git symbolic-ref --short HEAD",
                Some(&self.repo_dir),
                COMMAND_TIMEOUT,
            )
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    pub async fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run(
            "checkout",
            &format!("git checkout {}", shell_quote(branch)),
            Some(&self.repo_dir),
            COMMAND_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn create_branch(&self, branch: &str) -> Result<()> {
        self.run(
            "branch",
            &format!("git checkout -b {}", shell_quote(branch)),
            Some(&self.repo_dir),
            COMMAND_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn has_changes(&self) -> Result<bool> {
        let output = self
            .run(
                "status",
                "git status --porcelain",
                Some(&self.repo_dir),
                COMMAND_TIMEOUT,
            )
            .await?;
        Ok(!output.stdout.trim().is_empty())
    }

    pub async fn commit_all(&self, message: &str) -> Result<()> {
        self.run(
            "commit",
            &format!("git add -A && git commit -m {}", shell_quote(message)),
            Some(&self.repo_dir),
            COMMAND_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Push the branch, classifying the failure mode.
    ///
    /// Permission denial returns `Ok(PermissionDenied)`; any other failure is
    /// a hard error.
    pub async fn push(&self, branch: &str) -> Result<PushOutcome> {
        let output = self
            .provider
            .run_command(
                self.handle,
                &format!("git push -u origin {}", shell_quote(branch)),
                Some(&self.repo_dir),
                &self.env,
                PUSH_TIMEOUT,
            )
            .await?;

        if output.success() {
            return Ok(PushOutcome::Pushed);
        }

        if is_permission_denied(&output.stderr) {
            info!("Push denied by remote; changes remain unpublished");
            return Ok(PushOutcome::PermissionDenied);
        }

        Err(GitError::CommandFailed {
            op: "push",
            detail: truncate(&output.stderr, 400),
        })
    }
}

/// Deterministic feature branch name derived from the task.
pub fn feature_branch_name(task_id: &str, prompt: &str) -> String {
    let slug: String = prompt
        .to_lowercase()
        .split_whitespace()
        .take(4)
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .take(40)
        .collect();

    let short_id = task_id
        .trim_start_matches("task_")
        .chars()
        .take(8)
        .collect::<String>();

    if slug.is_empty() {
        format!("maestro/{}", short_id)
    } else {
        format!("maestro/{}-{}", slug, short_id)
    }
}

/// First line of the prompt, truncated, as the commit subject.
pub fn commit_message(prompt: &str) -> String {
    let subject = prompt.lines().next().unwrap_or("").trim();
    truncate(subject, 72)
}

fn is_permission_denied(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    ["permission denied", "403", "not authorized", "access denied", "protected branch"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.trim().to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", s[..end].trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        CommandOutput, DetachedCommand, Result as ProviderResult, SandboxConfig,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct GitMock {
        commands: Mutex<Vec<String>>,
        envs: Mutex<Vec<HashMap<String, String>>>,
        changes: bool,
        push_stderr: Option<&'static str>,
    }

    #[async_trait]
    impl SandboxProvider for GitMock {
        fn name(&self) -> &str {
            "git-mock"
        }

        async fn is_available(&self) -> ProviderResult<bool> {
            Ok(true)
        }

        async fn create(&self, _config: &SandboxConfig) -> ProviderResult<SandboxHandle> {
            Ok(handle())
        }

        async fn connect(&self, sandbox_id: &str) -> ProviderResult<SandboxHandle> {
            Ok(SandboxHandle {
                id: sandbox_id.to_string(),
                provider: "git-mock".to_string(),
            })
        }

        async fn run_command(
            &self,
            _handle: &SandboxHandle,
            command: &str,
            _cwd: Option<&str>,
            env: &HashMap<String, String>,
            _timeout: Duration,
        ) -> ProviderResult<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            self.envs.lock().unwrap().push(env.clone());

            if command.contains("git push") {
                if let Some(stderr) = self.push_stderr {
                    return Ok(CommandOutput {
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: stderr.to_string(),
                    });
                }
            }

            let stdout = if command.contains("git status --porcelain") && self.changes {
                "?? src/new.rs\n".to_string()
            } else {
                String::new()
            };
            Ok(CommandOutput {
                exit_code: 0,
                stdout,
                stderr: String::new(),
            })
        }

        async fn start_detached(
            &self,
            _handle: &SandboxHandle,
            _command: &str,
            _cwd: Option<&str>,
            _env: &HashMap<String, String>,
        ) -> ProviderResult<DetachedCommand> {
            Err(ProviderError::NotSupported("start_detached".to_string()))
        }

        async fn request_cancel(
            &self,
            _handle: &SandboxHandle,
            _exec_id: &str,
        ) -> ProviderResult<()> {
            Ok(())
        }

        async fn shutdown(&self, _sandbox_id: &str) -> ProviderResult<()> {
            Ok(())
        }
    }

    fn handle() -> SandboxHandle {
        SandboxHandle {
            id: "sbx_git".to_string(),
            provider: "git-mock".to_string(),
        }
    }

    #[tokio::test]
    async fn test_clone_configures_bot_identity_and_helper() {
        let provider = GitMock::default();
        let h = handle();
        let git = GitWorkspace::new(&provider, &h, "/workspace/repo", Some("tok_secret"));

        git.clone_repo("https://github.com/acme/api").await.unwrap();

        let commands = provider.commands.lock().unwrap();
        assert!(commands[0].contains("git clone 'https://github.com/acme/api' '/workspace/repo'"));
        assert!(commands[1].contains("git config user.name 'maestro-bot'"));
        assert!(commands[1].contains("credential.helper"));
        // The token travels through the exec environment only.
        for command in commands.iter() {
            assert!(!command.contains("tok_secret"));
        }
        for env in provider.envs.lock().unwrap().iter() {
            assert_eq!(env.get("GIT_TOKEN").map(String::as_str), Some("tok_secret"));
        }
    }

    #[tokio::test]
    async fn test_has_changes_reads_porcelain_status() {
        let clean = GitMock::default();
        let h = handle();
        let git = GitWorkspace::new(&clean, &h, "/workspace/repo", None);
        assert!(!git.has_changes().await.unwrap());

        let dirty = GitMock {
            changes: true,
            ..Default::default()
        };
        let git = GitWorkspace::new(&dirty, &h, "/workspace/repo", None);
        assert!(git.has_changes().await.unwrap());
    }

    #[tokio::test]
    async fn test_push_success() {
        let provider = GitMock::default();
        let h = handle();
        let git = GitWorkspace::new(&provider, &h, "/workspace/repo", None);
        assert_eq!(git.push("maestro/branch").await.unwrap(), PushOutcome::Pushed);
    }

    #[tokio::test]
    async fn test_push_permission_denied_is_soft() {
        let provider = GitMock {
            push_stderr: Some("remote: Permission denied to maestro-bot"),
            ..Default::default()
        };
        let h = handle();
        let git = GitWorkspace::new(&provider, &h, "/workspace/repo", None);
        assert_eq!(
            git.push("maestro/branch").await.unwrap(),
            PushOutcome::PermissionDenied
        );
    }

    #[tokio::test]
    async fn test_push_other_failure_is_hard() {
        let provider = GitMock {
            push_stderr: Some("fatal: unable to access remote"),
            ..Default::default()
        };
        let h = handle();
        let git = GitWorkspace::new(&provider, &h, "/workspace/repo", None);
        assert!(matches!(
            git.push("maestro/branch").await,
            Err(GitError::CommandFailed { op: "push", .. })
        ));
    }

    #[tokio::test]
    async fn test_commit_quotes_message() {
        let provider = GitMock::default();
        let h = handle();
        let git = GitWorkspace::new(&provider, &h, "/workspace/repo", None);
        git.commit_all("Add login page").await.unwrap();

        let commands = provider.commands.lock().unwrap();
        assert!(commands
            .last()
            .unwrap()
            .contains("git commit -m 'Add login page'"));
    }

    #[test]
    fn test_feature_branch_name_is_deterministic() {
        let name = feature_branch_name("task_abc12345ff", "Fix the login bug now please");
        assert_eq!(name, "maestro/fix-the-login-bug-abc12345");
        assert_eq!(
            name,
            feature_branch_name("task_abc12345ff", "Fix the login bug now please")
        );
    }

    #[test]
    fn test_feature_branch_name_empty_prompt() {
        assert_eq!(feature_branch_name("task_deadbeef00", "???"), "maestro/deadbeef");
    }

    #[test]
    fn test_commit_message_takes_first_line() {
        assert_eq!(commit_message("Add login page\nwith details"), "Add login page");
        assert_eq!(commit_message(&"x".repeat(100)).chars().count(), 73);
    }

    #[test]
    fn test_permission_denied_classification() {
        assert!(is_permission_denied("remote: Permission denied to user"));
        assert!(is_permission_denied("HTTP 403 returned"));
        assert!(is_permission_denied("refusing: protected branch main"));
        assert!(!is_permission_denied("fatal: could not resolve host"));
        assert!(!is_permission_denied("! [rejected] non-fast-forward"));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[test]
    fn test_credential_helper_never_embeds_token() {
        // The helper resolves $GIT_TOKEN from the exec environment.
        assert!(CREDENTIAL_HELPER.contains("$GIT_TOKEN"));
    }
}
