// ABOUTME: Coding agent variant definitions
// ABOUTME: Install commands, CLI invocation assembly and credential env keys per agent

use serde::{Deserialize, Serialize};

use crate::AgentError;

/// Supported coding agent CLIs.
///
/// Each variant carries its full capability set (install command, execute
/// command, output parser) so call sites never branch on agent names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    ClaudeCode,
    Codex,
    Cursor,
    GeminiCli,
    Opencode,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
            Self::Cursor => "cursor",
            Self::GeminiCli => "gemini-cli",
            Self::Opencode => "opencode",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, AgentError> {
        match s {
            "claude-code" => Ok(Self::ClaudeCode),
            "codex" => Ok(Self::Codex),
            "cursor" => Ok(Self::Cursor),
            "gemini-cli" => Ok(Self::GeminiCli),
            "opencode" => Ok(Self::Opencode),
            _ => Err(AgentError::Unknown(s.to_string())),
        }
    }

    /// Idempotent bootstrap command run inside the sandbox before execution.
    pub fn install_command(&self) -> &'static str {
        match self {
            Self::ClaudeCode => {
                "command -v claude >/dev/null 2>&1 || npm install -g @anthropic-ai/claude-code"
            }
            Self::Codex => "command -v codex >/dev/null 2>&1 || npm install -g @openai/codex",
            Self::Cursor => {
                "command -v cursor-agent >/dev/null 2>&1 || curl -fsS https://cursor.com/install | bash"
            }
            Self::GeminiCli => {
                "command -v gemini >/dev/null 2>&1 || npm install -g @google/gemini-cli"
            }
            Self::Opencode => {
                "command -v opencode >/dev/null 2>&1 || npm install -g opencode-ai"
            }
        }
    }

    /// Environment variable carrying the agent credential. Credentials are
    /// always delivered through the exec environment, never on the command
    /// line.
    pub fn env_key(&self) -> &'static str {
        match self {
            Self::ClaudeCode | Self::Opencode => "ANTHROPIC_API_KEY",
            Self::Codex => "OPENAI_API_KEY",
            Self::Cursor => "CURSOR_API_KEY",
            Self::GeminiCli => "GEMINI_API_KEY",
        }
    }

    /// Whether the CLI can resume a prior conversational session.
    pub fn supports_resume(&self) -> bool {
        matches!(self, Self::ClaudeCode | Self::Cursor | Self::Opencode)
    }

    /// Assemble the full execute command for an instruction.
    pub fn command(
        &self,
        instruction: &str,
        model: Option<&str>,
        resume_session: Option<&str>,
    ) -> String {
        let quoted = shell_quote(instruction);
        let resume = resume_session.filter(|_| self.supports_resume());

        match self {
            Self::ClaudeCode => {
                let mut cmd = String::from(
                    "claude -p --output-format stream-json --verbose --dangerously-skip-permissions",
                );
                if let Some(model) = model {
                    cmd.push_str(&format!(" --model {}", shell_quote(model)));
                }
                if let Some(session) = resume {
                    cmd.push_str(&format!(" --resume {}", shell_quote(session)));
                }
                cmd.push_str(&format!(" {}", quoted));
                cmd
            }
            Self::Codex => {
                let mut cmd = String::from("codex exec --json --full-auto");
                if let Some(model) = model {
                    cmd.push_str(&format!(" --model {}", shell_quote(model)));
                }
                cmd.push_str(&format!(" {}", quoted));
                cmd
            }
            Self::Cursor => {
                let mut cmd = String::from("cursor-agent -p --output-format stream-json --force");
                if let Some(model) = model {
                    cmd.push_str(&format!(" --model {}", shell_quote(model)));
                }
                if let Some(session) = resume {
                    cmd.push_str(&format!(" --resume {}", shell_quote(session)));
                }
                cmd.push_str(&format!(" {}", quoted));
                cmd
            }
            Self::GeminiCli => {
                let mut cmd = String::from("gemini --yolo");
                if let Some(model) = model {
                    cmd.push_str(&format!(" --model {}", shell_quote(model)));
                }
                cmd.push_str(&format!(" -p {}", quoted));
                cmd
            }
            Self::Opencode => {
                let mut cmd = String::from("opencode run --print-logs");
                if let Some(model) = model {
                    cmd.push_str(&format!(" --model {}", shell_quote(model)));
                }
                if let Some(session) = resume {
                    cmd.push_str(&format!(" --session {}", shell_quote(session)));
                }
                cmd.push_str(&format!(" {}", quoted));
                cmd
            }
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for kind in [
            AgentKind::ClaudeCode,
            AgentKind::Codex,
            AgentKind::Cursor,
            AgentKind::GeminiCli,
            AgentKind::Opencode,
        ] {
            assert_eq!(AgentKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(AgentKind::from_str("copilot").is_err());
    }

    #[test]
    fn test_install_commands_are_idempotent() {
        for kind in [
            AgentKind::ClaudeCode,
            AgentKind::Codex,
            AgentKind::Cursor,
            AgentKind::GeminiCli,
            AgentKind::Opencode,
        ] {
            assert!(kind.install_command().starts_with("command -v "));
        }
    }

    #[test]
    fn test_command_includes_model_only_when_given() {
        let with = AgentKind::ClaudeCode.command("fix the bug", Some("claude-sonnet-4-5"), None);
        assert!(with.contains("--model 'claude-sonnet-4-5'"));

        let without = AgentKind::ClaudeCode.command("fix the bug", None, None);
        assert!(!without.contains("--model"));
    }

    #[test]
    fn test_resume_ignored_for_unsupported_agents() {
        let cmd = AgentKind::Codex.command("fix the bug", None, Some("sess_1"));
        assert!(!cmd.contains("sess_1"));

        let cmd = AgentKind::ClaudeCode.command("fix the bug", None, Some("sess_1"));
        assert!(cmd.contains("--resume 'sess_1'"));
    }

    #[test]
    fn test_instruction_is_quoted() {
        let cmd = AgentKind::ClaudeCode.command("don't break", None, None);
        assert!(cmd.ends_with("'don'\"'\"'t break'"));
    }
}
