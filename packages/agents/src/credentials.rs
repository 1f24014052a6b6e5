// ABOUTME: Agent credential resolution
// ABOUTME: User-provided keys override the process environment; missing keys are fatal config errors

use std::collections::HashMap;

use crate::{AgentError, AgentKind};

/// A resolved agent credential.
///
/// The value is intentionally unreadable through `Debug` so it can never
/// leak through error messages or log formatting.
#[derive(Clone)]
pub struct Credentials {
    env_key: &'static str,
    value: String,
}

impl Credentials {
    pub fn env_key(&self) -> &'static str {
        self.env_key
    }

    /// Environment map entry handed to sandbox execs.
    pub fn to_env(&self) -> HashMap<String, String> {
        HashMap::from([(self.env_key.to_string(), self.value.clone())])
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("env_key", &self.env_key)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Resolve credentials for an agent: a user-provided key wins over the
/// process environment default. Missing credentials are a configuration
/// error surfaced before any sandbox exists, never retried.
pub fn resolve_credentials(
    kind: AgentKind,
    user_key: Option<&str>,
) -> Result<Credentials, AgentError> {
    let env_key = kind.env_key();

    let value = match user_key.filter(|k| !k.is_empty()) {
        Some(key) => key.to_string(),
        None => std::env::var(env_key)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(AgentError::MissingCredentials(env_key))?,
    };

    Ok(Credentials { env_key, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_key_wins() {
        let creds = resolve_credentials(AgentKind::ClaudeCode, Some("user-key")).unwrap();
        assert_eq!(creds.env_key(), "ANTHROPIC_API_KEY");
        assert_eq!(
            creds.to_env().get("ANTHROPIC_API_KEY").map(String::as_str),
            Some("user-key")
        );
    }

    #[test]
    fn test_empty_user_key_falls_through() {
        // An empty user key is treated as absent; with no env fallback for a
        // key nobody sets in CI, resolution must fail.
        std::env::remove_var("CURSOR_API_KEY");
        let result = resolve_credentials(AgentKind::Cursor, Some(""));
        assert!(matches!(
            result,
            Err(AgentError::MissingCredentials("CURSOR_API_KEY"))
        ));
    }

    #[test]
    fn test_debug_redacts_value() {
        let creds = resolve_credentials(AgentKind::ClaudeCode, Some("sk-secret")).unwrap();
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
