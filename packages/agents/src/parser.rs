// ABOUTME: Structured completion detection for agent CLI output
// ABOUTME: Parses stream-json result events and extracts resumable session ids

use serde_json::Value;
use tracing::debug;

use crate::AgentKind;

/// Structured completion marker found in agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub success: bool,
    pub session_id: Option<String>,
}

/// Scan an output buffer for the agent's completion marker.
///
/// Agents without structured output never produce a marker; their runs end
/// with process exit instead, which the execution engine observes directly.
pub fn parse_output(kind: AgentKind, buffer: &str) -> Option<Completion> {
    match kind {
        AgentKind::ClaudeCode | AgentKind::Cursor => parse_stream_json(buffer),
        AgentKind::Codex => parse_codex_events(buffer),
        AgentKind::GeminiCli | AgentKind::Opencode => None,
    }
}

/// Extract a resumable session id even when no completion marker has been
/// seen yet (init events carry it from the first line).
pub fn extract_session_id(kind: AgentKind, buffer: &str) -> Option<String> {
    for line in buffer.lines() {
        let Some(json) = parse_json_line(line) else {
            continue;
        };
        let key = match kind {
            AgentKind::Codex => "thread_id",
            _ => "session_id",
        };
        if let Some(id) = json.get(key).and_then(|v| v.as_str()) {
            return Some(id.to_string());
        }
    }
    None
}

/// Claude-style stream-json: one JSON object per line, terminal event has
/// `"type": "result"`.
fn parse_stream_json(buffer: &str) -> Option<Completion> {
    for line in buffer.lines() {
        let Some(json) = parse_json_line(line) else {
            continue;
        };
        if json.get("type").and_then(|t| t.as_str()) != Some("result") {
            continue;
        }

        let is_error = json
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or_else(|| {
                json.get("subtype").and_then(|s| s.as_str()) != Some("success")
            });
        let session_id = json
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        debug!(success = !is_error, "Found result event in agent output");
        return Some(Completion {
            success: !is_error,
            session_id,
        });
    }
    None
}

/// Codex exec --json: the run ends with a `turn.completed` event; the
/// resumable id arrives on `thread.started`.
fn parse_codex_events(buffer: &str) -> Option<Completion> {
    let mut thread_id = None;
    for line in buffer.lines() {
        let Some(json) = parse_json_line(line) else {
            continue;
        };
        match json.get("type").and_then(|t| t.as_str()) {
            Some("thread.started") => {
                thread_id = json
                    .get("thread_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
            }
            Some("turn.completed") => {
                return Some(Completion {
                    success: true,
                    session_id: thread_id,
                });
            }
            Some("turn.failed") | Some("error") => {
                return Some(Completion {
                    success: false,
                    session_id: thread_id,
                });
            }
            _ => {}
        }
    }
    None
}

fn parse_json_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_result_success() {
        let buffer = concat!(
            "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"sess_abc\"}\n",
            "{\"type\":\"assistant\",\"message\":{}}\n",
            "{\"type\":\"result\",\"subtype\":\"success\",\"is_error\":false,\"session_id\":\"sess_abc\"}\n",
        );

        let completion = parse_output(AgentKind::ClaudeCode, buffer).unwrap();
        assert!(completion.success);
        assert_eq!(completion.session_id.as_deref(), Some("sess_abc"));
    }

    #[test]
    fn test_claude_result_error() {
        let buffer = "{\"type\":\"result\",\"subtype\":\"error_max_turns\",\"is_error\":true}\n";
        let completion = parse_output(AgentKind::ClaudeCode, buffer).unwrap();
        assert!(!completion.success);
    }

    #[test]
    fn test_no_marker_yet() {
        let buffer = "{\"type\":\"assistant\",\"message\":{}}\npartial text\n";
        assert!(parse_output(AgentKind::ClaudeCode, buffer).is_none());
    }

    #[test]
    fn test_codex_turn_completed() {
        let buffer = concat!(
            "{\"type\":\"thread.started\",\"thread_id\":\"thr_9\"}\n",
            "{\"type\":\"item.completed\",\"item\":{}}\n",
            "{\"type\":\"turn.completed\",\"usage\":{}}\n",
        );

        let completion = parse_output(AgentKind::Codex, buffer).unwrap();
        assert!(completion.success);
        assert_eq!(completion.session_id.as_deref(), Some("thr_9"));
    }

    #[test]
    fn test_codex_turn_failed() {
        let buffer = "{\"type\":\"turn.failed\",\"error\":{\"message\":\"overloaded\"}}\n";
        let completion = parse_output(AgentKind::Codex, buffer).unwrap();
        assert!(!completion.success);
    }

    #[test]
    fn test_plain_text_agents_have_no_marker() {
        let buffer = "Done! I made the changes you asked for.\n";
        assert!(parse_output(AgentKind::GeminiCli, buffer).is_none());
        assert!(parse_output(AgentKind::Opencode, buffer).is_none());
    }

    #[test]
    fn test_session_id_extraction_before_completion() {
        let buffer = "{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"sess_early\"}\n";
        assert_eq!(
            extract_session_id(AgentKind::ClaudeCode, buffer).as_deref(),
            Some("sess_early")
        );
        assert!(extract_session_id(AgentKind::ClaudeCode, "plain output").is_none());
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let buffer = "npm WARN deprecated\n{not json}\n{\"type\":\"result\",\"is_error\":false}\n";
        assert!(parse_output(AgentKind::ClaudeCode, buffer).unwrap().success);
    }
}
