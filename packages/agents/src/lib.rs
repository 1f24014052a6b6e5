// ABOUTME: Coding agent CLI variants for the Maestro orchestrator
// ABOUTME: Invocation assembly, output parsing and credential resolution per agent

use thiserror::Error;

pub mod credentials;
pub mod parser;
pub mod types;

pub use credentials::{resolve_credentials, Credentials};
pub use parser::{extract_session_id, parse_output, Completion};
pub use types::AgentKind;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Unknown agent: {0}")]
    Unknown(String),

    #[error("Missing credentials: set {0}")]
    MissingCredentials(&'static str),
}
