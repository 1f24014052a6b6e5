// ABOUTME: Agent execution engine for the Maestro orchestrator
// ABOUTME: Runs coding agent CLIs detached inside sandboxes with polling supervision

pub mod executor;

pub use executor::{
    AgentExecutionResult, EngineConfig, EngineError, ExecutionEngine, ExecutionRequest, Result,
};
