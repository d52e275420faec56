//! Execution error types

use thiserror::Error;

/// Errors raised while running commands inside a container
#[derive(Debug, Error)]
pub enum ExecError {
    /// The runtime refused to create or attach an exec session
    #[error("Failed to start exec session in {container}: {reason}")]
    SessionStart { container: String, reason: String },

    /// The attached channel failed before end-of-stream
    #[error("Exec stream failed: {0}")]
    Stream(String),

    /// The dialogue driver could not be launched
    #[error("Failed to spawn dialogue driver: {0}")]
    Spawn(#[source] std::io::Error),

    /// The dialogue driver exited without reaching end-of-session
    #[error("Dialogue did not complete (exit code {exit_code:?})")]
    DialogueMismatch { exit_code: Option<i32> },

    /// The command token list was empty
    #[error("Invalid exec request: {0}")]
    InvalidRequest(String),

    /// The identity cannot be placed in a dialogue script
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),
}

impl ExecError {
    pub(crate) fn session_start(container: &str, reason: impl std::fmt::Display) -> Self {
        ExecError::SessionStart {
            container: container.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::SessionStart { .. } => "session_start",
            ExecError::Stream(_) => "stream",
            ExecError::Spawn(_) => "spawn",
            ExecError::DialogueMismatch { .. } => "dialogue_mismatch",
            ExecError::InvalidRequest(_) => "invalid_request",
            ExecError::InvalidIdentity(_) => "invalid_identity",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
