//! Typed error hierarchy for pairloop.
//!
//! Three enums cover the three layers:
//! - `DecodeError`: one malformed line of agent protocol output
//! - `RunnerError`: a single agent subprocess session
//! - `OrchestratorError`: the developer/reviewer loop as a whole

use std::time::Duration;

use thiserror::Error;

use crate::signals::Role;

/// A protocol line that could not be decoded as JSON.
#[derive(Debug, Error)]
#[error("Failed to decode agent output line: {source}")]
pub struct DecodeError {
    /// The offending line, verbatim.
    pub line: String,
    #[source]
    pub source: serde_json::Error,
}

/// Errors from launching or supervising one agent subprocess.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Agent binary '{binary}' not found on PATH")]
    BinaryNotFound { binary: String },

    #[error("Failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Agent exited with non-zero code {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Agent session was canceled")]
    Canceled,

    #[error("Agent session exceeded its deadline of {timeout:?}")]
    DeadlineExceeded { timeout: Duration },

    #[error("I/O error while reading agent output: {0}")]
    Io(#[source] std::io::Error),
}

impl RunnerError {
    /// Cancellation-class errors must halt the run instead of being retried.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded { .. })
    }
}

/// Errors that stop the developer/reviewer loop.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Plan {id} not found")]
    PlanNotFound { id: i64 },

    #[error("Run was canceled")]
    Canceled,

    #[error("{role} turn failed: {source}")]
    Turn {
        role: Role,
        #[source]
        source: RunnerError,
    },

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Canceled => true,
            Self::Turn { source, .. } => source.is_cancellation(),
            _ => false,
        }
    }
}
