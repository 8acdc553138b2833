//! Agent subprocess sessions.
//!
//! [`AgentRunner`] launches the agent CLI and exposes its decoded output as an
//! [`AgentSession`]. The orchestrator only depends on the [`AgentLauncher`]
//! and [`TurnStream`] traits, so tests can substitute scripted turns.

mod context;
mod session;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::RunnerError;
use crate::stream::StreamEvent;

pub use context::{
    ContextTracker, DEFAULT_CONTEXT_WINDOW, DEFAULT_THRESHOLD_PCT, context_window_for,
};
pub use session::{AgentRunner, AgentSession};

/// Everything needed to launch one turn.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub prompt: String,
    /// Extra `KEY=VALUE` pairs added to the agent's environment.
    pub env: Vec<(String, String)>,
}

/// Starts agent turns.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Launch a turn. `cancel` aborts the subprocess when triggered.
    async fn launch(
        &self,
        request: LaunchRequest,
        cancel: CancellationToken,
    ) -> Result<Box<dyn TurnStream>, RunnerError>;
}

/// A running turn: a finite, non-restartable event sequence plus an exit status.
#[async_trait]
pub trait TurnStream: Send {
    /// Next decoded event, or `None` once the stream has ended.
    async fn next_event(&mut self) -> Option<StreamEvent>;

    /// Ask the subprocess to stop early. Buffered events still drain.
    fn stop(&self);

    /// Wait for the subprocess to exit. Call after draining `next_event`.
    async fn wait(&mut self) -> Result<(), RunnerError>;
}
