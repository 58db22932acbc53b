//! Execution backend contract.
//!
//! An [`Engine`] starts, observes and destroys isolated execution units
//! ("steps"). Every backend (native processes here, container runtimes
//! elsewhere) implements the same operations, and callers never see
//! backend-specific types.
//!
//! All operations are futures: dropping one cancels the call. `wait` blocks
//! until the step exits; time limits are imposed by the caller.

pub mod native;

use crate::pipeline::{Config, Step};
use crate::runner::Work;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Interleaved stdout/stderr of one step. Reading past the step's exit yields
/// end-of-stream.
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Outcome of a finished step, produced once per successful `wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct State {
    pub exit_code: i32,
    pub exited: bool,
    pub oom_killed: bool,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation on a step that was never passed to `exec` (or already reaped).
    #[error("step {step:?} was not executed")]
    NotExecuted { step: String },

    #[error("step {step:?} already exists")]
    AlreadyExists { step: String },

    #[error("step {step:?}: command {command:?} not found")]
    CommandNotFound { step: String, command: String },

    #[error("step {step:?}: cannot start process: {source}")]
    Spawn {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine error: {0}")]
    Backend(String),
}

impl EngineError {
    pub fn is_not_executed(&self) -> bool {
        matches!(self, Self::NotExecuted { .. })
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Prepare shared resources (declared volumes, networks). Called once per config.
    async fn setup(&self, config: &Config) -> Result<(), EngineError>;

    /// Start a step without waiting for it.
    async fn exec(&self, step: &Step) -> Result<(), EngineError>;

    /// Best-effort immediate termination of a running step.
    async fn kill(&self, step: &Step) -> Result<(), EngineError>;

    /// Block until the step exits.
    async fn wait(&self, step: &Step) -> Result<State, EngineError>;

    /// Stream the step's combined output.
    async fn tail(&self, step: &Step) -> Result<LogStream, EngineError>;

    /// Tear down everything `setup` and `exec` created, including steps never waited on.
    async fn destroy(&self, config: &Config) -> Result<(), EngineError>;
}

/// Builds the engine client used for a single run.
pub trait EngineFactory: Send + Sync {
    fn create(&self, work: &Work) -> Result<Arc<dyn Engine>, EngineError>;
}
