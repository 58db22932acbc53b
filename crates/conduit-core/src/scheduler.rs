//! Scheduler signal used by the Canceler.

use crate::runner::{Runner, RunnerError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cancel signal failed: {0}")]
    Runner(#[from] RunnerError),
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Ask whoever runs `build_id` to stop it. Returning does not mean the
    /// work has stopped.
    async fn cancel(&self, build_id: i64) -> Result<(), SchedulerError>;
}

/// Forwards cancellation to an in-process [`Runner`].
pub struct LocalScheduler {
    runner: Arc<Runner>,
}

impl LocalScheduler {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    async fn cancel(&self, build_id: i64) -> Result<(), SchedulerError> {
        self.runner.cancel_build(build_id).await?;
        Ok(())
    }
}
