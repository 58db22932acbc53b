//! Persist-then-publish state transitions used by the Runner.

use crate::engine::LogStream;
use crate::errors::StoreError;
use crate::model::{Build, Repo, Stage, Task};
use crate::pubsub::{Message, Pubsub};
use crate::store::{BuildStore, LogStore, StageStore, TaskStore};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::warn;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("persist failed: {0}")]
    Store(#[from] StoreError),

    #[error("cannot read log stream: {0}")]
    Logs(#[from] std::io::Error),
}

/// Every method persists first; an error means the transition is not
/// visible and the caller's run must stop.
#[async_trait]
pub trait Updater: Send + Sync {
    async fn set_build(&self, repo: &Repo, build: &mut Build) -> Result<(), UpdaterError>;

    async fn set_stage(&self, repo: &Repo, build: &Build, stage: &mut Stage)
        -> Result<(), UpdaterError>;

    async fn set_task(&self, repo: &Repo, build: &Build, task: &mut Task)
        -> Result<(), UpdaterError>;

    async fn set_logs(
        &self,
        repo: &Repo,
        build: &Build,
        task: &Task,
        logs: LogStream,
    ) -> Result<(), UpdaterError>;
}

/// [`Updater`] writing through the datastore and announcing on a bus.
///
/// Publish failures are logged; the row is already persisted by then.
pub struct StoreUpdater {
    builds: Arc<dyn BuildStore>,
    stages: Arc<dyn StageStore>,
    tasks: Arc<dyn TaskStore>,
    logs: Arc<dyn LogStore>,
    events: Arc<dyn Pubsub>,
}

impl StoreUpdater {
    pub fn new(
        builds: Arc<dyn BuildStore>,
        stages: Arc<dyn StageStore>,
        tasks: Arc<dyn TaskStore>,
        logs: Arc<dyn LogStore>,
        events: Arc<dyn Pubsub>,
    ) -> Self {
        Self {
            builds,
            stages,
            tasks,
            logs,
            events,
        }
    }

    async fn announce(&self, repo: &Repo, build: &Build) {
        let message = match Message::build_event(repo, build, &[]) {
            Ok(m) => m,
            Err(e) => {
                warn!(build = build.id, error = %e, "cannot encode build event");
                return;
            }
        };
        if let Err(e) = self.events.publish(message).await {
            warn!(build = build.id, error = %e, "failed to publish build event");
        }
    }
}

#[async_trait]
impl Updater for StoreUpdater {
    async fn set_build(&self, repo: &Repo, build: &mut Build) -> Result<(), UpdaterError> {
        self.builds.update_build(build).await?;
        self.announce(repo, build).await;
        Ok(())
    }

    async fn set_stage(
        &self,
        repo: &Repo,
        build: &Build,
        stage: &mut Stage,
    ) -> Result<(), UpdaterError> {
        self.stages.update_stage(stage).await?;
        self.announce(repo, build).await;
        Ok(())
    }

    async fn set_task(
        &self,
        repo: &Repo,
        build: &Build,
        task: &mut Task,
    ) -> Result<(), UpdaterError> {
        self.tasks.update_task(task).await?;
        self.announce(repo, build).await;
        Ok(())
    }

    async fn set_logs(
        &self,
        _repo: &Repo,
        _build: &Build,
        task: &Task,
        mut logs: LogStream,
    ) -> Result<(), UpdaterError> {
        let mut data = Vec::new();
        logs.read_to_end(&mut data).await?;
        self.logs.write_logs(task.id, data).await?;
        Ok(())
    }
}
