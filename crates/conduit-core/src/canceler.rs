//! Build cancellation cascade.
//!
//! Cancelling a build writes its terminal status with an optimistic update
//! first. Only if that write wins does the cascade continue: signal the
//! scheduler, report commit status, close out stages and tasks, publish an
//! event, send a webhook. Every step after the first is best-effort and
//! logged on failure.

use crate::errors::StoreError;
use crate::model::{now, Build, Repo, Stage, Status, EXIT_CODE_CANCELLED};
use crate::pubsub::{Message, Pubsub};
use crate::scheduler::Scheduler;
use crate::status::{StatusInput, StatusSender};
use crate::store::{BuildStore, StageStore, TaskStore, UserStore};
use crate::webhook::{WebhookData, WebhookSender};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CancelerError {
    /// The build row could not be updated; nothing else was touched.
    #[error("cannot update build: {0}")]
    Persist(#[source] StoreError),

    #[error("cannot list incomplete builds: {0}")]
    List(#[source] StoreError),
}

impl CancelerError {
    /// True when the build changed underneath the cancellation.
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Self::Persist(e) if e.is_optimistic_lock())
    }
}

/// True when `older` is an incomplete build made redundant by `newer`.
pub fn supersedes(newer: &Build, older: &Build) -> bool {
    newer.repo_id == older.repo_id
        && newer.id != older.id
        && older.number < newer.number
        && newer.event == older.event
        && newer.git_ref == older.git_ref
}

pub struct Canceler {
    pub builds: Arc<dyn BuildStore>,
    pub stages: Arc<dyn StageStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub users: Arc<dyn UserStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub status: Arc<dyn StatusSender>,
    pub events: Arc<dyn Pubsub>,
    pub webhook: Arc<dyn WebhookSender>,
}

impl Canceler {
    /// Cancel a build, marking in-flight work `Killed`.
    ///
    /// On success `build` holds the persisted row. A build that already
    /// finished is left alone.
    pub async fn cancel(&self, repo: &Repo, build: &mut Build) -> Result<(), CancelerError> {
        self.cancel_with(repo, build, Status::Killed).await
    }

    /// Skip every older incomplete push or pull request build on the same ref.
    ///
    /// Builds for other events are never touched. Individual failures and
    /// panics are logged and do not fail the call.
    pub async fn cancel_pending(&self, repo: &Repo, build: &Build) -> Result<(), CancelerError> {
        if !build.event.is_supersedable() {
            return Ok(());
        }

        let incomplete = self
            .builds
            .list_incomplete(repo.id)
            .await
            .map_err(CancelerError::List)?;

        let sweep = async {
            for mut older in incomplete.into_iter().filter(|b| supersedes(build, b)) {
                debug!(build = older.id, superseded_by = build.id, "skipping superseded build");
                if let Err(e) = self.cancel_with(repo, &mut older, Status::Skipped).await {
                    warn!(build = older.id, error = %e, "cannot skip superseded build");
                }
            }
        };
        if AssertUnwindSafe(sweep).catch_unwind().await.is_err() {
            let trace = std::backtrace::Backtrace::force_capture();
            error!(build = build.id, backtrace = %trace, "panic while cancelling pending builds");
        }
        Ok(())
    }

    async fn cancel_with(
        &self,
        repo: &Repo,
        build: &mut Build,
        status: Status,
    ) -> Result<(), CancelerError> {
        if !matches!(build.status, Status::Pending | Status::Running) {
            return Ok(());
        }

        let stamp = now();
        let mut updated = build.clone();
        updated.status = status;
        updated.stopped = stamp;
        if updated.started == 0 {
            updated.started = stamp;
        }
        self.builds
            .update_build(&mut updated)
            .await
            .map_err(CancelerError::Persist)?;
        *build = updated;
        info!(repo = %repo.slug, build = build.id, status = %status, "build cancelled");

        if let Err(e) = self.scheduler.cancel(build.id).await {
            warn!(build = build.id, error = %e, "cannot signal scheduler");
        }

        match self.users.find_user(repo.user_id).await {
            Ok(user) => {
                if let Err(e) = self.status.send(&user, StatusInput { repo, build }).await {
                    warn!(build = build.id, error = %e, "cannot update commit status");
                }
            }
            Err(e) => warn!(build = build.id, user = repo.user_id, error = %e, "cannot find repository owner"),
        }

        let stages = match self.stages.list_stages(build.id).await {
            Ok(stages) => self.close_stages(build, stages, stamp).await,
            Err(e) => {
                warn!(build = build.id, error = %e, "cannot list stages");
                Vec::new()
            }
        };

        match Message::build_event(repo, build, &stages) {
            Ok(message) => {
                if let Err(e) = self.events.publish(message).await {
                    warn!(build = build.id, error = %e, "cannot publish cancellation");
                }
            }
            Err(e) => warn!(build = build.id, error = %e, "cannot encode cancellation event"),
        }

        if let Err(e) = self.webhook.send(&WebhookData::build_updated(repo, build)).await {
            warn!(build = build.id, error = %e, "cannot send webhook");
        }
        Ok(())
    }

    /// Mark unfinished stages and tasks `Killed` (started) or `Skipped` (not started).
    async fn close_stages(&self, build: &Build, mut stages: Vec<Stage>, stamp: i64) -> Vec<Stage> {
        for stage in &mut stages {
            if stage.is_done() {
                continue;
            }
            let mut tasks = std::mem::take(&mut stage.tasks);

            stage.status = cancelled_status(&mut stage.started, stamp);
            stage.stopped = stamp;
            if let Err(e) = self.stages.update_stage(stage).await {
                warn!(build = build.id, stage = stage.id, error = %e, "cannot update stage");
            }

            for task in tasks.iter_mut().filter(|t| !t.is_done()) {
                task.status = cancelled_status(&mut task.started, stamp);
                task.stopped = stamp;
                task.exit_code = EXIT_CODE_CANCELLED;
                if let Err(e) = self.tasks.update_task(task).await {
                    warn!(build = build.id, task = task.id, error = %e, "cannot update task");
                }
            }
            stage.tasks = tasks;
        }
        stages
    }
}

/// `Killed` if work started, else `Skipped` with `started` stamped.
fn cancelled_status(started: &mut i64, stamp: i64) -> Status {
    if *started != 0 {
        Status::Killed
    } else {
        *started = stamp;
        Status::Skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Event;

    fn build(id: i64, number: i64, event: Event, git_ref: &str) -> Build {
        Build {
            id,
            repo_id: 1,
            number,
            event,
            git_ref: git_ref.into(),
            ..Default::default()
        }
    }

    #[test]
    fn supersedes_requires_same_ref_and_event() {
        let newer = build(10, 5, Event::Push, "refs/heads/main");
        assert!(supersedes(&newer, &build(9, 4, Event::Push, "refs/heads/main")));
        assert!(!supersedes(&newer, &build(9, 4, Event::Push, "refs/heads/dev")));
        assert!(!supersedes(
            &newer,
            &build(9, 4, Event::PullRequest, "refs/heads/main")
        ));
        assert!(!supersedes(&newer, &build(11, 6, Event::Push, "refs/heads/main")));
        assert!(!supersedes(&newer, &newer));
    }

    #[test]
    fn cancelled_status_stamps_unstarted_work() {
        let mut started = 0;
        assert_eq!(cancelled_status(&mut started, 42), Status::Skipped);
        assert_eq!(started, 42);

        let mut started = 7;
        assert_eq!(cancelled_status(&mut started, 42), Status::Killed);
        assert_eq!(started, 7);
    }
}
