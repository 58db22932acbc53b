//! Commit status integration.

use crate::model::{Build, Repo, User};
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("commit status update failed: {0}")]
    Remote(String),
}

#[derive(Debug, Clone, Copy)]
pub struct StatusInput<'a> {
    pub repo: &'a Repo,
    pub build: &'a Build,
}

#[async_trait]
pub trait StatusSender: Send + Sync {
    /// Report the build status to the source host using `user`'s credentials.
    async fn send(&self, user: &User, input: StatusInput<'_>) -> Result<(), StatusError>;
}

/// Sender for deployments without a source host integration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatus;

#[async_trait]
impl StatusSender for NoopStatus {
    async fn send(&self, user: &User, input: StatusInput<'_>) -> Result<(), StatusError> {
        debug!(
            user = %user.login,
            repo = %input.repo.slug,
            build = input.build.id,
            status = %input.build.status,
            "commit status not sent: no integration configured"
        );
        Ok(())
    }
}
