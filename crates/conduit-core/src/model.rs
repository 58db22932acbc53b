//! Persisted entities: repositories, builds, stages and tasks.
//!
//! A [`Build`] owns ordered [`Stage`]s, a stage owns ordered [`Task`]s. Every row
//! carries a `version` used by the datastore for optimistic-concurrency updates,
//! and `started == 0` means "never started".

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exit code recorded on tasks that were cancelled (SIGINT convention).
pub const EXIT_CODE_CANCELLED: i32 = 130;

/// Exit code of a process terminated by SIGKILL.
pub const EXIT_CODE_SIGKILL: i32 = 128 + 9;

/// Exit code recorded on tasks forced to `Error` after an aborted run.
pub const EXIT_CODE_ABORTED: i32 = 255;

/// Current Unix timestamp in seconds.
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Error,
    Killed,
    Skipped,
}

impl Status {
    /// True for every terminal status.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            Status::Success | Status::Failure | Status::Error | Status::Killed | Status::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Error => "error",
            Status::Killed => "killed",
            Status::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    #[default]
    Push,
    PullRequest,
    Tag,
    Promote,
    Rollback,
    Cron,
    Custom,
}

impl Event {
    /// Events whose builds may be superseded by a newer build on the same ref.
    pub fn is_supersedable(self) -> bool {
        matches!(self, Event::Push | Event::PullRequest)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Repo {
    pub id: i64,
    /// Owner whose credentials are used for commit-status updates.
    pub user_id: i64,
    pub namespace: String,
    pub name: String,
    pub slug: String,
    pub visibility: Visibility,
    #[serde(default)]
    pub trusted: bool,
    /// Build timeout in minutes.
    pub timeout: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct User {
    pub id: i64,
    pub login: String,
    #[serde(skip_serializing)]
    pub token: String,
}

/// Machine credentials handed to the steps of one build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Netrc {
    pub machine: String,
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Build {
    pub id: i64,
    pub repo_id: i64,
    pub number: i64,
    pub event: Event,
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Target branch.
    pub target: String,
    pub status: Status,
    #[serde(default)]
    pub error: String,
    pub started: i64,
    pub stopped: i64,
    pub version: i64,
}

impl Build {
    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Stage {
    pub id: i64,
    pub build_id: i64,
    pub repo_id: i64,
    pub number: i64,
    pub name: String,
    pub status: Status,
    pub exit_code: i32,
    pub started: i64,
    pub stopped: i64,
    pub version: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Task>,
}

impl Stage {
    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }
}

/// Persisted, stateful view of one pipeline step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Task {
    pub id: i64,
    pub stage_id: i64,
    pub build_id: i64,
    pub number: i64,
    /// Matches the name of the pipeline step it executes.
    pub name: String,
    pub status: Status,
    #[serde(default)]
    pub error: String,
    pub exit_code: i32,
    pub started: i64,
    pub stopped: i64,
    pub version: i64,
}

impl Task {
    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    /// Wall-clock duration in seconds, zero when not both timestamps are set.
    pub fn duration(&self) -> i64 {
        if self.started == 0 || self.stopped == 0 {
            return 0;
        }
        (self.stopped - self.started).max(0)
    }
}
