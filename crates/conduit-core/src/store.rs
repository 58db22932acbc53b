//! Datastore boundary.
//!
//! Row updates are conditional: an update carries the `version` the caller
//! read, succeeds only if the stored row still has that version, and bumps it
//! on both sides. A mismatch is [`StoreError::OptimisticLock`], which is how
//! the Runner and the Canceler arbitrate their races on the same rows.

use crate::errors::{StoreError, StoreResult};
use crate::model::{Build, Stage, Task, User};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn find_build(&self, id: i64) -> StoreResult<Build>;

    /// Pending and running builds of a repository, oldest first.
    async fn list_incomplete(&self, repo_id: i64) -> StoreResult<Vec<Build>>;

    /// Insert a build with its stages and their tasks, assigning ids.
    async fn create_build(&self, build: &mut Build, stages: &mut [Stage]) -> StoreResult<()>;

    async fn update_build(&self, build: &mut Build) -> StoreResult<()>;
}

#[async_trait]
pub trait StageStore: Send + Sync {
    /// Stages of a build in order, each with its tasks populated.
    async fn list_stages(&self, build_id: i64) -> StoreResult<Vec<Stage>>;

    /// Persist the stage row; `stage.tasks` is ignored.
    async fn update_stage(&self, stage: &mut Stage) -> StoreResult<()>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn find_task(&self, id: i64) -> StoreResult<Task>;

    async fn update_task(&self, task: &mut Task) -> StoreResult<()>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn write_logs(&self, task_id: i64, data: Vec<u8>) -> StoreResult<()>;

    async fn find_logs(&self, task_id: i64) -> StoreResult<Vec<u8>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: i64) -> StoreResult<User>;
}

#[derive(Default)]
struct Tables {
    next_id: i64,
    builds: BTreeMap<i64, Build>,
    stages: BTreeMap<i64, Stage>,
    tasks: BTreeMap<i64, Task>,
    logs: HashMap<i64, Vec<u8>>,
    users: HashMap<i64, User>,
}

impl Tables {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process datastore implementing every store trait.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

fn check_version(kind: &'static str, id: i64, stored: i64, given: i64) -> StoreResult<()> {
    if stored != given {
        return Err(StoreError::OptimisticLock { kind, id });
    }
    Ok(())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace a user.
    pub fn insert_user(&self, user: User) {
        self.lock().users.insert(user.id, user);
    }

    /// Stage rows of a build ordered by number, without their tasks.
    pub fn stages_of(&self, build_id: i64) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self
            .lock()
            .stages
            .values()
            .filter(|s| s.build_id == build_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.number);
        stages
    }

    /// All tasks of a build ordered by stage and task number.
    pub fn tasks_of(&self, build_id: i64) -> Vec<Task> {
        let tables = self.lock();
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| t.build_id == build_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| {
            let stage = tables.stages.get(&t.stage_id).map_or(0, |s| s.number);
            (stage, t.number)
        });
        tasks
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn find_build(&self, id: i64) -> StoreResult<Build> {
        self.lock()
            .builds
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "build", id })
    }

    async fn list_incomplete(&self, repo_id: i64) -> StoreResult<Vec<Build>> {
        let mut builds: Vec<Build> = self
            .lock()
            .builds
            .values()
            .filter(|b| b.repo_id == repo_id && !b.is_done())
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.number);
        Ok(builds)
    }

    async fn create_build(&self, build: &mut Build, stages: &mut [Stage]) -> StoreResult<()> {
        let mut tables = self.lock();
        build.id = tables.id();
        build.version = 1;
        if build.number == 0 {
            build.number = tables
                .builds
                .values()
                .filter(|b| b.repo_id == build.repo_id)
                .map(|b| b.number)
                .max()
                .unwrap_or(0)
                + 1;
        }
        for stage in stages.iter_mut() {
            stage.id = tables.id();
            stage.build_id = build.id;
            stage.repo_id = build.repo_id;
            stage.version = 1;
            for task in stage.tasks.iter_mut() {
                task.id = tables.id();
                task.stage_id = stage.id;
                task.build_id = build.id;
                task.version = 1;
                tables.tasks.insert(task.id, task.clone());
            }
            let mut row = stage.clone();
            row.tasks.clear();
            tables.stages.insert(row.id, row);
        }
        tables.builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn update_build(&self, build: &mut Build) -> StoreResult<()> {
        let mut tables = self.lock();
        let stored = tables.builds.get_mut(&build.id).ok_or(StoreError::NotFound {
            kind: "build",
            id: build.id,
        })?;
        check_version("build", build.id, stored.version, build.version)?;
        build.version += 1;
        *stored = build.clone();
        Ok(())
    }
}

#[async_trait]
impl StageStore for MemoryStore {
    async fn list_stages(&self, build_id: i64) -> StoreResult<Vec<Stage>> {
        let tables = self.lock();
        let mut stages: Vec<Stage> = tables
            .stages
            .values()
            .filter(|s| s.build_id == build_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.number);
        for stage in &mut stages {
            stage.tasks = tables
                .tasks
                .values()
                .filter(|t| t.stage_id == stage.id)
                .cloned()
                .collect();
            stage.tasks.sort_by_key(|t| t.number);
        }
        Ok(stages)
    }

    async fn update_stage(&self, stage: &mut Stage) -> StoreResult<()> {
        let mut tables = self.lock();
        let stored = tables.stages.get_mut(&stage.id).ok_or(StoreError::NotFound {
            kind: "stage",
            id: stage.id,
        })?;
        check_version("stage", stage.id, stored.version, stage.version)?;
        stage.version += 1;
        let mut row = stage.clone();
        row.tasks.clear();
        *stored = row;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn find_task(&self, id: i64) -> StoreResult<Task> {
        self.lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "task", id })
    }

    async fn update_task(&self, task: &mut Task) -> StoreResult<()> {
        let mut tables = self.lock();
        let stored = tables.tasks.get_mut(&task.id).ok_or(StoreError::NotFound {
            kind: "task",
            id: task.id,
        })?;
        check_version("task", task.id, stored.version, task.version)?;
        task.version += 1;
        *stored = task.clone();
        Ok(())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn write_logs(&self, task_id: i64, data: Vec<u8>) -> StoreResult<()> {
        let mut tables = self.lock();
        if !tables.tasks.contains_key(&task_id) {
            return Err(StoreError::NotFound {
                kind: "task",
                id: task_id,
            });
        }
        tables.logs.insert(task_id, data);
        Ok(())
    }

    async fn find_logs(&self, task_id: i64) -> StoreResult<Vec<u8>> {
        self.lock().logs.get(&task_id).cloned().ok_or(StoreError::NotFound {
            kind: "logs",
            id: task_id,
        })
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, id: i64) -> StoreResult<User> {
        self.lock()
            .users
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "user", id })
    }
}
