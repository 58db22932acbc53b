//! Build runner: drives one build's tasks through an engine.
//!
//! Tasks run strictly in declaration order. Each task's logs and final status
//! are persisted before the next task starts, and a stage row moves to
//! `Running` before its first task and to a terminal status after its last.
//! A step's [`RunPolicy`] decides whether it runs given earlier failures; a
//! gated-off step is recorded as `Skipped`. Step failures become task
//! statuses; only persistence and setup failures abort the run. Whatever
//! happens, a cleanup pass tears the engine down and forces any build left
//! `Running` (and its unfinished stages and tasks) to `Error`.

use crate::engine::{Engine, EngineError, EngineFactory, LogStream, State};
use crate::model::{
    now, Build, Netrc, Repo, Stage, Status, Task, EXIT_CODE_ABORTED, EXIT_CODE_CANCELLED,
    EXIT_CODE_SIGKILL,
};
use crate::pipeline::{Config, RunPolicy, Step};
use crate::updater::{Updater, UpdaterError};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the JSON execution payload of a step.
pub const PAYLOAD_ENV: &str = "CI_PAYLOAD";
/// Set to `"true"` on the notification step.
pub const NOTIFY_ENV: &str = "CI_NOTIFY";

const DEFAULT_TIMEOUT_BUFFER: Duration = Duration::from_secs(5 * 60);
const DEFAULT_LOG_LIMIT: usize = 5_000_000;
const NOTIFY_OUTPUT_LIMIT: usize = 50_000;
const KILL_GRACE: Duration = Duration::from_secs(30);
const LOG_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Persist(#[from] UpdaterError),

    #[error("engine setup failed: {0}")]
    Setup(#[source] EngineError),

    #[error("cannot encode step payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("build run panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Engine(EngineError),
}

/// Runner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Added to the repository timeout for every step.
    pub timeout_buffer: Duration,
    /// Bytes of output kept per task; the rest is discarded.
    pub log_limit: usize,
    /// Name of this machine, handed to steps in their payload.
    pub machine: String,
    /// Step run once after every finished build with the build payload.
    /// Pipeline steps are never re-run for notification.
    pub notifier: Option<Step>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_buffer: DEFAULT_TIMEOUT_BUFFER,
            log_limit: DEFAULT_LOG_LIMIT,
            machine: default_machine(),
            notifier: None,
        }
    }
}

fn default_machine() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

impl RunnerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout_buffer: std::env::var("CONDUIT_TIMEOUT_BUFFER_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout_buffer),
            log_limit: std::env::var("CONDUIT_LOG_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.log_limit),
            machine: std::env::var("CONDUIT_MACHINE")
                .ok()
                .filter(|m| !m.is_empty())
                .unwrap_or(defaults.machine),
            notifier: std::env::var("CONDUIT_NOTIFY_IMAGE")
                .ok()
                .filter(|i| !i.is_empty())
                .map(notify_step),
        }
    }

    pub fn with_timeout_buffer(mut self, buffer: Duration) -> Self {
        self.timeout_buffer = buffer;
        self
    }

    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = limit;
        self
    }

    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = machine.into();
        self
    }

    pub fn with_notifier(mut self, step: Step) -> Self {
        self.notifier = Some(step);
        self
    }

    /// Notify through a plugin image, e.g. `plugins/slack`.
    pub fn with_notify_image(self, image: impl Into<String>) -> Self {
        self.with_notifier(notify_step(image.into()))
    }
}

fn notify_step(image: String) -> Step {
    Step {
        name: "notify".to_string(),
        image,
        ..Default::default()
    }
}

/// Everything needed to run one build.
#[derive(Debug, Clone, Default)]
pub struct Work {
    pub repo: Repo,
    pub build: Build,
    /// Persisted stage rows; tasks reference them through `stage_id`.
    pub stages: Vec<Stage>,
    /// Persisted tasks in declaration order; names match pipeline steps.
    pub tasks: Vec<Task>,
    pub config: Config,
    pub netrc: Option<Netrc>,
}

#[derive(Serialize)]
struct Payload<'a> {
    repo: &'a Repo,
    build: &'a Build,
    #[serde(skip_serializing_if = "Option::is_none")]
    task: Option<&'a Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tasks: Option<&'a [Task]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    netrc: Option<&'a Netrc>,
    machine: &'a str,
}

struct ActiveRun {
    repo_id: i64,
    engine: Arc<dyn Engine>,
    /// Task id to the step handed to the engine.
    steps: HashMap<i64, Step>,
    cancelled: bool,
}

enum Outcome {
    Exited(State),
    TimedOut(Option<State>),
    Failed(EngineError),
}

/// Terminal status, exit code and error message of a finished step.
fn classify(outcome: &Outcome) -> (Status, i32, String) {
    match outcome {
        Outcome::Failed(e) => (Status::Error, 0, e.to_string()),
        Outcome::TimedOut(state) => (
            Status::Killed,
            state.map_or(EXIT_CODE_CANCELLED, |s| s.exit_code),
            "step timed out".to_string(),
        ),
        Outcome::Exited(state) if !state.exited => {
            (Status::Error, 1, "step stopped before it exited".to_string())
        }
        Outcome::Exited(state) if state.oom_killed => (
            Status::Error,
            state.exit_code,
            "step was killed: out of memory".to_string(),
        ),
        Outcome::Exited(state) => match state.exit_code {
            128 | EXIT_CODE_CANCELLED | EXIT_CODE_SIGKILL => {
                (Status::Killed, state.exit_code, String::new())
            }
            0 => (Status::Success, 0, String::new()),
            code => (Status::Failure, code, String::new()),
        },
    }
}

/// Status of a build given its tasks in declaration order: the first task
/// that neither succeeded nor was skipped decides.
pub fn build_status(tasks: &[Task]) -> Status {
    tasks
        .iter()
        .map(|t| t.status)
        .find(|s| !matches!(s, Status::Success | Status::Skipped))
        .unwrap_or(Status::Success)
}

/// Status of a stage once all its tasks are done.
fn stage_status(tasks: &[&Task]) -> Status {
    if !tasks.is_empty() && tasks.iter().all(|t| t.status == Status::Skipped) {
        return Status::Skipped;
    }
    tasks
        .iter()
        .map(|t| t.status)
        .find(|s| !matches!(s, Status::Success | Status::Skipped))
        .unwrap_or(Status::Success)
}

/// Whether a step gated by `policy` runs, given whether an earlier task failed.
fn should_run(policy: RunPolicy, failed: bool) -> bool {
    match policy {
        RunPolicy::Always => true,
        RunPolicy::OnSuccess => !failed,
        RunPolicy::OnFailure => failed,
        RunPolicy::Never => false,
    }
}

fn is_failed(status: Status) -> bool {
    matches!(status, Status::Failure | Status::Error | Status::Killed)
}

async fn collect_logs(mut stream: LogStream, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        let room = limit.saturating_sub(out.len());
        out.extend_from_slice(&buf[..n.min(room)]);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct Runner {
    updater: Arc<dyn Updater>,
    engines: Arc<dyn EngineFactory>,
    config: RunnerConfig,
    active: Mutex<HashMap<i64, ActiveRun>>,
}

impl Runner {
    pub fn new(
        updater: Arc<dyn Updater>,
        engines: Arc<dyn EngineFactory>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            updater,
            engines,
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn active(&self) -> MutexGuard<'_, HashMap<i64, ActiveRun>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_cancelled(&self, build_id: i64) -> bool {
        self.active()
            .get(&build_id)
            .is_some_and(|run| run.cancelled)
    }

    fn lookup(&self, repo: &Repo, build: &Build, task: &Task) -> Option<(Arc<dyn Engine>, Step)> {
        let active = self.active();
        let run = active.get(&build.id).filter(|r| r.repo_id == repo.id)?;
        let step = run.steps.get(&task.id)?.clone();
        Some((Arc::clone(&run.engine), step))
    }

    /// Run a build to completion, persisting every transition.
    ///
    /// Builds already `Killed` or `Skipped` are left untouched.
    pub async fn run(&self, work: &mut Work) -> Result<(), RunnerError> {
        if matches!(work.build.status, Status::Killed | Status::Skipped) {
            debug!(build = work.build.id, status = %work.build.status, "build cancelled before start; skipping");
            return Ok(());
        }

        info!(
            repo = %work.repo.slug,
            build = work.build.id,
            number = work.build.number,
            tasks = work.tasks.len(),
            "running build"
        );

        let result = match AssertUnwindSafe(self.execute(work)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(build = work.build.id, panic = %message, "build run panicked");
                Err(RunnerError::Panicked(message))
            }
        };

        self.cleanup(work).await;

        match &result {
            Ok(()) => info!(build = work.build.id, status = %work.build.status, "build finished"),
            Err(e) => warn!(build = work.build.id, error = %e, "build aborted"),
        }
        result
    }

    async fn execute(&self, work: &mut Work) -> Result<(), RunnerError> {
        let Work {
            repo,
            build,
            stages,
            tasks,
            config,
            netrc,
        } = work;

        let mut running = build.clone();
        running.status = Status::Running;
        if running.started == 0 {
            running.started = now();
        }
        self.updater.set_build(repo, &mut running).await?;
        *build = running;

        let engine = {
            let snapshot = Work {
                repo: repo.clone(),
                build: build.clone(),
                stages: Vec::new(),
                tasks: Vec::new(),
                config: config.clone(),
                netrc: netrc.clone(),
            };
            self.engines.create(&snapshot).map_err(RunnerError::Setup)?
        };
        self.active().insert(
            build.id,
            ActiveRun {
                repo_id: repo.id,
                engine: Arc::clone(&engine),
                steps: HashMap::new(),
                cancelled: false,
            },
        );
        engine.setup(config).await.map_err(RunnerError::Setup)?;

        let minutes = u64::try_from(repo.timeout).unwrap_or(0);
        let deadline = Duration::from_secs(minutes * 60) + self.config.timeout_buffer;
        let mut failed = false;

        for i in 0..tasks.len() {
            if self.is_cancelled(build.id) {
                debug!(build = build.id, "build cancelled; not starting further tasks");
                return Ok(());
            }

            let stage_id = tasks[i].stage_id;
            if let Some(stage) = stages.iter_mut().find(|s| s.id == stage_id) {
                if stage.status == Status::Pending {
                    stage.status = Status::Running;
                    if stage.started == 0 {
                        stage.started = now();
                    }
                    self.updater.set_stage(repo, build, stage).await?;
                }
            }

            let task = &mut tasks[i];
            let policy = config
                .step(&task.name)
                .map_or(RunPolicy::Always, |s| s.run_policy);
            if should_run(policy, failed) {
                let finished = self
                    .run_task(engine.as_ref(), repo, build, task, config, netrc.as_ref(), deadline)
                    .await?;
                if !finished {
                    return Ok(());
                }
            } else {
                debug!(build = build.id, task = %task.name, policy = ?policy, "step gated off; skipping");
                let stamp = now();
                task.status = Status::Skipped;
                if task.started == 0 {
                    task.started = stamp;
                }
                task.stopped = stamp;
                self.updater.set_task(repo, build, task).await?;
            }
            failed |= is_failed(task.status);

            let last_of_stage = !tasks[i + 1..].iter().any(|t| t.stage_id == stage_id);
            if last_of_stage {
                if let Some(stage) = stages.iter_mut().find(|s| s.id == stage_id) {
                    let members: Vec<&Task> =
                        tasks.iter().filter(|t| t.stage_id == stage_id).collect();
                    stage.status = stage_status(&members);
                    stage.exit_code = members
                        .iter()
                        .map(|t| t.exit_code)
                        .find(|code| *code != 0)
                        .unwrap_or(0);
                    stage.stopped = now();
                    self.updater.set_stage(repo, build, stage).await?;
                }
            }
        }

        let mut finished = build.clone();
        finished.status = build_status(tasks);
        finished.stopped = now();
        self.updater.set_build(repo, &mut finished).await?;
        *build = finished;

        self.notify(engine.as_ref(), repo, build, tasks, netrc.as_ref(), deadline)
            .await;
        Ok(())
    }

    /// Run one task's step to a terminal status and persist its logs and row.
    ///
    /// Returns `false` when the build was cancelled while the step ran; the
    /// task is then left for the canceler to close.
    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        &self,
        engine: &dyn Engine,
        repo: &Repo,
        build: &Build,
        task: &mut Task,
        config: &Config,
        netrc: Option<&Netrc>,
        deadline: Duration,
    ) -> Result<bool, RunnerError> {
        task.status = Status::Running;
        if task.started == 0 {
            task.started = now();
        }
        self.updater.set_task(repo, build, task).await?;

        let Some(mut step) = config.step(&task.name).cloned() else {
            warn!(build = build.id, task = %task.name, "no pipeline step for task");
            task.status = Status::Error;
            task.error = format!("no pipeline step named {:?}", task.name);
            task.stopped = now();
            self.updater.set_task(repo, build, task).await?;
            return Ok(true);
        };

        let payload = serde_json::to_string(&Payload {
            repo,
            build,
            task: Some(&*task),
            tasks: None,
            netrc,
            machine: &self.config.machine,
        })?;
        step.environment.insert(PAYLOAD_ENV.to_string(), payload);

        if let Some(run) = self.active().get_mut(&build.id) {
            run.steps.insert(task.id, step.clone());
        }

        debug!(build = build.id, task = %task.name, "starting step");
        let (outcome, collector) = self.drive(engine, &step, deadline).await;

        if self.is_cancelled(build.id) {
            debug!(build = build.id, task = %task.name, "build cancelled while step was running");
            if let Some(handle) = collector {
                handle.abort();
            }
            return Ok(false);
        }

        let (status, exit_code, message) = classify(&outcome);
        let logs = match (&outcome, collector) {
            (Outcome::Failed(e), None) => format!("error launching step: {e}\n").into_bytes(),
            (_, None) => Vec::new(),
            (_, Some(handle)) => match tokio::time::timeout(LOG_GRACE, handle).await {
                Ok(Ok(Ok(data))) => data,
                Ok(Ok(Err(e))) => {
                    warn!(task = %task.name, error = %e, "failed to read step output");
                    Vec::new()
                }
                Ok(Err(e)) => {
                    warn!(task = %task.name, error = %e, "log collector failed");
                    Vec::new()
                }
                Err(_) => {
                    warn!(task = %task.name, "step output did not close in time");
                    Vec::new()
                }
            },
        };
        self.updater
            .set_logs(repo, build, task, Box::new(std::io::Cursor::new(logs)))
            .await?;

        task.status = status;
        task.exit_code = exit_code;
        task.error = message;
        task.stopped = now();
        self.updater.set_task(repo, build, task).await?;
        info!(
            build = build.id,
            task = %task.name,
            status = %task.status,
            exit_code = task.exit_code,
            duration = task.duration(),
            "task finished"
        );
        Ok(true)
    }

    /// Exec a step, start collecting its output, and wait for it under `deadline`.
    async fn drive(
        &self,
        engine: &dyn Engine,
        step: &Step,
        deadline: Duration,
    ) -> (Outcome, Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>) {
        if let Err(e) = engine.exec(step).await {
            warn!(step = %step.name, error = %e, "failed to start step");
            return (Outcome::Failed(e), None);
        }

        let collector = match engine.tail(step).await {
            Ok(stream) => Some(tokio::spawn(collect_logs(stream, self.config.log_limit))),
            Err(e) => {
                warn!(step = %step.name, error = %e, "cannot tail step output");
                None
            }
        };

        let outcome = match tokio::time::timeout(deadline, engine.wait(step)).await {
            Ok(Ok(state)) => Outcome::Exited(state),
            Ok(Err(e)) => Outcome::Failed(e),
            Err(_) => {
                warn!(step = %step.name, timeout_secs = deadline.as_secs(), "step timed out; killing");
                if let Err(e) = engine.kill(step).await {
                    warn!(step = %step.name, error = %e, "failed to kill timed out step");
                }
                let reaped = match tokio::time::timeout(KILL_GRACE, engine.wait(step)).await {
                    Ok(Ok(state)) => Some(state),
                    _ => None,
                };
                Outcome::TimedOut(reaped)
            }
        };
        (outcome, collector)
    }

    /// Run the configured notifier once with the payload of the whole build.
    async fn notify(
        &self,
        engine: &dyn Engine,
        repo: &Repo,
        build: &Build,
        tasks: &[Task],
        netrc: Option<&Netrc>,
        deadline: Duration,
    ) {
        let Some(notifier) = &self.config.notifier else {
            debug!(build = build.id, "no notifier configured");
            return;
        };
        let payload = match serde_json::to_string(&Payload {
            repo,
            build,
            task: None,
            tasks: Some(tasks),
            netrc,
            machine: &self.config.machine,
        }) {
            Ok(p) => p,
            Err(e) => {
                warn!(build = build.id, error = %e, "cannot encode notification payload");
                return;
            }
        };

        let mut step = notifier.clone();
        step.name = format!("build-{}-notify", build.id);
        step.environment.insert(PAYLOAD_ENV.to_string(), payload);
        step.environment
            .insert(NOTIFY_ENV.to_string(), "true".to_string());

        match self.drive(engine, &step, deadline).await {
            (Outcome::Exited(state), _) if state.exit_code == 0 => {
                debug!(build = build.id, step = %step.name, "notification sent");
            }
            (Outcome::Exited(state), collector) => {
                let output = match collector {
                    Some(handle) => match tokio::time::timeout(LOG_GRACE, handle).await {
                        Ok(Ok(Ok(data))) => data,
                        _ => Vec::new(),
                    },
                    None => Vec::new(),
                };
                let end = output.len().min(NOTIFY_OUTPUT_LIMIT);
                warn!(
                    build = build.id,
                    step = %step.name,
                    exit_code = state.exit_code,
                    output = %String::from_utf8_lossy(&output[..end]),
                    "notification step failed"
                );
            }
            (Outcome::TimedOut(_), _) => {
                warn!(build = build.id, step = %step.name, "notification step timed out");
            }
            (Outcome::Failed(e), _) => {
                warn!(build = build.id, step = %step.name, error = %e, "notification step failed");
            }
        }
    }

    /// Tear down the engine and force an interrupted build, its stages and
    /// tasks into `Error`.
    async fn cleanup(&self, work: &mut Work) {
        let run = self.active().remove(&work.build.id);
        let cancelled = run.as_ref().is_some_and(|r| r.cancelled);

        if let Some(run) = run {
            // destroy also reaps steps that were started but never waited on
            if let Err(e) = run.engine.destroy(&work.config).await {
                warn!(build = work.build.id, error = %e, "failed to destroy engine resources");
            }
        }

        if work.build.status != Status::Running {
            return;
        }
        if cancelled {
            debug!(build = work.build.id, "build was cancelled; leaving terminal state to the canceler");
            return;
        }

        let Work {
            repo,
            build,
            stages,
            tasks,
            ..
        } = work;
        let stopped = now();
        for stage in stages.iter_mut() {
            match stage.status {
                Status::Running => {}
                Status::Pending => stage.started = stopped,
                _ => continue,
            }
            stage.status = Status::Error;
            stage.stopped = stopped;
            stage.exit_code = EXIT_CODE_ABORTED;
            if let Err(e) = self.updater.set_stage(repo, build, stage).await {
                error!(build = build.id, stage = %stage.name, error = %e, "cannot persist aborted stage");
            }
        }
        for task in tasks.iter_mut() {
            match task.status {
                Status::Running => {}
                Status::Pending => task.started = stopped,
                _ => continue,
            }
            task.status = Status::Error;
            task.stopped = stopped;
            task.exit_code = EXIT_CODE_ABORTED;
            if let Err(e) = self.updater.set_task(repo, build, task).await {
                error!(build = build.id, task = %task.name, error = %e, "cannot persist aborted task");
            }
        }

        build.status = Status::Error;
        build.stopped = stopped;
        if let Err(e) = self.updater.set_build(repo, build).await {
            error!(build = build.id, error = %e, "cannot persist aborted build");
        }
    }

    /// Kill the running step of one task.
    pub async fn cancel(&self, repo: &Repo, build: &Build, task: &Task) -> Result<(), RunnerError> {
        let (engine, step) =
            self.lookup(repo, build, task)
                .ok_or_else(|| RunnerError::Engine(EngineError::NotExecuted {
                    step: task.name.clone(),
                }))?;
        info!(build = build.id, task = %task.name, "cancelling task");
        engine.kill(&step).await.map_err(RunnerError::Engine)
    }

    /// Kill every step of a running build and stop it from starting more.
    ///
    /// A build not running on this runner is a no-op.
    pub async fn cancel_build(&self, build_id: i64) -> Result<(), RunnerError> {
        let target = {
            let mut active = self.active();
            active.get_mut(&build_id).map(|run| {
                run.cancelled = true;
                (
                    Arc::clone(&run.engine),
                    run.steps.values().cloned().collect::<Vec<_>>(),
                )
            })
        };
        let Some((engine, steps)) = target else {
            debug!(build = build_id, "cancel requested for build not running here");
            return Ok(());
        };

        info!(build = build_id, steps = steps.len(), "cancelling build");
        for step in &steps {
            match engine.kill(step).await {
                Ok(()) => {}
                Err(e) if e.is_not_executed() => {}
                Err(e) => warn!(build = build_id, step = %step.name, error = %e, "failed to kill step"),
            }
        }
        Ok(())
    }

    /// Stream the output of a task's step while the build is running.
    pub async fn logs(
        &self,
        repo: &Repo,
        build: &Build,
        task: &Task,
    ) -> Result<LogStream, RunnerError> {
        let (engine, step) =
            self.lookup(repo, build, task)
                .ok_or_else(|| RunnerError::Engine(EngineError::NotExecuted {
                    step: task.name.clone(),
                }))?;
        engine.tail(&step).await.map_err(RunnerError::Engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> Outcome {
        Outcome::Exited(State {
            exit_code: code,
            exited: true,
            oom_killed: false,
        })
    }

    #[test]
    fn classifies_exit_codes() {
        assert_eq!(classify(&exited(0)).0, Status::Success);
        assert_eq!(classify(&exited(2)), (Status::Failure, 2, String::new()));
        assert_eq!(classify(&exited(128)).0, Status::Killed);
        assert_eq!(classify(&exited(130)), (Status::Killed, 130, String::new()));
        assert_eq!(classify(&exited(137)), (Status::Killed, 137, String::new()));
        assert_eq!(classify(&Outcome::TimedOut(None)).0, Status::Killed);
        assert_eq!(
            classify(&Outcome::Failed(EngineError::Backend("boom".into()))).0,
            Status::Error
        );
    }

    #[test]
    fn oom_is_an_error_with_exit_code() {
        let outcome = Outcome::Exited(State {
            exit_code: 137,
            exited: true,
            oom_killed: true,
        });
        let (status, code, message) = classify(&outcome);
        assert_eq!(status, Status::Error);
        assert_eq!(code, 137);
        assert!(message.contains("out of memory"));
    }

    #[test]
    fn build_status_is_first_non_success() {
        let task = |status| Task {
            status,
            ..Default::default()
        };
        assert_eq!(build_status(&[]), Status::Success);
        assert_eq!(
            build_status(&[task(Status::Success), task(Status::Success)]),
            Status::Success
        );
        assert_eq!(
            build_status(&[
                task(Status::Success),
                task(Status::Killed),
                task(Status::Failure)
            ]),
            Status::Killed
        );
        assert_eq!(
            build_status(&[task(Status::Skipped), task(Status::Success)]),
            Status::Success
        );
    }

    #[test]
    fn stage_status_skips_only_when_every_task_was_skipped() {
        let task = |status| Task {
            status,
            ..Default::default()
        };
        let skipped = task(Status::Skipped);
        let failed = task(Status::Failure);
        let ok = task(Status::Success);
        assert_eq!(stage_status(&[&skipped, &skipped]), Status::Skipped);
        assert_eq!(stage_status(&[&ok, &skipped]), Status::Success);
        assert_eq!(stage_status(&[&skipped, &failed, &ok]), Status::Failure);
    }

    #[test]
    fn run_policy_gates_on_earlier_failures() {
        assert!(should_run(RunPolicy::Always, true));
        assert!(should_run(RunPolicy::OnSuccess, false));
        assert!(!should_run(RunPolicy::OnSuccess, true));
        assert!(should_run(RunPolicy::OnFailure, true));
        assert!(!should_run(RunPolicy::OnFailure, false));
        assert!(!should_run(RunPolicy::Never, false));
        assert!(!should_run(RunPolicy::Never, true));
    }

    #[tokio::test]
    async fn collector_caps_output_but_drains_stream() {
        let data = vec![b'x'; 20_000];
        let stream: LogStream = Box::new(std::io::Cursor::new(data));
        let logs = collect_logs(stream, 100).await.unwrap();
        assert_eq!(logs.len(), 100);
    }

    #[test]
    fn config_builders_override_defaults() {
        let config = RunnerConfig::default()
            .with_log_limit(10)
            .with_timeout_buffer(Duration::from_secs(1))
            .with_machine("ci-1");
        assert_eq!(config.log_limit, 10);
        assert_eq!(config.timeout_buffer, Duration::from_secs(1));
        assert_eq!(config.machine, "ci-1");
        assert!(config.notifier.is_none());
    }

    #[test]
    #[serial_test::serial]
    fn config_reads_environment() {
        std::env::set_var("CONDUIT_LOG_LIMIT", "1234");
        std::env::set_var("CONDUIT_TIMEOUT_BUFFER_SECS", "7");
        std::env::set_var("CONDUIT_MACHINE", "runner-7");
        std::env::set_var("CONDUIT_NOTIFY_IMAGE", "plugins/slack");
        let config = RunnerConfig::from_env();
        std::env::remove_var("CONDUIT_LOG_LIMIT");
        std::env::remove_var("CONDUIT_TIMEOUT_BUFFER_SECS");
        std::env::remove_var("CONDUIT_MACHINE");
        std::env::remove_var("CONDUIT_NOTIFY_IMAGE");

        assert_eq!(config.log_limit, 1234);
        assert_eq!(config.timeout_buffer, Duration::from_secs(7));
        assert_eq!(config.machine, "runner-7");
        let notifier = config.notifier.unwrap();
        assert_eq!(notifier.image, "plugins/slack");
        assert!(notifier.command.is_empty());
    }
}
