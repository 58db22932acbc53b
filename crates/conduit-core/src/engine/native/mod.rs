//! Native process backend.
//!
//! Each step runs as a host process in its own process group. Container-side
//! paths are rewritten onto host paths (see [`paths`]), plugin images resolve
//! to `tool-<name>` executables on the search path, and combined output is
//! captured in a retained in-memory pipe that any number of `tail` readers can
//! follow.
//!
//! Intended for trusted, local execution: there is no filesystem, network or
//! resource isolation.

mod command;
pub mod paths;
mod pipe;

pub use command::{PLUGIN_PREFIX, SCRIPT_BODY_ENV, SCRIPT_NAME_ENV};

use crate::engine::{Engine, EngineError, EngineFactory, LogStream, State};
use crate::pipeline::{Config, Step, VolumeDriver};
use crate::runner::Work;
use async_trait::async_trait;
use pipe::LogPipe;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const ENV_ROOT: &str = "CONDUIT_NATIVE_ROOT";
const ENV_LOG_LIMIT: &str = "CONDUIT_LOG_LIMIT";
const DEFAULT_LOG_LIMIT: usize = 5_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeConfig {
    /// Directory holding local volumes and default step working directories.
    pub root: PathBuf,
    /// Pass the engine's own environment through to steps.
    pub inherit_env: bool,
    /// Bytes of output retained per step for `tail` readers.
    pub log_limit: usize,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("conduit"),
            inherit_env: true,
            log_limit: DEFAULT_LOG_LIMIT,
        }
    }
}

impl NativeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(root) = std::env::var(ENV_ROOT) {
            if !root.is_empty() {
                config.root = PathBuf::from(root);
            }
        }
        if let Some(limit) = std::env::var(ENV_LOG_LIMIT)
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.log_limit = limit;
        }
        config
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = limit;
        self
    }
}

struct Tracked {
    pid: Option<u32>,
    pipe: LogPipe,
    state: watch::Receiver<Option<State>>,
}

struct Inner {
    config: NativeConfig,
    procs: Mutex<HashMap<String, Tracked>>,
    tearing_down: AtomicBool,
    drained: watch::Sender<bool>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.procs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reap every tracked step, then release local volumes.
    async fn drain(self: Arc<Self>, config: Config) {
        loop {
            let next = self
                .lock()
                .iter()
                .next()
                .map(|(name, t)| (name.clone(), t.state.clone()));
            let Some((name, mut state)) = next else {
                break;
            };
            if state.wait_for(Option::is_some).await.is_err() {
                warn!(step = %name, "step reaper went away during teardown");
            }
            self.lock().remove(&name);
        }

        for volume in &config.volumes {
            match &volume.driver {
                VolumeDriver::Local => {
                    let dir = paths::volume_dir(&self.config.root, &volume.name);
                    remove_dir(&dir).await;
                }
                VolumeDriver::Other(driver) => {
                    warn!(volume = %volume.name, driver = %driver, "native engine leaves non-local volume in place");
                }
            }
        }
        remove_dir(&self.config.root.join("steps")).await;

        debug!(root = %self.config.root.display(), "native engine drained");
        self.drained.send_replace(true);
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %dir.display(), error = %e, "failed to remove directory"),
    }
}

/// Engine running steps as host processes.
///
/// Cheap to clone; clones share the same process table.
#[derive(Clone)]
pub struct NativeEngine {
    inner: Arc<Inner>,
}

impl NativeEngine {
    pub fn new(config: NativeConfig) -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                procs: Mutex::new(HashMap::new()),
                tearing_down: AtomicBool::new(false),
                drained,
            }),
        }
    }

    pub fn config(&self) -> &NativeConfig {
        &self.inner.config
    }

    /// Resolves once the background teardown started by `destroy` has reaped
    /// every step and removed local volumes. Pending until `destroy` is called.
    pub async fn drained(&self) {
        let mut rx = self.inner.drained.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Number of steps still tracked.
    pub fn tracked(&self) -> usize {
        self.inner.lock().len()
    }

    fn workdir(&self, step: &Step) -> PathBuf {
        let root = &self.inner.config.root;
        match step.working_dir.as_deref() {
            Some(dir) if !dir.is_empty() => PathBuf::from(paths::rewrite(root, step, dir)),
            _ => root.join("steps").join(paths::sanitize(&step.name)),
        }
    }
}

#[async_trait]
impl Engine for NativeEngine {
    async fn setup(&self, config: &Config) -> Result<(), EngineError> {
        let root = &self.inner.config.root;
        tokio::fs::create_dir_all(root).await?;
        for volume in &config.volumes {
            match &volume.driver {
                VolumeDriver::Local => {
                    tokio::fs::create_dir_all(paths::volume_dir(root, &volume.name)).await?;
                }
                VolumeDriver::Other(driver) => {
                    warn!(volume = %volume.name, driver = %driver, "native engine cannot provision non-local volume; skipping");
                }
            }
        }
        Ok(())
    }

    async fn exec(&self, step: &Step) -> Result<(), EngineError> {
        if self.inner.tearing_down.load(Ordering::SeqCst) {
            return Err(EngineError::Backend(format!(
                "step {:?}: engine is being torn down",
                step.name
            )));
        }

        let root = &self.inner.config.root;
        let env = paths::rewrite_env(root, step);
        let workdir = self.workdir(step);
        tokio::fs::create_dir_all(&workdir).await?;

        let script = command::materialize_script(step, &env, &workdir)?;
        let invocation = command::resolve(step, &env, script.as_deref())?;

        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !self.inner.config.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&env);
        #[cfg(unix)]
        cmd.process_group(0);

        let pipe = LogPipe::new(self.inner.config.log_limit);
        let (state_tx, state_rx) = watch::channel(None);
        let child = {
            let mut procs = self.inner.lock();
            if procs.contains_key(&step.name) {
                return Err(EngineError::AlreadyExists {
                    step: step.name.clone(),
                });
            }
            let child = cmd.spawn().map_err(|source| EngineError::Spawn {
                step: step.name.clone(),
                source,
            })?;
            procs.insert(
                step.name.clone(),
                Tracked {
                    pid: child.id(),
                    pipe: pipe.clone(),
                    state: state_rx,
                },
            );
            child
        };

        info!(
            step = %step.name,
            program = %invocation.program.display(),
            pid = ?child.id(),
            workdir = %workdir.display(),
            "native step started"
        );
        tokio::spawn(reap(child, pipe, state_tx, step.name.clone()));
        Ok(())
    }

    async fn kill(&self, step: &Step) -> Result<(), EngineError> {
        let pid = {
            let procs = self.inner.lock();
            let tracked = procs
                .get(&step.name)
                .ok_or_else(|| EngineError::NotExecuted {
                    step: step.name.clone(),
                })?;
            if tracked.state.borrow().is_some() {
                return Ok(());
            }
            tracked.pid
        };
        match pid {
            Some(pid) => {
                debug!(step = %step.name, pid, "killing native step");
                kill_group(pid)
            }
            None => Ok(()),
        }
    }

    async fn wait(&self, step: &Step) -> Result<State, EngineError> {
        let mut rx = self
            .inner
            .lock()
            .get(&step.name)
            .map(|t| t.state.clone())
            .ok_or_else(|| EngineError::NotExecuted {
                step: step.name.clone(),
            })?;

        let state = rx
            .wait_for(Option::is_some)
            .await
            .map(|state| *state)
            .map_err(|_| EngineError::Backend(format!("step {:?}: reaper exited", step.name)))?
            .unwrap_or_default();

        self.inner.lock().remove(&step.name);
        Ok(state)
    }

    async fn tail(&self, step: &Step) -> Result<LogStream, EngineError> {
        let procs = self.inner.lock();
        let tracked = procs
            .get(&step.name)
            .ok_or_else(|| EngineError::NotExecuted {
                step: step.name.clone(),
            })?;
        Ok(Box::new(tracked.pipe.reader()))
    }

    async fn destroy(&self, config: &Config) -> Result<(), EngineError> {
        self.inner.tearing_down.store(true, Ordering::SeqCst);

        let running: Vec<(String, u32)> = self
            .inner
            .lock()
            .iter()
            .filter(|(_, t)| t.state.borrow().is_none())
            .filter_map(|(name, t)| t.pid.map(|pid| (name.clone(), pid)))
            .collect();
        for (name, pid) in running {
            if let Err(e) = kill_group(pid) {
                warn!(step = %name, error = %e, "failed to kill step during teardown");
            }
        }

        tokio::spawn(Arc::clone(&self.inner).drain(config.clone()));
        Ok(())
    }
}

async fn reap(
    mut child: Child,
    pipe: LogPipe,
    state: watch::Sender<Option<State>>,
    step: String,
) {
    let stdout = child
        .stdout
        .take()
        .map(|out| tokio::spawn(pump(out, pipe.clone())));
    let stderr = child
        .stderr
        .take()
        .map(|err| tokio::spawn(pump(err, pipe.clone())));

    let exit = match child.wait().await {
        Ok(status) => State {
            exit_code: exit_code(status),
            exited: true,
            oom_killed: false,
        },
        Err(e) => {
            warn!(step = %step, error = %e, "failed to wait on native step");
            State {
                exit_code: -1,
                exited: false,
                oom_killed: false,
            }
        }
    };

    for handle in [stdout, stderr].into_iter().flatten() {
        let _ = handle.await;
    }
    pipe.close();

    let dropped = pipe.dropped();
    if dropped > 0 {
        warn!(step = %step, dropped_bytes = dropped, "step output exceeded the log limit");
    }
    debug!(step = %step, exit_code = exit.exit_code, "native step exited");
    state.send_replace(Some(exit));
}

async fn pump(mut src: impl AsyncRead + Unpin, pipe: LogPipe) {
    let mut buf = [0u8; 8192];
    loop {
        match src.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => pipe.write(&buf[..n]),
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn kill_group(pid: u32) -> Result<(), EngineError> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| EngineError::Backend(format!("pid {pid} out of range")))?;
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(EngineError::Backend(format!(
            "SIGKILL failed for process group {pid}: {e}"
        ))),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> Result<(), EngineError> {
    Err(EngineError::Backend(
        "killing native steps is only supported on unix".into(),
    ))
}

/// Creates one [`NativeEngine`] per build, rooted at `<root>/build-<id>`.
#[derive(Debug, Clone, Default)]
pub struct NativeEngineFactory {
    config: NativeConfig,
}

impl NativeEngineFactory {
    pub fn new(config: NativeConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for NativeEngineFactory {
    fn create(&self, work: &Work) -> Result<Arc<dyn Engine>, EngineError> {
        let root = self
            .config
            .root
            .join(format!("build-{}", work.build.id));
        Ok(Arc::new(NativeEngine::new(
            self.config.clone().with_root(root),
        )))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::{Bind, Volume};
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> NativeEngine {
        NativeEngine::new(NativeConfig::default().with_root(dir.path()))
    }

    fn shell(name: &str, script: &str) -> Step {
        Step {
            name: name.into(),
            command: vec!["sh".into(), "-c".into(), script.into()],
            ..Default::default()
        }
    }

    async fn read_all(mut stream: LogStream) -> String {
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[test]
    #[serial_test::serial]
    fn config_reads_root_from_environment() {
        std::env::set_var(ENV_ROOT, "/srv/conduit");
        std::env::set_var(ENV_LOG_LIMIT, "4096");
        let config = NativeConfig::from_env();
        std::env::remove_var(ENV_ROOT);
        std::env::remove_var(ENV_LOG_LIMIT);
        assert_eq!(config.root, PathBuf::from("/srv/conduit"));
        assert_eq!(config.log_limit, 4096);
        assert!(config.inherit_env);
    }

    #[tokio::test]
    async fn retained_output_is_capped_while_the_step_keeps_writing() {
        let dir = TempDir::new().unwrap();
        let engine = NativeEngine::new(
            NativeConfig::default()
                .with_root(dir.path())
                .with_log_limit(1000),
        );
        let step = shell("chatty", "head -c 200000 /dev/zero | tr '\\0' x");

        engine.exec(&step).await.unwrap();
        let logs = engine.tail(&step).await.unwrap();
        let state = tokio::time::timeout(Duration::from_secs(10), engine.wait(&step))
            .await
            .expect("a capped step must still be drained to exit")
            .unwrap();

        assert_eq!(state.exit_code, 0);
        let out = read_all(logs).await;
        assert_eq!(out.len(), 1000);
        assert!(out.bytes().all(|b| b == b'x'));
    }

    #[tokio::test]
    async fn exec_wait_reports_exit_code_and_output() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let step = shell("build", "echo out; echo err >&2; exit 3");

        engine.exec(&step).await.unwrap();
        let logs = engine.tail(&step).await.unwrap();
        let state = engine.wait(&step).await.unwrap();

        assert_eq!(state.exit_code, 3);
        assert!(state.exited);
        assert!(!state.oom_killed);
        let out = read_all(logs).await;
        assert!(out.contains("out\n"), "{out}");
        assert!(out.contains("err\n"), "{out}");
    }

    #[tokio::test]
    async fn unknown_steps_are_not_executed() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let step = shell("ghost", "true");

        assert!(engine.wait(&step).await.unwrap_err().is_not_executed());
        assert!(engine.kill(&step).await.unwrap_err().is_not_executed());
        assert!(engine.tail(&step).await.err().unwrap().is_not_executed());
    }

    #[tokio::test]
    async fn duplicate_exec_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let step = shell("dup", "sleep 5");

        engine.exec(&step).await.unwrap();
        let err = engine.exec(&step).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists { .. }));

        engine.kill(&step).await.unwrap();
        engine.wait(&step).await.unwrap();
    }

    #[tokio::test]
    async fn second_wait_is_not_executed() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let step = shell("once", "true");

        engine.exec(&step).await.unwrap();
        assert_eq!(engine.wait(&step).await.unwrap().exit_code, 0);
        assert!(engine.wait(&step).await.unwrap_err().is_not_executed());
    }

    #[tokio::test]
    async fn kill_terminates_the_process_group() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let step = shell("sleepy", "sleep 30 & sleep 30; wait");

        engine.exec(&step).await.unwrap();
        let logs = engine.tail(&step).await.unwrap();
        engine.kill(&step).await.unwrap();

        let state = tokio::time::timeout(Duration::from_secs(10), engine.wait(&step))
            .await
            .expect("wait must return after kill")
            .unwrap();
        assert_eq!(state.exit_code, 128 + 9);

        // the background sleep held stdout; it must be gone too
        tokio::time::timeout(Duration::from_secs(5), read_all(logs))
            .await
            .expect("tail must reach end-of-stream");
    }

    #[tokio::test]
    async fn working_directory_is_rewritten_through_binds() {
        let dir = TempDir::new().unwrap();
        let host = dir.path().join("host-a");
        std::fs::create_dir_all(&host).unwrap();
        let engine = engine(&dir);

        let mut step = shell("pwd", "pwd -P");
        step.working_dir = Some("/work/sub".into());
        step.volumes
            .push(Bind::new(host.display().to_string(), "/work"));

        engine.exec(&step).await.unwrap();
        let logs = engine.tail(&step).await.unwrap();
        assert_eq!(engine.wait(&step).await.unwrap().exit_code, 0);

        let expected = host.join("sub").canonicalize().unwrap();
        assert_eq!(read_all(logs).await.trim(), expected.display().to_string());
    }

    #[tokio::test]
    async fn inline_script_runs_with_rewritten_env() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);

        let mut step = Step {
            name: "script".into(),
            volumes: vec![Bind::new("/opt/cache", "/cache")],
            ..Default::default()
        };
        step.environment
            .insert(SCRIPT_BODY_ENV.into(), "echo \"cache=$CACHE\"\n".into());
        step.environment
            .insert(SCRIPT_NAME_ENV.into(), "run.sh".into());
        step.environment.insert("CACHE".into(), "/cache/x".into());

        engine.exec(&step).await.unwrap();
        let logs = engine.tail(&step).await.unwrap();
        assert_eq!(engine.wait(&step).await.unwrap().exit_code, 0);
        assert_eq!(read_all(logs).await, "cache=/opt/cache/x\n");
    }

    #[tokio::test]
    async fn destroy_drains_and_removes_local_volumes() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let config = Config {
            volumes: vec![
                Volume {
                    name: "cache".into(),
                    driver: VolumeDriver::Local,
                },
                Volume {
                    name: "shared".into(),
                    driver: VolumeDriver::Other("nfs".into()),
                },
            ],
            ..Default::default()
        };
        engine.setup(&config).await.unwrap();
        let cache = paths::volume_dir(dir.path(), "cache");
        assert!(cache.is_dir());

        let step = shell("forever", "sleep 60");
        engine.exec(&step).await.unwrap();
        assert_eq!(engine.tracked(), 1);

        engine.destroy(&config).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), engine.drained())
            .await
            .expect("teardown must finish");

        assert_eq!(engine.tracked(), 0);
        assert!(!cache.exists());
        let err = engine.exec(&shell("late", "true")).await.unwrap_err();
        assert!(matches!(err, EngineError::Backend(_)));
    }
}
