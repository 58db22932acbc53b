//! Native backend behaviour seen through the engine contract and the runner.
#![cfg(unix)]

use conduit_core::engine::native::paths;
use conduit_core::model::{Build, Repo, Stage, Status, Task};
use conduit_core::pipeline::{self, Bind, Config, Step, Volume, VolumeDriver};
use conduit_core::pubsub::BroadcastPubsub;
use conduit_core::store::{BuildStore, LogStore, MemoryStore};
use conduit_core::{
    Engine, NativeConfig, NativeEngine, NativeEngineFactory, Runner, RunnerConfig, StoreUpdater,
    Work,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

fn shell(name: &str, script: &str) -> Step {
    Step {
        name: name.into(),
        command: vec!["sh".into(), "-c".into(), script.into()],
        ..Default::default()
    }
}

#[tokio::test]
async fn tail_after_wait_reaches_end_of_stream() {
    let dir = TempDir::new().unwrap();
    let engine = NativeEngine::new(NativeConfig::default().with_root(dir.path()));
    let step = shell("echo", "sleep 0.2; echo done");

    engine.exec(&step).await.unwrap();
    let mut early = engine.tail(&step).await.unwrap();
    let state = engine.wait(&step).await.unwrap();
    assert_eq!(state.exit_code, 0);

    let mut out = String::new();
    tokio::time::timeout(Duration::from_secs(1), early.read_to_string(&mut out))
        .await
        .expect("tail must not block once the step exited")
        .unwrap();
    assert_eq!(out, "done\n");
}

#[test]
fn working_directory_maps_through_volume_bind() {
    let step = Step {
        name: "build".into(),
        working_dir: Some("/work/sub".into()),
        volumes: vec![Bind::new("/host/a", "/work")],
        ..Default::default()
    };
    assert_eq!(
        paths::rewrite(Path::new("/var/conduit"), &step, "/work/sub"),
        "/host/a/sub"
    );
}

#[tokio::test]
async fn destroy_reaps_unwaited_steps_and_releases_local_volumes() {
    let dir = TempDir::new().unwrap();
    let engine = NativeEngine::new(NativeConfig::default().with_root(dir.path()));
    let config = Config {
        volumes: vec![
            Volume {
                name: "cache".into(),
                driver: VolumeDriver::Local,
            },
            Volume {
                name: "remote".into(),
                driver: VolumeDriver::Other("nfs".into()),
            },
        ],
        ..Default::default()
    };
    engine.setup(&config).await.unwrap();
    let cache = paths::volume_dir(dir.path(), "cache");
    let remote = paths::volume_dir(dir.path(), "remote");
    std::fs::create_dir_all(&remote).unwrap();

    for name in ["a", "b", "c"] {
        engine.exec(&shell(name, "sleep 60")).await.unwrap();
    }
    engine.exec(&shell("quick", "true")).await.unwrap();

    engine.destroy(&config).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), engine.drained())
        .await
        .expect("teardown must drain");

    assert_eq!(engine.tracked(), 0);
    assert!(!cache.exists());
    assert!(remote.exists(), "non-local volumes are left alone");
}

fn native_runner(dir: &TempDir, store: &Arc<MemoryStore>, config: RunnerConfig) -> Runner {
    Runner::new(
        Arc::new(StoreUpdater::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(BroadcastPubsub::default()),
        )),
        Arc::new(NativeEngineFactory::new(
            NativeConfig::default().with_root(dir.path().join("engine")),
        )),
        config.with_timeout_buffer(Duration::from_secs(30)),
    )
}

/// One stage holding `steps`, persisted as a pending build.
async fn work_for(store: &MemoryStore, steps: Vec<Step>, volumes: Vec<Volume>) -> Work {
    let repo = Repo {
        id: 1,
        slug: "octo/hello".into(),
        ..Default::default()
    };
    let mut build = Build {
        repo_id: 1,
        ..Default::default()
    };
    let mut stages = vec![Stage {
        number: 1,
        name: "default".into(),
        tasks: steps
            .iter()
            .enumerate()
            .map(|(i, step)| Task {
                number: i as i64 + 1,
                name: step.name.clone(),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }];
    store.create_build(&mut build, &mut stages).await.unwrap();

    Work {
        repo,
        stages: store.stages_of(build.id),
        tasks: store.tasks_of(build.id),
        build,
        config: Config {
            stages: vec![pipeline::Stage {
                name: "default".into(),
                steps,
            }],
            volumes,
            ..Default::default()
        },
        netrc: None,
    }
}

#[tokio::test]
async fn runner_drives_native_steps_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let runner = native_runner(&dir, &store, RunnerConfig::default());

    let workspace = Bind::new("cache", "/workspace");
    let mut write = shell("write", "echo hello > message.txt");
    let mut read = shell("read", "cat message.txt");
    for step in [&mut write, &mut read] {
        step.working_dir = Some("/workspace".into());
        step.volumes.push(workspace.clone());
    }
    let mut work = work_for(
        &store,
        vec![write, read, shell("fail", "echo boom >&2; exit 3")],
        vec![Volume {
            name: "cache".into(),
            driver: VolumeDriver::Local,
        }],
    )
    .await;
    runner.run(&mut work).await.unwrap();

    let tasks = store.tasks_of(work.build.id);
    let statuses: Vec<Status> = tasks.iter().map(|t| t.status).collect();
    assert_eq!(statuses, [Status::Success, Status::Success, Status::Failure]);
    assert_eq!(tasks[2].exit_code, 3);
    assert_eq!(store.find_logs(tasks[1].id).await.unwrap(), b"hello\n");
    assert_eq!(store.find_logs(tasks[2].id).await.unwrap(), b"boom\n");
    assert_eq!(
        store.find_build(work.build.id).await.unwrap().status,
        Status::Failure
    );
    let stage = &store.stages_of(work.build.id)[0];
    assert_eq!((stage.status, stage.exit_code), (Status::Failure, 3));
}

#[tokio::test]
async fn side_effecting_step_runs_once_and_notifier_runs_separately() {
    let dir = TempDir::new().unwrap();
    let deploys = dir.path().join("deploys.txt");
    let notified = dir.path().join("notified.txt");
    let store = Arc::new(MemoryStore::new());
    let notifier = shell(
        "notify",
        &format!("echo \"$CI_NOTIFY\" >> {}", notified.display()),
    );
    let runner = native_runner(&dir, &store, RunnerConfig::default().with_notifier(notifier));

    let deploy = shell("deploy", &format!("echo deployed >> {}", deploys.display()));
    let mut work = work_for(&store, vec![deploy], Vec::new()).await;
    runner.run(&mut work).await.unwrap();

    assert_eq!(std::fs::read_to_string(&deploys).unwrap(), "deployed\n");
    assert_eq!(std::fs::read_to_string(&notified).unwrap(), "true\n");
    assert_eq!(
        store.find_build(work.build.id).await.unwrap().status,
        Status::Success
    );
}
