use crate::cli::args::ExecArgs;
use crate::exit_codes;
use anyhow::Context;
use conduit_core::canceler::Canceler;
use conduit_core::model::{Build, Event, Repo, Stage, Status, Task, User, Visibility};
use conduit_core::pubsub::BroadcastPubsub;
use conduit_core::scheduler::LocalScheduler;
use conduit_core::status::NoopStatus;
use conduit_core::store::{BuildStore, LogStore, MemoryStore};
use conduit_core::webhook::HttpWebhookSender;
use conduit_core::{
    Config, NativeConfig, NativeEngineFactory, Runner, RunnerConfig, StoreUpdater, Work,
};
use std::sync::Arc;
use tracing::{info, warn};

const LOCAL_USER: i64 = 1;
const LOCAL_REPO: i64 = 1;

fn local_repo(args: &ExecArgs) -> Repo {
    let (namespace, name) = args
        .repo
        .split_once('/')
        .unwrap_or(("local", args.repo.as_str()));
    Repo {
        id: LOCAL_REPO,
        user_id: LOCAL_USER,
        namespace: namespace.to_string(),
        name: name.to_string(),
        slug: args.repo.clone(),
        visibility: Visibility::Private,
        trusted: true,
        timeout: args.timeout,
    }
}

/// One persisted stage per pipeline stage, one task per step.
fn plan(config: &Config) -> Vec<Stage> {
    config
        .stages
        .iter()
        .enumerate()
        .map(|(i, stage)| Stage {
            number: i as i64 + 1,
            name: stage.name.clone(),
            tasks: stage
                .steps
                .iter()
                .enumerate()
                .map(|(j, step)| Task {
                    number: j as i64 + 1,
                    name: step.name.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect()
}

pub async fn run(args: ExecArgs) -> anyhow::Result<i32> {
    let config = Config::load(&args.pipeline)
        .with_context(|| format!("failed to load pipeline {}", args.pipeline.display()))?;

    let store = Arc::new(MemoryStore::new());
    store.insert_user(User {
        id: LOCAL_USER,
        login: std::env::var("USER").unwrap_or_else(|_| "local".to_string()),
        ..Default::default()
    });
    let repo = local_repo(&args);

    let mut build = Build {
        repo_id: repo.id,
        event: Event::Custom,
        git_ref: args.git_ref.clone(),
        ..Default::default()
    };
    let mut stages = plan(&config);
    store
        .create_build(&mut build, &mut stages)
        .await
        .context("failed to create build")?;

    let bus = Arc::new(BroadcastPubsub::default());
    let updater = Arc::new(StoreUpdater::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        bus.clone(),
    ));

    let mut runner_config = RunnerConfig::from_env();
    if let Some(image) = &args.notify_image {
        runner_config = runner_config.with_notify_image(image.clone());
    }
    let mut native = NativeConfig::from_env()
        .with_inherit_env(!args.clean_env)
        .with_log_limit(runner_config.log_limit);
    if let Some(root) = &args.root {
        native = native.with_root(root);
    }
    let runner = Arc::new(Runner::new(
        updater,
        Arc::new(NativeEngineFactory::new(native)),
        runner_config,
    ));

    let canceler = Canceler {
        builds: store.clone(),
        stages: store.clone(),
        tasks: store.clone(),
        users: store.clone(),
        scheduler: Arc::new(LocalScheduler::new(runner.clone())),
        status: Arc::new(NoopStatus),
        events: bus,
        webhook: Arc::new(
            HttpWebhookSender::new(args.webhooks.clone())
                .context("failed to create webhook client")?,
        ),
    };

    let mut work = Work {
        repo: repo.clone(),
        stages: store.stages_of(build.id),
        tasks: store.tasks_of(build.id),
        build: build.clone(),
        config,
        netrc: None,
    };

    info!(pipeline = %args.pipeline.display(), build = build.id, "starting build");
    let result = {
        let run = runner.run(&mut work);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::signal::ctrl_c() => {
                warn!(build = build.id, "interrupt received; cancelling build");
                let mut current = store
                    .find_build(build.id)
                    .await
                    .context("failed to load build for cancellation")?;
                if let Err(e) = canceler.cancel(&repo, &mut current).await {
                    warn!(build = build.id, error = %e, "cancellation failed");
                }
                run.await
            }
        }
    };
    result.context("build run failed")?;

    let build = store
        .find_build(build.id)
        .await
        .context("failed to load finished build")?;
    let tasks = store.tasks_of(build.id);

    println!("{:<24} {:<8} {:>5} {:>8}", "TASK", "STATUS", "EXIT", "DURATION");
    for task in &tasks {
        println!(
            "{:<24} {:<8} {:>5} {:>7}s",
            task.name,
            task.status,
            task.exit_code,
            task.duration()
        );
    }
    println!("build #{} {}", build.number, build.status);

    if args.print_logs {
        for task in &tasks {
            let Ok(logs) = store.find_logs(task.id).await else {
                continue;
            };
            println!("--- {} ---", task.name);
            print!("{}", String::from_utf8_lossy(&logs));
        }
    }

    Ok(if build.status == Status::Success {
        exit_codes::SUCCESS
    } else {
        exit_codes::BUILD_FAILED
    })
}
