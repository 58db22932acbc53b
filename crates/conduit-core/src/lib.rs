//! Execution core of the Conduit pipeline runner.
//!
//! This crate drives a resolved pipeline through a pluggable execution
//! backend and keeps the persisted build state consistent while doing so:
//!
//! - [`engine::Engine`]: the backend contract (setup, exec, kill, wait, tail, destroy)
//! - [`engine::native::NativeEngine`]: runs steps as host processes, emulating volumes
//! - [`runner::Runner`]: sequences a build's tasks, classifies outcomes, recovers from crashes
//! - [`canceler::Canceler`]: cascades cancellation through builds, stages and tasks
//!
//! Persistence and eventing sit behind narrow traits ([`store`], [`updater`],
//! [`pubsub`], [`webhook`], [`status`], [`scheduler`]) so the core can be wired to
//! any datastore that offers optimistic-concurrency updates.
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `CONDUIT_TIMEOUT_BUFFER_SECS` | Seconds added to the repository timeout for each step (default: 300) |
//! | `CONDUIT_LOG_LIMIT` | Maximum bytes of log output kept per task (default: 5000000) |
//! | `CONDUIT_NOTIFY_IMAGE` | Plugin image run once after every build as the notifier (default: none) |
//! | `CONDUIT_MACHINE` | Machine name recorded in runner logs (default: hostname or `local`) |
//! | `CONDUIT_NATIVE_ROOT` | Directory holding native local-driver volumes (default: `$TMPDIR/conduit`) |

pub mod canceler;
pub mod engine;
pub mod errors;
pub mod model;
pub mod pipeline;
pub mod pubsub;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod updater;
pub mod webhook;

pub use canceler::Canceler;
pub use engine::native::{NativeConfig, NativeEngine, NativeEngineFactory};
pub use engine::{Engine, EngineError, EngineFactory, LogStream, State};
pub use errors::{ConfigError, StoreError};
pub use model::{Build, Event, Netrc, Repo, Stage, Status, Task, User, Visibility};
pub use pipeline::Config;
pub use runner::{Runner, RunnerConfig, RunnerError, Work};
pub use store::MemoryStore;
pub use updater::{StoreUpdater, Updater};
