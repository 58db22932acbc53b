use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "conduit",
    version,
    about = "Run CI pipelines locally on native processes"
)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "CONDUIT_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Execute a pipeline file as one build
    Exec(ExecArgs),
    /// Parse and validate a pipeline file without running it
    Validate(ValidateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    /// Pipeline definition (YAML)
    pub pipeline: PathBuf,

    /// Repository slug recorded on the build
    #[arg(long, default_value = "local/pipeline")]
    pub repo: String,

    /// Git ref recorded on the build
    #[arg(long = "ref", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Per-step timeout in minutes (the runner adds its buffer)
    #[arg(long, default_value_t = 60)]
    pub timeout: i64,

    /// Directory for volumes and step working directories
    #[arg(long, env = "CONDUIT_NATIVE_ROOT")]
    pub root: Option<PathBuf>,

    /// Do not pass this process's environment to steps
    #[arg(long)]
    pub clean_env: bool,

    /// Webhook endpoint notified on cancellation (repeatable)
    #[arg(long = "webhook")]
    pub webhooks: Vec<String>,

    /// Plugin image run once after the build with its payload, e.g. plugins/slack
    #[arg(long, env = "CONDUIT_NOTIFY_IMAGE")]
    pub notify_image: Option<String>,

    /// Print each task's captured output after the run
    #[arg(long)]
    pub print_logs: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// Pipeline definition (YAML)
    pub pipeline: PathBuf,
}
