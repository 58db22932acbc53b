pub mod exec;
pub mod validate;

use super::args::{Cli, Command};

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Exec(args) => exec::run(args).await,
        Command::Validate(args) => validate::run(&args),
    }
}
