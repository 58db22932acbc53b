use crate::cli::args::ValidateArgs;
use crate::exit_codes;
use anyhow::Context;
use conduit_core::Config;

pub fn run(args: &ValidateArgs) -> anyhow::Result<i32> {
    let config = Config::load(&args.pipeline)
        .with_context(|| format!("invalid pipeline {}", args.pipeline.display()))?;

    for stage in &config.stages {
        println!("{}", stage.name);
        for step in &stage.steps {
            let what = if step.image.is_empty() {
                step.command.join(" ")
            } else {
                step.image.clone()
            };
            println!("  {:<24} {}", step.name, what);
        }
    }
    Ok(exit_codes::SUCCESS)
}
