mod cli;
mod config;
mod datastore;
mod diagnostics;
mod docker;
mod env;
mod error;
mod health;
mod launcher;
mod logger;
mod orchestrator;
mod output;
mod ports;
mod preflight;
mod seed;
mod summary;
mod tasks;

use clap::Parser;
use cli::Cli;
use config::RunConfig;
use error::StackError;
use orchestrator::Outcome;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init_cli_logger(cli.verbose);

    match start(&cli).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            output::failure(&format!("{e}"));
            if let StackError::Internal(inner) = &e {
                tracing::debug!("{inner:?}");
            }
            output::next_steps(&e.next_steps(cli.profile.trim()));
            ExitCode::from(1)
        }
    }
}

async fn start(cli: &Cli) -> Result<Outcome, StackError> {
    let tunables = cli.tunables();
    tunables.validate()?;

    let root = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => config::find_project_root(&std::env::current_dir().map_err(anyhow::Error::from)?),
    };
    let profile = config::resolve_profile(&root, &cli.profile)?;

    let cfg = RunConfig {
        root,
        docker_bin: config::resolve_docker_binary(),
        profile,
        tunables,
    };
    orchestrator::run(&cfg).await
}
