use anyhow::{Context, Result};
use clap::Parser;
use souk::{cli_args, config, infra::telemetry, run_souk};
use std::process::ExitCode;
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "Fatal error");
            eprintln!("Fatal error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = cli_args::parse();
    let settings = config::Settings::load(&args.config).context("load configuration")?;
    let _guard = telemetry::init(&settings.config.logs_dir);

    info!("Starting");

    run_souk(&settings, &args).await
}
