mod cli;
mod commands;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use taskwarden_core::TaskwardenConfig;
use taskwarden_engine::Engine;
use taskwarden_store::Database;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "taskwarden=info,taskwarden_engine=info,taskwarden_store=info".into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = TaskwardenConfig::load(cli.config.as_deref()).context("loading config")?;
    let db = Database::open(&config.database.path)
        .with_context(|| format!("opening database {}", config.database.path))?;
    info!(path = %config.database.path, "database opened");

    let engine = Engine::from_config(db, &config).context("starting engine")?;
    commands::execute(cli, engine).await
}
