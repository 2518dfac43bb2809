//! Symdex CLI entry point

use std::process::ExitCode;

use clap::Parser;

use symdex_engine::api::Engine;
use symdex_engine::cli::{Cli, Command};
use symdex_engine::commands;
use symdex_engine::config::EngineConfig;
use symdex_engine::EngineError;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(output) => {
            println!("{}", output);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

async fn run() -> symdex_engine::Result<String> {
    let cli = Cli::parse();

    let mut config = EngineConfig::default();
    config.extractor_path = cli.extractor.clone();

    let root = cli
        .workspace
        .canonicalize()
        .map_err(|e| EngineError::NotFound {
            what: format!("workspace root {}: {}", cli.workspace.display(), e),
        })?;
    let engine = Engine::bootstrap(&root, config).await?;

    match &cli.command {
        Command::Register => commands::run_register(&engine, cli.format),
        Command::Index { repo } => commands::run_index(&engine, repo, cli.format).await,
        Command::Query(query) => commands::run_query(&engine, query, cli.format).await,
        Command::Overlay(overlay) => commands::run_overlay(&engine, overlay, cli.format).await,
        Command::Sync { repo, sha } => commands::run_sync(&engine, repo, sha, cli.format).await,
        Command::Job { job_id } => commands::run_job(&engine, job_id, cli.format),
        Command::Gc => commands::run_gc(&engine, cli.format).await,
        Command::Health => commands::run_health(&engine, cli.format),
    }
}
