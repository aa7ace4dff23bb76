// Example: supervise a program until Ctrl-C, waiting for its readiness banner

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use warden::prelude::*;
use warden::readiness::{any_stderr, stdout_contains, wait_until_ready};
use warden::util::logging;

/// Command line arguments for the supervise example
#[derive(Parser, Debug)]
#[command(name = "supervise", about = "Warden process supervision example")]
struct Args {
    /// Path to an optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Substring of stdout that marks the program as ready
    #[arg(short, long, default_value = "Started")]
    ready_marker: String,

    /// Program to supervise
    program: String,

    /// Arguments for the program
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Args::parse();

    let config = match &cli.config {
        Some(path) => SupervisorConfig::load(path)?,
        None => SupervisorConfig::default(),
    };
    logging::init(&config.log_level);

    let manager = Arc::new(ProcessManager::new());

    let command = Command::new(&cli.program).args(cli.args.clone());
    let spec = SpawnSpec::new(&cli.program, command)
        .with_shutdown_timeout(config.shutdown_timeout());

    let process = manager.init_process(spec);
    manager.start(Arc::clone(&process)).await?;
    info!("Spawned {} (pid {:?})", cli.program, process.pid()?);

    // Mirror the child's output while we wait
    let mut tail = process.tail();
    tokio::spawn(async move {
        while let Some(record) = tail.next().await {
            println!("[{:?}] {}", record.source, record.data);
        }
    });

    wait_until_ready(
        &process,
        &config.probe(),
        stdout_contains(cli.ready_marker.clone()),
        any_stderr(),
    )
    .await?;
    info!("{} is ready", cli.program);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    manager.stop_all().await?;

    Ok(())
}
