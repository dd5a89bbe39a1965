mod config;
mod routes;

use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sandexec::{ExecutionRequest, Executor};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Command, Config};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.config.log_level);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&cli.config),
        Command::Exec { file } => exec_once(&cli.config, file.as_deref()),
    }
}

/// Logs go to stderr so `exec` output on stdout stays machine-readable.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|err| {
        eprintln!("invalid log filter {level:?} ({err}), using \"info\"");
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn serve(config: &Config) -> anyhow::Result<()> {
    let addr = config.addr()?;
    let registry = config.registry().context("invalid SERVER_MODULES")?;
    let executor = Executor::new(registry, config.settings()).context("failed to start executor")?;
    executor
        .verify_modules()
        .context("module configuration failed verification")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;
    runtime.block_on(routes::serve(addr, Arc::new(executor)))
}

/// Runs one request and prints the response, or the fault payload, as JSON.
/// A fault is still a successful run of this command.
fn exec_once(config: &Config, file: Option<&Path>) -> anyhow::Result<()> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };
    let request: ExecutionRequest =
        serde_json::from_str(&raw).context("request is not valid JSON")?;

    let settings = sandexec::ExecutionSettings {
        pool_size: 0,
        ..config.settings()
    };
    let registry = config.registry().context("invalid SERVER_MODULES")?;
    let executor = Executor::new(registry, settings).context("failed to start executor")?;

    let output = match executor.execute(&request) {
        Ok(response) => serde_json::to_string(&response)?,
        Err(fault) => serde_json::to_string(&fault.payload())?,
    };
    println!("{output}");
    Ok(())
}
