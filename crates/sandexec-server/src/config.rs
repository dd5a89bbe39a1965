//! Command line and environment configuration.
//!
//! Every option is a flag with an environment fallback, so the server can be
//! configured entirely through `SERVER_*` variables in a container.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use sandexec::{
    parse_flag, ExecutionMode, ExecutionSettings, ModuleRegistry, SandboxFault, DEFAULT_MODULES,
};

#[derive(Parser, Debug)]
#[command(
    name = "sandexec-server",
    version,
    about = "Run sandboxed Python snippets and return JSON results"
)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the HTTP API (default)
    Serve,
    /// Execute one request read as JSON from stdin or a file and print the result
    Exec {
        /// Read the request from this file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Import statements naming the modules user code can use
    #[arg(long, env = "SERVER_MODULES", default_value = DEFAULT_MODULES)]
    pub modules: String,

    /// Run code without the sandbox policy (yes/true/t/1)
    #[arg(
        long,
        env = "SERVER_DISABLE_RESTRICTION",
        default_value = "no",
        value_parser = flag_value,
        action = ArgAction::Set
    )]
    pub disable_restriction: bool,

    /// Tracing filter, e.g. `info` or `sandexec=debug`
    #[arg(long = "log-level", env = "SERVER_LOGLEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "SERVER_PORT", default_value_t = 11428)]
    pub port: u16,

    /// Wall-clock limit per call, in milliseconds
    #[arg(long = "timeout-ms", env = "SERVER_TIMEOUT_MS", default_value_t = 30_000)]
    pub timeout_ms: u64,

    /// Captured output limit per call, in bytes
    #[arg(long, env = "SERVER_MAX_OUTPUT_BYTES", default_value_t = 1_048_576)]
    pub max_output_bytes: usize,

    /// Pre-warmed interpreters; 0 builds a fresh interpreter per call
    #[arg(long, env = "SERVER_POOL_SIZE", default_value_t = 2)]
    pub pool_size: usize,

    #[arg(long, env = "SERVER_REWRITE_CACHE_SIZE", default_value_t = 256)]
    pub rewrite_cache_size: usize,
}

fn flag_value(raw: &str) -> Result<bool, String> {
    Ok(parse_flag(raw))
}

impl Config {
    pub fn mode(&self) -> ExecutionMode {
        if self.disable_restriction {
            ExecutionMode::Unrestricted
        } else {
            ExecutionMode::Restricted
        }
    }

    pub fn settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            mode: self.mode(),
            timeout_ns: self.timeout_ms.saturating_mul(1_000_000),
            max_output_bytes: self.max_output_bytes,
            pool_size: self.pool_size,
            rewrite_cache_size: self.rewrite_cache_size,
        }
    }

    pub fn registry(&self) -> Result<ModuleRegistry, SandboxFault> {
        ModuleRegistry::parse(&self.modules)
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|err| anyhow::anyhow!("invalid listen address {addr}: {err}"))
    }
}
