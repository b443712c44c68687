//! TaskPilot CLI — the main entry point.
//!
//! Commands:
//! - `serve`   — Start the HTTP API server
//! - `run`     — Execute one task in-process and stream its events
//! - `memory`  — Show or clear session memory
//! - `config`  — Print the effective configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "taskpilot",
    about = "TaskPilot — step-bounded coding agent over a sandboxed workspace",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Override the bind address
        #[arg(long)]
        host: Option<String>,

        /// Directory that relative request workspaces resolve against
        #[arg(long)]
        base_workspace: Option<PathBuf>,
    },

    /// Run a single task and print its events
    Run(commands::run::RunArgs),

    /// Inspect or clear session memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Print remembered runs, oldest first
    Show {
        /// Maximum entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Forget all remembered runs
    Clear,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }

    match cli.command {
        Commands::Serve {
            port,
            host,
            base_workspace,
        } => commands::serve::run(port, host, base_workspace).await?,
        Commands::Run(args) => commands::run::run(args).await?,
        Commands::Memory { action } => match action {
            MemoryAction::Show { limit } => commands::memory::show(limit).await?,
            MemoryAction::Clear => commands::memory::clear().await?,
        },
        Commands::Config => commands::config_cmd::show().await?,
    }

    Ok(())
}
