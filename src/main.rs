use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use engram::config::EngramConfig;
use engram::server;

#[derive(Parser)]
#[command(name = "engram", version, about = "Persistent memory engine for conversational assistants (MCP server)")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server (stdio transport)
    Serve,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngramConfig::load()?;

    // Log to stderr so stdout stays clean for MCP JSON-RPC.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.background.max_workers.max(1))
        .enable_all()
        .build()?;

    match cli.command {
        Command::Serve => {
            runtime.block_on(server::serve_stdio(config))?;
        }
    }

    Ok(())
}
