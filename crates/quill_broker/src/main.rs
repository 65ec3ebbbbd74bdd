// Quill broker binary entry point.

use std::io::IsTerminal;

use clap::{Parser, Subcommand};
use quill_broker::NodeArgs;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "quill-broker")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Node(NodeArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Node(args) => quill_broker::run_node_with_shutdown(args, tokio::signal::ctrl_c()).await,
    }
}
