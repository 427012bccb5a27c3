mod api;
mod config;
mod dedup;
mod engine;
mod error;
mod health;
mod link;
mod node;
mod session;
mod sources;
mod template;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
  /// Log filter used when RUST_LOG is unset.
  #[arg(long, global = true, default_value = "info")]
  log_level: String,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Collect nodes from links, subscriptions and the input folder, then write the Clash config pair.
  Forge(session::ForgeArgs),

  /// Run the engine on an existing config pair and keep only the nodes that answer.
  Check(session::CheckArgs),

  /// Parse subscription text (links, base64 or Clash YAML) and output node JSONL.
  Parse(session::ParseArgs),
}

// stdout carries JSONL for `parse`, so logs go to stderr
fn init_tracing(level: &str) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .try_init();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(&cli.log_level);
  match cli.command {
    Commands::Forge(args) => session::run_forge(args).await,
    Commands::Check(args) => session::run_check(args).await,
    Commands::Parse(args) => session::run_parse(args).await,
  }
}
