//! Xiaozhi Core - real-time IoT voice-assistant dialogue engine

use std::sync::Arc;

use clap::{Parser, Subcommand};
use xiaozhi_core::config::Config;

#[derive(Parser)]
#[command(name = "xiaozhi-core", about = "Real-time conversational core for an IoT voice-assistant backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the WebSocket dialogue server (default if no subcommand given)
    Serve,
    /// Store the OpenRouter API key in the OS keyring
    SetApiKey {
        /// The OpenRouter API key
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let config = Arc::new(Config::load()?);
            xiaozhi_core::start_server(config).await
        }
        Command::SetApiKey { key } => xiaozhi_core::config::set_api_key(&key),
    }
}
