use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use voicegate::{AppConfig, Server};

/// AudioSocket voice-agent gateway.
#[derive(Parser)]
#[command(name = "voicegate", version)]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;

    let server = Arc::new(Server::new(config)?);

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down server...");
            shutdown.cancel();
        }
    });

    server.run().await
}
