use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use llm_relay::gateway::observability::init_tracing;
use llm_relay::gateway::{RelayConfig, RelayRuntime, SqliteStore};

/// OpenAI-compatible relay with per-token quota accounting.
#[derive(Parser, Debug)]
#[command(name = "llm-relay", version)]
struct Cli {
    /// TOML config file; environment variables override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the relay HTTP API (default)
    Serve {
        /// Listen address, overriding the config
        #[arg(long)]
        listen: Option<String>,
    },
    /// Fetch a channel's upstream model list and store it with prices
    ImportModels {
        #[arg(long)]
        channel_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let config = RelayConfig::load(cli.config.as_deref())?;
    init_tracing(config.json_logs)?;

    let store = SqliteStore::new(config.sqlite_path.clone());
    store.init().await?;
    let store = Arc::new(store);

    match cli.command.unwrap_or(Command::Serve { listen: None }) {
        Command::Serve { listen } => {
            let listen = listen.unwrap_or_else(|| config.listen.clone());
            let runtime = RelayRuntime::build(config, store).await?;
            let app = runtime.router();

            let listener = tokio::net::TcpListener::bind(&listen).await?;
            tracing::info!(%listen, "llm-relay listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        Command::ImportModels { channel_id } => {
            let runtime = RelayRuntime::build(config, store).await?;
            let imported = runtime.relay().import_models(channel_id).await?;
            println!("imported {imported} models for channel {channel_id}");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
