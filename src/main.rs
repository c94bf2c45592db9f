mod ai_sdk;
mod chat;
mod config;
mod conversation;
mod editor;
mod error;
mod markdown;
mod preview;
mod session;
mod sse;
mod stream;
mod ui;

use chat::ChatController;
use clap::Parser;
use config::Cli;
use preview::PreviewHandle;
use session::{GeminiTransport, SessionFactory};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

fn init_tracing(path: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(&cli.log_path())?;

    let config = cli.chat_config()?;
    tracing::info!(model = %config.model, temperature = config.temperature, "starting kod");

    let transport = GeminiTransport::new(cli.resolve_api_key(), &cli.base_url);
    let factory = SessionFactory::new(config, Arc::new(transport));
    let chat = ChatController::new(factory, cli.on_error.display());

    let preview = if cli.no_preview {
        PreviewHandle::detached().0
    } else {
        preview::spawn(&cli.preview_listen).await?
    };

    let result = ui::run_tui(chat, preview);
    tracing::info!("exiting");
    result
}
