use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use linkshelf_cli::LinkshelfCli;
use linkshelf_sync::{RealtimeFeed, RestGateway, SessionController, StoreConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = LinkshelfCli::parse();
    let config = StoreConfig::from_env().context("failed to load store config")?;
    let gateway = RestGateway::new(&config).context("failed to build row API client")?;
    let feed = RealtimeFeed::new(&config).context("failed to build realtime client")?;
    let controller = SessionController::new(Arc::new(gateway), Arc::new(feed), config.topic.clone());

    let mut stdout = std::io::stdout().lock();
    linkshelf_cli::run(cli, &controller, &mut stdout).await
}
