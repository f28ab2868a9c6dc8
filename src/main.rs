use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use galzip::config::{ServerConfig, CLEANUP_GRACE};
use galzip::engine::registry::SessionRegistry;
use galzip::gallery::http_client::HttpGallerySource;
use galzip::server::handler::AppServer;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = ServerConfig::from_env()?;

    // Nothing in the downloads root survives a restart; start from scratch.
    let _ = tokio::fs::remove_dir_all(&config.download_dir).await;
    tokio::fs::create_dir_all(&config.download_dir).await?;

    let gallery = Arc::new(HttpGallerySource::new(&config.api_url));
    let registry = SessionRegistry::new(
        gallery,
        config.image_url.clone(),
        config.download_dir.clone(),
        config.concurrent_downloads,
        CLEANUP_GRACE,
    );

    let server = AppServer::start(registry, &format!("0.0.0.0:{}", config.port)).await?;
    info!("galzip listening on {}:{}", config.host, server.port());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown();
    Ok(())
}
