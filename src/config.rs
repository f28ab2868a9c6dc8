use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

/// Grace window before an idle or completed session is torn down (5 minutes).
pub const CLEANUP_GRACE: Duration = Duration::from_secs(300);

/// Number of whole-flow download attempts before giving up on a gallery.
pub const FLOW_MAX_ATTEMPTS: u32 = 3;

/// Per-page retry ceiling inside the fetcher.
pub const PAGE_MAX_RETRIES: u32 = 10;

/// Timeout for a single page download attempt.
pub const PAGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on concurrent page downloads per session.
pub const DEFAULT_CONCURRENT_DOWNLOADS: u32 = 16;

/// Maximum UTF-8 byte length for a derived archive filename.
pub const MAX_FILENAME_BYTES: usize = 255;

/// Attempts at removing a session directory (transient OS file locks).
pub const DIR_REMOVE_ATTEMPTS: u32 = 3;

/// Spacing between session directory removal attempts.
pub const DIR_REMOVE_BACKOFF: Duration = Duration::from_millis(100);

/// Top-level server configuration, read from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Public hostname, used for logging only.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Base URL of the gallery metadata API.
    pub api_url: String,
    /// Base URL of the image host.
    pub image_url: String,
    /// Maximum concurrent page downloads per session.
    pub concurrent_downloads: u32,
    /// Root directory for per-session download folders.
    pub download_dir: PathBuf,
}

impl ServerConfig {
    /// Read configuration from the environment. `API_URL` and `IMAGE_URL`
    /// are required; everything else has a default.
    pub fn from_env() -> Result<Self> {
        let api_url = env::var("API_URL").map_err(|_| anyhow!("API_URL is not defined"))?;
        let image_url = env::var("IMAGE_URL").map_err(|_| anyhow!("IMAGE_URL is not defined"))?;

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "http://localhost".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            api_url,
            image_url,
            concurrent_downloads: env::var("CONCURRENT_IMAGE_DOWNLOADS")
                .ok()
                .and_then(|c| c.parse().ok())
                .unwrap_or(DEFAULT_CONCURRENT_DOWNLOADS),
            download_dir: env::var("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("cache/downloads")),
        })
    }
}
