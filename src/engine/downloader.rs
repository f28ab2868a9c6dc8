// Bounded-concurrency page fetcher — downloads gallery pages in parallel with
// per-page retries, reporting progress as items settle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use reqwest::Client;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct FetcherConfig {
    /// Upper bound on concurrent page downloads. The effective worker count
    /// is clamped to the number of pages.
    pub concurrency: u32,
    /// Retry ceiling per page before the page is given up on.
    pub max_retries_per_item: u32,
    /// Directory page files are written into.
    pub target_dir: PathBuf,
    /// Timeout for one download attempt of one page.
    pub per_item_timeout: Duration,
}

/// Progress event: (pages settled, total pages). A page counts as settled
/// once it has either been written to disk or exhausted its retries.
pub type ProgressSender = mpsc::UnboundedSender<(u16, u16)>;

pub struct PageFetcher {
    client: Client,
    config: FetcherConfig,
    progress: ProgressSender,
    stop_token: CancellationToken,
}

impl PageFetcher {
    pub fn new(config: FetcherConfig, progress: ProgressSender) -> Self {
        Self {
            client: Client::new(),
            config,
            progress,
            stop_token: CancellationToken::new(),
        }
    }

    /// Cooperatively cancel all in-flight and pending page downloads.
    /// Partially written files are left on disk; directory cleanup is the
    /// session's responsibility.
    pub fn stop(&self) {
        self.stop_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Download every URL into the target directory. Resolves once all pages
    /// have been attempted per the retry policy; a page that fails all its
    /// retries is simply left missing. Errors only on fatal setup problems
    /// (target directory creation, worker panics).
    pub async fn run(&self, urls: Vec<String>) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.target_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create download dir {}",
                    self.config.target_dir.display()
                )
            })?;

        let total = progress_total(urls.len());
        let workers = (urls.len().min(self.config.concurrency as usize)).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let settled = Arc::new(AtomicU16::new(0));

        debug!(
            "fetch start: {} pages, {} workers, dir {}",
            total,
            workers,
            self.config.target_dir.display()
        );

        let mut tasks = JoinSet::new();
        for url in urls {
            let client = self.client.clone();
            let semaphore = Arc::clone(&semaphore);
            let settled = Arc::clone(&settled);
            let progress = self.progress.clone();
            let token = self.stop_token.clone();
            let target_dir = self.config.target_dir.clone();
            let max_retries = self.config.max_retries_per_item;
            let timeout = self.config.per_item_timeout;

            tasks.spawn(async move {
                // Bail while queued if stop fires first.
                let _permit = tokio::select! {
                    permit = semaphore.acquire() => match permit {
                        Ok(p) => p,
                        Err(_) => return,
                    },
                    _ = token.cancelled() => {
                        debug!("page {} cancelled while queued", url);
                        return;
                    }
                };

                fetch_page_with_retry(&client, &url, &target_dir, max_retries, timeout, &token)
                    .await;

                let done = settled.fetch_add(1, Ordering::Relaxed) + 1;
                let _ = progress.send((done, total));
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| anyhow!("fetch worker panicked: {}", e))?;
        }

        Ok(())
    }
}

/// Try to download one page, retrying transient failures. A page that still
/// fails after all retries is logged and left missing.
async fn fetch_page_with_retry(
    client: &Client,
    url: &str,
    target_dir: &std::path::Path,
    max_retries: u32,
    timeout: Duration,
    token: &CancellationToken,
) {
    let name = page_basename(url);
    let path = target_dir.join(name);

    for attempt in 0..=max_retries {
        if token.is_cancelled() {
            debug!("page {} cancelled before attempt {}", name, attempt);
            return;
        }

        let fetch = tokio::time::timeout(timeout, fetch_once(client, url, &path));
        let result = tokio::select! {
            r = fetch => r,
            _ = token.cancelled() => {
                debug!("page {} cancelled mid-attempt", name);
                return;
            }
        };

        match result {
            Ok(Ok(bytes)) => {
                debug!("page {} downloaded ({} bytes)", name, bytes);
                return;
            }
            Ok(Err(e)) => {
                if attempt < max_retries {
                    warn!("page {} fetch failed (attempt {}): {}", name, attempt, e);
                } else {
                    warn!(
                        "page {} given up after {} retries: {}",
                        name, max_retries, e
                    );
                }
            }
            Err(_) => {
                if attempt < max_retries {
                    warn!("page {} timed out (attempt {})", name, attempt);
                } else {
                    warn!(
                        "page {} given up after {} retries: timeout",
                        name, max_retries
                    );
                }
            }
        }
    }
}

async fn fetch_once(client: &Client, url: &str, path: &std::path::Path) -> Result<usize> {
    let response = client.get(url).send().await?.error_for_status()?;
    let body: Bytes = response.bytes().await?;
    tokio::fs::write(path, &body).await?;
    Ok(body.len())
}

/// File name a page URL is stored under (its last path segment).
pub fn page_basename(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

/// Progress frames carry u16 counters; a gallery larger than that is clamped
/// rather than left to wrap.
pub fn progress_total(pages: usize) -> u16 {
    pages.min(u16::MAX as usize) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_basename() {
        assert_eq!(
            page_basename("http://img.example/galleries/99/3.png"),
            "3.png"
        );
        assert_eq!(page_basename("3.png"), "3.png");
    }

    #[test]
    fn test_progress_total_clamps_oversized_galleries() {
        assert_eq!(progress_total(0), 0);
        assert_eq!(progress_total(3), 3);
        assert_eq!(progress_total(70_000), u16::MAX);
    }
}
