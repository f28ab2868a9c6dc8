// Gallery session state machine — drives one gallery's fetch, pack, and
// publish pipeline and owns its on-disk directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{FLOW_MAX_ATTEMPTS, PAGE_MAX_RETRIES, PAGE_TIMEOUT};
use crate::gallery::naming::{archive_filename, page_urls};
use crate::gallery::traits::MetaError;

use super::archive;
use super::broadcast::{Broadcaster, CloseReason};
use super::cleanup;
use super::downloader::{page_basename, progress_total, FetcherConfig, PageFetcher};
use super::frame::Frame;
use super::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    FetchingMetadata,
    Downloading,
    Packing,
    Completed,
    Failed,
}

/// Terminal failure taxonomy. Abort-by-cleanup is deliberately absent: that
/// path is silent and never reported to clients as an error.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("gallery not found")]
    MetadataNotFound,
    #[error("metadata fetch failed: {0}")]
    MetadataTransport(#[source] anyhow::Error),
    #[error("download failed after {0} attempts")]
    DownloadExhausted(u32),
    #[error("packing failed: {0}")]
    PackFailure(String),
}

pub struct DownloadSession {
    /// Source gallery identifier as requested by the client.
    pub id: String,
    /// Content key: md5 of `id`. Never changes after construction.
    pub key: String,
    /// Session directory, exclusively owned by this session until cleanup.
    pub dir: PathBuf,
    pub broadcast: Broadcaster,
    state: Mutex<SessionState>,
    fetcher: Mutex<Option<Arc<PageFetcher>>>,
    completed: AtomicBool,
    /// Whole-flow download attempts started, capped by `FLOW_MAX_ATTEMPTS`.
    download_attempts: AtomicU32,
    /// Single source of truth for "this session is being torn down".
    abort: CancellationToken,
    filename: OnceLock<String>,
    cleanup_handle: Mutex<Option<CancellationToken>>,
}

impl DownloadSession {
    pub fn new(id: &str, key: String, dir: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            key,
            dir,
            broadcast: Broadcaster::new(),
            state: Mutex::new(SessionState::Idle),
            fetcher: Mutex::new(None),
            completed: AtomicBool::new(false),
            download_attempts: AtomicU32::new(0),
            abort: CancellationToken::new(),
            filename: OnceLock::new(),
            cleanup_handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Relaxed)
    }

    /// How many whole-flow download attempts have started.
    pub fn download_attempts(&self) -> u32 {
        self.download_attempts.load(Ordering::Relaxed)
    }

    pub fn is_aborting(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Begin teardown. Set-once; repeated calls are no-ops.
    pub fn mark_aborting(&self) {
        self.abort.cancel();
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.get().map(String::as_str)
    }

    /// Take the in-flight fetcher handle, if any.
    pub(crate) fn take_fetcher(&self) -> Option<Arc<PageFetcher>> {
        self.fetcher.lock().take()
    }

    pub(crate) fn fetcher_active(&self) -> bool {
        self.fetcher.lock().is_some()
    }

    /// Install a new cleanup token, returning the one it replaces.
    pub(crate) fn set_cleanup(&self, token: CancellationToken) -> Option<CancellationToken> {
        self.cleanup_handle.lock().replace(token)
    }

    pub(crate) fn take_cleanup(&self) -> Option<CancellationToken> {
        self.cleanup_handle.lock().take()
    }

    pub fn cleanup_pending(&self) -> bool {
        self.cleanup_handle.lock().is_some()
    }

    /// Drive the whole flow: metadata, download attempts, packing, publish.
    /// Spawned exactly once per session, by the registry that created it.
    pub(crate) async fn run(self: Arc<Self>, registry: Arc<SessionRegistry>) {
        self.set_state(SessionState::FetchingMetadata);

        // Single metadata attempt, no retry at this layer.
        let gallery = match registry.gallery.fetch(&self.id).await {
            Ok(g) => g,
            Err(MetaError::NotFound) => {
                self.fail(&registry, FlowError::MetadataNotFound).await;
                return;
            }
            Err(MetaError::Transport(e)) => {
                self.fail(&registry, FlowError::MetadataTransport(e)).await;
                return;
            }
        };

        let urls = page_urls(&registry.image_host, &gallery);
        let page_names: Vec<String> = urls
            .iter()
            .map(|u| page_basename(u).to_string())
            .collect();
        let total = progress_total(urls.len());

        let filename = archive_filename(gallery.id, &gallery.title);
        let _ = self.filename.set(filename.clone());

        info!(
            "download start: gallery {} ({} pages) as {}",
            gallery.id,
            urls.len(),
            filename
        );

        // Progress events from fetcher workers are funneled through one
        // channel and re-broadcast from this task, so subscriber state is
        // only ever touched from here.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let fetcher = Arc::new(PageFetcher::new(
            FetcherConfig {
                concurrency: registry.concurrency,
                max_retries_per_item: PAGE_MAX_RETRIES,
                target_dir: self.dir.clone(),
                per_item_timeout: PAGE_TIMEOUT,
            },
            progress_tx,
        ));
        *self.fetcher.lock() = Some(Arc::clone(&fetcher));

        let forward = Arc::clone(&self);
        tokio::spawn(async move {
            while let Some((completed, total)) = progress_rx.recv().await {
                forward
                    .broadcast
                    .broadcast(Frame::DownloadProgress { completed, total });
            }
        });

        self.set_state(SessionState::Downloading);

        let mut downloaded = false;
        for attempt in 1..=FLOW_MAX_ATTEMPTS {
            if self.is_aborting() {
                break;
            }
            self.download_attempts.fetch_add(1, Ordering::Relaxed);
            match fetcher.run(urls.clone()).await {
                Ok(()) => {
                    downloaded = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        "gallery {} download attempt {}/{} failed: {}",
                        gallery.id, attempt, FLOW_MAX_ATTEMPTS, e
                    );
                }
            }
        }

        if self.is_aborting() {
            // Torn down by cleanup while fetching. Silent by design: no
            // failure frame, the cleanup task owns directory and registry.
            debug!("session {} aborted during download", self.key);
            self.take_fetcher();
            return;
        }

        if !downloaded {
            self.fail(&registry, FlowError::DownloadExhausted(FLOW_MAX_ATTEMPTS))
                .await;
            return;
        }

        // Packing happens once; it is never retried.
        self.set_state(SessionState::Packing);
        self.broadcast.broadcast(Frame::PackProgress {
            completed: 0,
            total,
        });

        let survivors = archive::surviving_pages(&self.dir, &page_names);
        if survivors.is_empty() {
            self.fail(
                &registry,
                FlowError::PackFailure("no pages survived download".to_string()),
            )
            .await;
            return;
        }
        if survivors.len() < page_names.len() {
            warn!(
                "gallery {}: {} of {} pages missing, packing the rest",
                gallery.id,
                page_names.len() - survivors.len(),
                page_names.len()
            );
        }

        if let Err(e) = archive::pack(&self.dir, survivors, &filename).await {
            self.fail(&registry, FlowError::PackFailure(e.to_string()))
                .await;
            return;
        }

        if self.is_aborting() {
            debug!("session {} aborted during packing", self.key);
            self.take_fetcher();
            return;
        }

        // Publish.
        self.completed.store(true, Ordering::Relaxed);
        self.set_state(SessionState::Completed);
        self.take_fetcher();

        self.broadcast.broadcast(Frame::Result {
            path: format!("/download/{}/{}", self.key, filename),
        });
        self.broadcast.close_all(CloseReason::Done);

        self.remove_residual_files(&filename).await;
        cleanup::schedule(Arc::clone(&registry), Arc::clone(&self), registry.grace);

        info!("download end: gallery {} ({})", gallery.id, self.key);
    }

    /// Terminal failure: one frame, close subscribers, reclaim everything.
    /// Idempotent through the abort token, so a failure racing cleanup
    /// collapses into a single effect.
    async fn fail(self: &Arc<Self>, registry: &Arc<SessionRegistry>, flow_error: FlowError) {
        if self.is_aborting() {
            debug!(
                "session {} already tearing down, ignoring: {}",
                self.key, flow_error
            );
            return;
        }
        self.mark_aborting();
        self.set_state(SessionState::Failed);
        error!("session {} failed: {}", self.key, flow_error);

        match &flow_error {
            // Not-found is signalled by the close code alone.
            FlowError::MetadataNotFound => {}
            FlowError::MetadataTransport(_) | FlowError::DownloadExhausted(_) => {
                self.broadcast.broadcast(Frame::DownloadError);
            }
            FlowError::PackFailure(_) => {
                self.broadcast.broadcast(Frame::PackError);
            }
        }

        let reason = match flow_error {
            FlowError::MetadataNotFound => CloseReason::NotFound,
            _ => CloseReason::Error,
        };
        self.broadcast.close_all(reason);

        if let Some(fetcher) = self.take_fetcher() {
            fetcher.stop();
        }

        // No grace period on failure: reclaim disk and registry entry now.
        cleanup::cancel(self);
        cleanup::remove_dir_retrying(&self.dir).await;
        registry.remove(&self.key);
    }

    /// Delete everything in the session directory except the final archive.
    async fn remove_residual_files(&self, keep: &str) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) => {
                warn!("residual sweep of {} failed: {}", self.dir.display(), e);
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy() != keep {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!("failed to remove {}: {}", entry.path().display(), e);
                }
            }
        }
    }
}
