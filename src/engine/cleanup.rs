// Deferred session teardown — one cancellable deadline per session.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DIR_REMOVE_ATTEMPTS, DIR_REMOVE_BACKOFF};

use super::broadcast::CloseReason;
use super::registry::SessionRegistry;
use super::session::DownloadSession;

/// Arm a teardown deadline for the session, replacing any prior pending one.
pub fn schedule(
    registry: Arc<SessionRegistry>,
    session: Arc<DownloadSession>,
    after: Duration,
) {
    let token = CancellationToken::new();
    if let Some(previous) = session.set_cleanup(token.clone()) {
        previous.cancel();
    }
    debug!(
        "session {} teardown scheduled in {:?}",
        session.key, after
    );

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(after) => {}
            _ = token.cancelled() => return,
        }
        // A cancel racing the deadline wins if it landed before this point.
        if token.is_cancelled() {
            return;
        }
        fire(registry, session).await;
    });
}

/// Disarm any pending teardown. Idempotent.
pub fn cancel(session: &DownloadSession) {
    if let Some(token) = session.take_cleanup() {
        token.cancel();
    }
}

/// The deadline elapsed: stop any in-flight fetch, reclaim the directory,
/// and drop the session from the registry. This is the only path that
/// reclaims disk space for abandoned or idle-but-complete sessions.
async fn fire(registry: Arc<SessionRegistry>, session: Arc<DownloadSession>) {
    // Deregister first so a client attaching mid-teardown gets a fresh
    // session instead of joining this one.
    registry.remove(&session.key);

    if session.fetcher_active() {
        // Stopping is cooperative; the fetch task observes the abort flag
        // and exits silently. Directory deletion below is the actual
        // guarantee for partially written files.
        session.mark_aborting();
        if let Some(fetcher) = session.take_fetcher() {
            fetcher.stop();
        }
    }

    remove_dir_retrying(&session.dir).await;

    // Anyone who slipped in before deregistration is closed out; the
    // archive (if any) is gone now, and with it the replay cache.
    let reason = if session.broadcast.has_result() {
        CloseReason::Done
    } else {
        CloseReason::Error
    };
    session.broadcast.close_all(reason);
    session.broadcast.clear_cache();
    session.take_cleanup();
    info!("session {} reclaimed", session.key);
}

/// Delete a session directory, retrying a few times to ride out transient
/// OS-level file locks.
pub async fn remove_dir_retrying(dir: &Path) {
    for attempt in 1..=DIR_REMOVE_ATTEMPTS {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => return,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                if attempt < DIR_REMOVE_ATTEMPTS {
                    warn!(
                        "failed to remove {} (attempt {}): {}",
                        dir.display(),
                        attempt,
                        e
                    );
                    tokio::time::sleep(DIR_REMOVE_BACKOFF).await;
                } else {
                    error!(
                        "giving up removing {} after {} attempts: {}",
                        dir.display(),
                        DIR_REMOVE_ATTEMPTS,
                        e
                    );
                }
            }
        }
    }
}
