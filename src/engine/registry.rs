// Session registry — single-flight keyed store for download sessions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::gallery::traits::GallerySource;

use super::broadcast::EventSender;
use super::cleanup;
use super::session::DownloadSession;

/// Stable content key for a gallery id. Derived from the id alone so
/// independent requesters for the same gallery share one session.
pub fn content_key(id: &str) -> String {
    format!("{:x}", md5::compute(id))
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<DownloadSession>>>,
    pub gallery: Arc<dyn GallerySource>,
    pub image_host: String,
    pub downloads_root: PathBuf,
    pub concurrency: u32,
    /// Grace window after last detach (or completion) before teardown.
    pub grace: Duration,
}

impl SessionRegistry {
    pub fn new(
        gallery: Arc<dyn GallerySource>,
        image_host: String,
        downloads_root: PathBuf,
        concurrency: u32,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            gallery,
            image_host,
            downloads_root,
            concurrency,
            grace,
        })
    }

    /// Find or create the session for `id`, attach a subscriber, and replay
    /// any cached frames to it. Starts the fetch-and-pack flow exactly once,
    /// when the session is first created. Returns the session and the
    /// subscriber id for a later `detach`.
    pub fn attach(self: &Arc<Self>, id: &str, tx: EventSender) -> (Arc<DownloadSession>, u64) {
        let key = content_key(id);

        let (session, created) = {
            let mut sessions = self.sessions.lock();
            match sessions.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let session = Arc::new(DownloadSession::new(
                        id,
                        key.clone(),
                        self.downloads_root.join(&key),
                    ));
                    sessions.insert(key, Arc::clone(&session));
                    (session, true)
                }
            }
        };

        // A reconnect within the grace window keeps the session alive.
        cleanup::cancel(&session);

        let subscriber_id = session.broadcast.attach(tx);
        info!(
            "subscriber {} joined session {} in {:?} ({} attached)",
            subscriber_id,
            session.key,
            session.state(),
            session.broadcast.subscriber_count()
        );

        if created {
            let flow_session = Arc::clone(&session);
            let registry = Arc::clone(self);
            tokio::spawn(flow_session.run(registry));
        }

        (session, subscriber_id)
    }

    /// Remove a subscriber. An unfinished session left with no subscribers
    /// gets a teardown deadline; it is only acted on if nobody reattaches
    /// within the grace window.
    pub fn detach(self: &Arc<Self>, session: &Arc<DownloadSession>, subscriber_id: u64) {
        let remaining = session.broadcast.detach(subscriber_id);
        info!(
            "subscriber {} left session {} ({} attached)",
            subscriber_id, session.key, remaining
        );

        if remaining == 0 && !session.cleanup_pending() {
            cleanup::schedule(Arc::clone(self), Arc::clone(session), self.grace);
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<DownloadSession>> {
        self.sessions.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<DownloadSession>> {
        self.sessions.lock().remove(key)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_key_is_stable_and_id_only() {
        let a = content_key("228922");
        let b = content_key("228922");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, content_key("228923"));
    }
}
