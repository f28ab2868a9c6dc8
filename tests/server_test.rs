// Integration test for the archive retrieval endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use galzip::engine::registry::SessionRegistry;
use galzip::gallery::traits::{Gallery, GallerySource, MetaError};
use galzip::server::handler::AppServer;

/// The retrieval endpoint never touches metadata; a failing stub proves it.
struct NoGallery;

#[async_trait]
impl GallerySource for NoGallery {
    async fn fetch(&self, _id: &str) -> Result<Gallery, MetaError> {
        Err(MetaError::Transport(anyhow!("not used in this test")))
    }
}

const ARCHIVE: &[u8] = b"PK\x05\x06 fake zip payload for range tests";

#[tokio::test]
async fn test_download_endpoint_serves_archives_with_ranges() {
    let root = tempfile::tempdir().unwrap();

    // A finalized session directory, as the session flow would leave it.
    let session_dir = root.path().join("0a1b2c");
    std::fs::create_dir_all(&session_dir).unwrap();
    std::fs::write(session_dir.join("g.zip"), ARCHIVE).unwrap();

    let registry = SessionRegistry::new(
        Arc::new(NoGallery),
        "http://unused".to_string(),
        root.path().to_path_buf(),
        4,
        Duration::from_secs(60),
    );
    let server = AppServer::start(registry, "127.0.0.1:0").await.unwrap();
    let base = format!("http://127.0.0.1:{}", server.port());
    let client = reqwest::Client::new();

    // Full download.
    let resp = client
        .get(format!("{}/download/0a1b2c/g.zip", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/zip"
    );
    assert_eq!(resp.headers().get("accept-ranges").unwrap(), "bytes");
    assert_eq!(resp.bytes().await.unwrap().as_ref(), ARCHIVE);

    // Closed range.
    let resp = client
        .get(format!("{}/download/0a1b2c/g.zip", base))
        .header("Range", "bytes=0-9")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    let content_range = resp
        .headers()
        .get("content-range")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(
        content_range,
        format!("bytes 0-9/{}", ARCHIVE.len())
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), &ARCHIVE[0..10]);

    // Open-ended range.
    let resp = client
        .get(format!("{}/download/0a1b2c/g.zip", base))
        .header("Range", "bytes=10-")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), &ARCHIVE[10..]);

    // Suffix range.
    let resp = client
        .get(format!("{}/download/0a1b2c/g.zip", base))
        .header("Range", "bytes=-5")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 206);
    assert_eq!(
        resp.bytes().await.unwrap().as_ref(),
        &ARCHIVE[ARCHIVE.len() - 5..]
    );

    // Out-of-bounds range.
    let resp = client
        .get(format!("{}/download/0a1b2c/g.zip", base))
        .header("Range", format!("bytes={}-", ARCHIVE.len()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 416);

    // HEAD returns headers only.
    let resp = client
        .head(format!("{}/download/0a1b2c/g.zip", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-length").unwrap().to_str().unwrap(),
        ARCHIVE.len().to_string()
    );

    // Unknown session directory.
    let resp = client
        .get(format!("{}/download/nope/g.zip", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Responses are tagged.
    let resp = client.get(format!("{}/", base)).send().await.unwrap();
    assert!(resp
        .headers()
        .get("x-powered-by")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("galzip"));

    // Archive retrieval never spawns download sessions.
    assert_eq!(server.registry().session_count(), 0);

    server.shutdown();
}
