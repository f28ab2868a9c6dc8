// Integration tests for the bounded page fetcher against a fake image host.

use std::time::Duration;

use axum::{extract::Path, http::StatusCode, response::IntoResponse, routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use galzip::engine::downloader::{FetcherConfig, PageFetcher};

/// Fake image host: serves deterministic bytes per page, 404 for pages
/// named `missing.*`.
async fn fake_page_handler(Path((_media, page)): Path<(String, String)>) -> impl IntoResponse {
    if page.starts_with("missing") {
        return (StatusCode::NOT_FOUND, Vec::<u8>::new()).into_response();
    }
    let body: Vec<u8> = page.bytes().cycle().take(512).collect();
    (StatusCode::OK, body).into_response()
}

async fn start_fake_host() -> String {
    let app = Router::new().route("/galleries/{media}/{page}", get(fake_page_handler));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://127.0.0.1:{}", port)
}

fn fetcher_config(dir: &std::path::Path, concurrency: u32, retries: u32) -> FetcherConfig {
    FetcherConfig {
        concurrency,
        max_retries_per_item: retries,
        target_dir: dir.to_path_buf(),
        per_item_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_fetch_writes_all_pages_and_reports_progress() {
    let host = start_fake_host().await;
    let dir = tempfile::tempdir().unwrap();

    let urls = vec![
        format!("{}/galleries/99/1.jpg", host),
        format!("{}/galleries/99/2.webp", host),
        format!("{}/galleries/99/3.png", host),
    ];

    let (tx, mut rx) = mpsc::unbounded_channel();
    let fetcher = PageFetcher::new(fetcher_config(dir.path(), 4, 2), tx);
    fetcher.run(urls).await.unwrap();

    for name in ["1.jpg", "2.webp", "3.png"] {
        let path = dir.path().join(name);
        assert!(path.is_file(), "{} should exist", name);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 512);
    }

    // One progress event per settled page, counts strictly increasing.
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 3);
    assert_eq!(events.last(), Some(&(3, 3)));
    for window in events.windows(2) {
        assert!(window[0].0 < window[1].0);
        assert_eq!(window[0].1, 3);
    }
}

#[tokio::test]
async fn test_failed_page_is_left_missing_without_failing_the_run() {
    let host = start_fake_host().await;
    let dir = tempfile::tempdir().unwrap();

    let urls = vec![
        format!("{}/galleries/99/1.jpg", host),
        format!("{}/galleries/99/missing.webp", host),
        format!("{}/galleries/99/3.png", host),
    ];

    let (tx, mut rx) = mpsc::unbounded_channel();
    let fetcher = PageFetcher::new(fetcher_config(dir.path(), 4, 1), tx);
    fetcher.run(urls).await.unwrap();

    assert!(dir.path().join("1.jpg").is_file());
    assert!(dir.path().join("3.png").is_file());
    assert!(!dir.path().join("missing.webp").exists());

    // The missing page still settles, so progress reaches the total.
    let mut last = (0, 0);
    while let Ok(event) = rx.try_recv() {
        last = event;
    }
    assert_eq!(last, (3, 3));
}

#[tokio::test]
async fn test_run_fails_when_target_dir_cannot_be_created() {
    let host = start_fake_host().await;
    let dir = tempfile::tempdir().unwrap();

    // A file where the target directory should go.
    let blocked = dir.path().join("blocked");
    std::fs::write(&blocked, b"x").unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let fetcher = PageFetcher::new(fetcher_config(&blocked, 4, 1), tx);
    let result = fetcher.run(vec![format!("{}/galleries/99/1.jpg", host)]).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_stop_is_cooperative_and_prompt() {
    // Upstream that never responds within the test window.
    async fn slow_handler() -> impl IntoResponse {
        tokio::time::sleep(Duration::from_secs(60)).await;
        StatusCode::OK
    }
    let app = Router::new().route("/galleries/{media}/{page}", get(slow_handler));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    let dir = tempfile::tempdir().unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let fetcher = std::sync::Arc::new(PageFetcher::new(
        FetcherConfig {
            concurrency: 2,
            max_retries_per_item: 10,
            target_dir: dir.path().to_path_buf(),
            per_item_timeout: Duration::from_secs(30),
        },
        tx,
    ));

    let urls = vec![format!("http://127.0.0.1:{}/galleries/99/1.jpg", port)];
    let run_fetcher = std::sync::Arc::clone(&fetcher);
    let run = tokio::spawn(async move { run_fetcher.run(urls).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    fetcher.stop();
    assert!(fetcher.is_stopped());

    let result = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("run should settle promptly after stop")
        .unwrap();
    assert!(result.is_ok());
}
