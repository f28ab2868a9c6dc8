// Axum request handlers — realtime download channel and archive retrieval.

use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::broadcast::{CloseReason, SocketEvent};
use crate::engine::registry::SessionRegistry;

pub struct AppServer {
    port: u16,
    registry: Arc<SessionRegistry>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl AppServer {
    /// Bind `addr` and start serving, returning a handle.
    pub async fn start(registry: Arc<SessionRegistry>, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = Router::new()
            .route("/", get(|| async { "galzip" }))
            .route("/ws/g/{id}", get(ws_handler))
            .route(
                "/download/{hash}/{file}",
                get(download_handler).head(download_head_handler),
            )
            .layer(middleware::from_fn(tag_and_log))
            .with_state(registry.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            port,
            registry,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Shutdown the server gracefully.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Response tagging and per-request logging middleware.
async fn tag_and_log(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let mut response = next.run(req).await;
    response.headers_mut().insert(
        "x-powered-by",
        HeaderValue::from_static(concat!("galzip ", env!("CARGO_PKG_VERSION"))),
    );
    info!("{} {} {}", method, path, response.status().as_u16());
    response
}

/// GET /ws/g/{id} — realtime channel for one gallery download.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(registry): State<Arc<SessionRegistry>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, registry, id))
}

fn close_frame(reason: CloseReason) -> CloseFrame {
    let (code, text) = match reason {
        CloseReason::Done => (1000, ""),
        CloseReason::NotFound => (1008, "Resource Not Found"),
        CloseReason::Error => (1011, "Internal Server Error"),
    };
    CloseFrame {
        code,
        reason: text.into(),
    }
}

async fn handle_socket(socket: WebSocket, registry: Arc<SessionRegistry>, id: String) {
    let (tx, mut rx) = mpsc::unbounded_channel::<SocketEvent>();
    let (session, subscriber_id) = registry.attach(&id, tx);

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Forward session events to the socket until the session closes us or
    // the send side fails.
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SocketEvent::Frame(frame) => {
                    let message = Message::Binary(frame.encode().into());
                    if ws_tx.send(message).await.is_err() {
                        debug!("websocket send failed, client gone");
                        break;
                    }
                }
                SocketEvent::Close(reason) => {
                    let _ = ws_tx
                        .send(Message::Close(Some(close_frame(reason))))
                        .await;
                    break;
                }
            }
        }
    });

    // No inbound messages are expected; drain until the client disconnects.
    while let Some(received) = ws_rx.next().await {
        match received {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("websocket receive error: {}", e);
                break;
            }
        }
    }

    registry.detach(&session, subscriber_id);
    send_task.abort();
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedRange {
    StartEnd {
        start: u64,
        end_inclusive: Option<u64>,
    },
    Suffix {
        len: u64,
    },
}

/// Parse a Range header value.
/// Supports:
/// - bytes=start-end
/// - bytes=start-
/// - bytes=-suffix_len
fn parse_range_header(value: &str) -> Option<ParsedRange> {
    let value = value.trim();
    let rest = value.strip_prefix("bytes=")?;
    let mut parts = rest.splitn(2, '-');
    let start_str = parts.next()?.trim();
    let end_str = parts.next()?.trim();

    if start_str.is_empty() {
        let len: u64 = end_str.parse().ok()?;
        if len == 0 {
            return None;
        }
        Some(ParsedRange::Suffix { len })
    } else {
        let start: u64 = start_str.parse().ok()?;
        let end_inclusive = if end_str.is_empty() {
            None
        } else {
            Some(end_str.parse::<u64>().ok()?)
        };
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive,
        })
    }
}

/// Resolve the on-disk path for a retrieval request, rejecting anything
/// that could escape the session directory.
fn archive_path(
    registry: &SessionRegistry,
    hash: &str,
    file: &str,
) -> Option<std::path::PathBuf> {
    if hash.contains("..") || hash.contains('/') || file.contains("..") || file.contains('/') {
        return None;
    }
    Some(registry.downloads_root.join(hash).join(file))
}

fn common_headers(file: &str, total: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_LENGTH,
        total.to_string().parse().expect("numeric header"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers
}

/// GET /download/{hash}/{file} — serve a finalized archive with Range
/// support, until cleanup removes the session directory.
async fn download_handler(
    State(registry): State<Arc<SessionRegistry>>,
    Path((hash, file)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let path = match archive_path(&registry, &hash, &file) {
        Some(p) => p,
        None => return (StatusCode::BAD_REQUEST, "bad path").into_response(),
    };

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => m,
        _ => return (StatusCode::NOT_FOUND, "file not found").into_response(),
    };
    let total = metadata.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range_header);

    let (start, end, is_partial) = match range {
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive: Some(end),
        }) => {
            // Inclusive end in HTTP Range, exclusive end internally.
            let end = (end + 1).min(total);
            if start >= total || end <= start {
                return range_not_satisfiable(total);
            }
            (start, end, true)
        }
        Some(ParsedRange::StartEnd {
            start,
            end_inclusive: None,
        }) => {
            if start >= total {
                return range_not_satisfiable(total);
            }
            (start, total, true)
        }
        Some(ParsedRange::Suffix { len }) => {
            let start = total.saturating_sub(len);
            (start, total, true)
        }
        None => (0, total, false),
    };

    let body = match read_file_range(&path, start, end).await {
        Ok(b) => b,
        Err(e) => {
            warn!("failed to read {}: {}", path.display(), e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "read failed").into_response();
        }
    };

    let mut resp_headers = common_headers(&file, body.len() as u64);
    let status = if is_partial {
        let content_range = format!("bytes {}-{}/{}", start, end - 1, total);
        resp_headers.insert(
            header::CONTENT_RANGE,
            content_range.parse().expect("ascii header"),
        );
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    (status, resp_headers, body).into_response()
}

/// HEAD /download/{hash}/{file} — headers only.
async fn download_head_handler(
    State(registry): State<Arc<SessionRegistry>>,
    Path((hash, file)): Path<(String, String)>,
) -> Response {
    let path = match archive_path(&registry, &hash, &file) {
        Some(p) => p,
        None => return (StatusCode::BAD_REQUEST, "bad path").into_response(),
    };

    match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => {
            (StatusCode::OK, common_headers(&file, m.len())).into_response()
        }
        _ => (StatusCode::NOT_FOUND, "file not found").into_response(),
    }
}

fn range_not_satisfiable(total: u64) -> Response {
    (
        StatusCode::RANGE_NOT_SATISFIABLE,
        [(header::CONTENT_RANGE, format!("bytes */{}", total))],
        "range not satisfiable",
    )
        .into_response()
}

async fn read_file_range(path: &std::path::Path, start: u64, end: u64) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_header_full() {
        let result = parse_range_header("bytes=0-1023");
        assert!(matches!(
            result,
            Some(ParsedRange::StartEnd {
                start: 0,
                end_inclusive: Some(1023)
            })
        ));
    }

    #[test]
    fn test_parse_range_header_open_ended() {
        let result = parse_range_header("bytes=500-");
        assert!(matches!(
            result,
            Some(ParsedRange::StartEnd {
                start: 500,
                end_inclusive: None
            })
        ));
    }

    #[test]
    fn test_parse_range_header_suffix() {
        let result = parse_range_header("bytes=-1024");
        assert!(matches!(result, Some(ParsedRange::Suffix { len: 1024 })));
    }

    #[test]
    fn test_parse_range_header_invalid() {
        assert_eq!(parse_range_header("invalid"), None);
        assert_eq!(parse_range_header("bytes=abc-def"), None);
    }

    #[test]
    fn test_close_frame_codes() {
        assert_eq!(close_frame(CloseReason::Done).code, 1000);
        assert_eq!(close_frame(CloseReason::NotFound).code, 1008);
        assert_eq!(close_frame(CloseReason::Error).code, 1011);
    }
}
