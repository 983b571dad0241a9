//! 运维页面：静态页面、资源文件与配对状态 WebSocket
//!
//! - `GET /`        -> {client_dir}/index.html
//! - `GET /scan`    -> {client_dir}/server.html
//! - `GET /assets/*`-> {client_dir}/assets/...
//! - `GET /ws`      -> 挂接为 PairingBroadcaster 的唯一观察者

use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pairing::{OperatorEvent, PairingBroadcaster};

/// 运维服务状态
pub struct ServerState {
    pub broadcaster: Arc<PairingBroadcaster>,
    pub client_dir: PathBuf,
}

/// 创建运维路由
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/scan", get(scan))
        .route("/assets/*path", get(asset))
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

/// 在给定监听器上运行，直到 shutdown 被取消
pub async fn serve(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Operator server listening on http://{}", addr);
    }
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn index(State(state): State<Arc<ServerState>>) -> Response {
    send_file(&state.client_dir.join("index.html")).await
}

async fn scan(State(state): State<Arc<ServerState>>) -> Response {
    send_file(&state.client_dir.join("server.html")).await
}

async fn asset(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> Response {
    let relative = FsPath::new(&path);
    // 只允许普通路径段，拒绝 `..` 与绝对路径
    if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return StatusCode::NOT_FOUND.into_response();
    }
    send_file(&state.client_dir.join("assets").join(relative)).await
}

async fn send_file(path: &FsPath) -> Response {
    match tokio::fs::read(path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type(path))
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Err(e) => {
            tracing::debug!("Static file {} unavailable: {}", path.display(), e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

fn content_type(path: &FsPath) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("gif") => "image/gif",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OperatorEvent>();
    let observer = state.broadcaster.attach(tx);
    tracing::info!("Operator attached (#{})", observer);

    // 被新连接替换后 rx 关闭，发送任务随之结束
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize operator event: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let recv_loop = async {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!("Operator socket error: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = &mut send_task => {}
        _ = recv_loop => send_task.abort(),
    }

    state.broadcaster.detach(observer);
    tracing::info!("Operator detached (#{})", observer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::{StatusAssets, SvgQrEncoder};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(dir: &FsPath) -> Arc<ServerState> {
        Arc::new(ServerState {
            broadcaster: Arc::new(PairingBroadcaster::new(
                Arc::new(SvgQrEncoder::default()),
                StatusAssets::default(),
            )),
            client_dir: dir.to_path_buf(),
        })
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String, Option<String>) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let ctype = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).to_string(), ctype)
    }

    #[tokio::test]
    async fn test_pages_and_assets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::write(dir.path().join("server.html"), "<h1>scan</h1>").unwrap();
        std::fs::create_dir_all(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/check.svg"), "<svg/>").unwrap();

        let app = create_router(state(dir.path()));
        let (status, body, _) = get(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<h1>home</h1>");

        let (status, body, _) = get(app.clone(), "/scan").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<h1>scan</h1>");

        let (status, body, ctype) = get(app.clone(), "/assets/check.svg").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "<svg/>");
        assert_eq!(ctype.as_deref(), Some("image/svg+xml"));

        let (status, _, _) = get(app, "/assets/missing.gif").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_asset_traversal_rejected() {
        let root = tempfile::tempdir().unwrap();
        let client = root.path().join("client");
        std::fs::create_dir_all(client.join("assets")).unwrap();
        std::fs::write(root.path().join("secret.txt"), "nope").unwrap();

        let app = create_router(state(&client));
        let (status, _, _) = get(app, "/assets/..%2F..%2Fsecret.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<
                Item = Result<
                    tokio_tungstenite::tungstenite::Message,
                    tokio_tungstenite::tungstenite::Error,
                >,
            > + Unpin,
    {
        use tokio_tungstenite::tungstenite::Message as WsMessage;
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(t) => return serde_json::from_str(&t).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_ws_receives_snapshot_then_live_events() {
        let dir = tempfile::tempdir().unwrap();
        let st = state(dir.path());
        let broadcaster = st.broadcaster.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let server = tokio::spawn(serve(listener, st, token.clone()));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        // 快照：当前为 loading
        let first = next_json(&mut ws).await;
        assert_eq!(first["event"], "qrstatus");
        assert_eq!(first["data"], "./assets/loader.svg");
        let _log = next_json(&mut ws).await;

        broadcaster.qr("2@abc");
        let qr = next_json(&mut ws).await;
        assert_eq!(qr["event"], "qr");
        assert!(qr["data"].as_str().unwrap().starts_with("data:image/svg+xml;base64,"));

        token.cancel();
        drop(ws);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), server).await;
    }
}
