use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::Method,
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use chatrelay_shared::constants::SUBSCRIBER_WRITE_TIMEOUT_SECS;
use chatrelay_shared::{LogEntry, MessageRecord};

use crate::error::ServerError;
use crate::hub::HubHandle;
use crate::logger::RotatingLogger;
use crate::session::SubscriberSession;

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub logger: Arc<RotatingLogger>,
    /// Subscriber sessions are tracked here so shutdown can wait for them.
    pub tasks: TaskTracker,
    pub shutdown: CancellationToken,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(subscribe_ws))
        .route("/api/messages", get(recent_messages))
        .route("/api/logs", get(list_logs))
        .route("/api/logs/{name}", get(read_log))
        .route("/api/logs/{name}/entries", get(read_log_entries))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    subscribers: usize,
}

async fn health_check(State(state): State<AppState>) -> Result<Json<HealthResponse>, ServerError> {
    let subscribers = state.hub.subscriber_count().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        subscribers,
    }))
}

async fn subscribe_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let AppState {
        hub,
        tasks,
        shutdown,
        ..
    } = state;

    ws.on_upgrade(move |socket| {
        tasks.track_future(async move {
            let write_timeout = Duration::from_secs(SUBSCRIBER_WRITE_TIMEOUT_SECS);
            match SubscriberSession::register(hub, write_timeout).await {
                Ok(session) => session.run(socket, shutdown).await,
                Err(e) => warn!(error = %e, "Rejecting subscriber"),
            }
        })
    })
}

async fn recent_messages(
    State(state): State<AppState>,
) -> Result<Json<Vec<MessageRecord>>, ServerError> {
    let messages = state.hub.snapshot().await?;
    Ok(Json(messages.iter().map(MessageRecord::from).collect()))
}

async fn list_logs(State(state): State<AppState>) -> Result<Json<Vec<String>>, ServerError> {
    Ok(Json(state.logger.list_files().await?))
}

async fn read_log(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<String, ServerError> {
    Ok(state.logger.read_file(&name).await?)
}

async fn read_log_entries(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<LogEntry>>, ServerError> {
    let content = state.logger.read_file(&name).await?;
    Ok(Json(LogEntry::parse_all(&content)))
}

/// Bind `addr` and serve until `shutdown` fires.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}

pub async fn serve_on(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting HTTP API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("HTTP API server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::{SinkExt, StreamExt};
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    use chatrelay_shared::Message;

    use crate::hub::{HubConfig, RelayHub};

    type Client =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn test_state(dir: &TempDir) -> AppState {
        let shutdown = CancellationToken::new();
        let logger = Arc::new(
            RotatingLogger::new(dir.path().to_path_buf(), 1024 * 1024, 5)
                .await
                .unwrap(),
        );
        let config = HubConfig {
            replay_capacity: 100,
            subscriber_queue: 64,
        };
        let (hub, handle) = RelayHub::new(config, logger.clone());
        tokio::spawn(hub.run(shutdown.clone()));

        AppState {
            hub: handle,
            logger,
            tasks: TaskTracker::new(),
            shutdown,
        }
    }

    async fn spawn_server(state: AppState) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener, state));
        addr
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        client
    }

    async fn wait_for_subscribers(hub: &HubHandle, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.subscriber_count().await.unwrap() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber count never settled");
    }

    async fn next_record(client: &mut Client) -> MessageRecord {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ws_replays_history_then_streams_live() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let hub = state.hub.clone();
        let addr = spawn_server(state).await;

        hub.publish(Message::new("alice", "A")).await.unwrap();
        hub.publish(Message::new("bob", "B")).await.unwrap();

        let mut client = connect(addr).await;
        wait_for_subscribers(&hub, 1).await;
        hub.publish(Message::new("carol", "C")).await.unwrap();

        let texts = [
            next_record(&mut client).await,
            next_record(&mut client).await,
            next_record(&mut client).await,
        ]
        .map(|record| record.text);
        assert_eq!(texts, ["A", "B", "C"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wire_record_carries_derived_markup() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let hub = state.hub.clone();
        let addr = spawn_server(state).await;

        hub.publish(Message::new("alice", "<b>hi</b>")).await.unwrap();

        let mut client = connect(addr).await;
        let record = next_record(&mut client).await;
        assert_eq!(record.author, "alice");
        assert!(record.markup.contains("&lt;b&gt;hi&lt;/b&gt;"));
        assert!(record.markup.contains(r#"<span class="username">alice</span>"#));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_inbound_frame_is_published_to_other_subscribers() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let hub = state.hub.clone();
        let addr = spawn_server(state).await;

        let mut sender = connect(addr).await;
        let mut receiver = connect(addr).await;
        wait_for_subscribers(&hub, 2).await;

        // Invalid frames are ignored and the session stays open.
        sender
            .send(WsMessage::Text("not json".into()))
            .await
            .unwrap();
        sender
            .send(WsMessage::Text(r#"{"author":"","text":"blank"}"#.into()))
            .await
            .unwrap();
        sender
            .send(WsMessage::Text(r#"{"author":"dave","text":"hello"}"#.into()))
            .await
            .unwrap();

        let record = next_record(&mut receiver).await;
        assert_eq!((record.author.as_str(), record.text.as_str()), ("dave", "hello"));

        // The sender is a subscriber too and sees its own message.
        let echoed = next_record(&mut sender).await;
        assert_eq!(echoed.id, record.id);
        assert_eq!(hub.subscriber_count().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_client_close_unsubscribes() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let hub = state.hub.clone();
        let addr = spawn_server(state).await;

        let mut client = connect(addr).await;
        wait_for_subscribers(&hub, 1).await;

        client.close(None).await.unwrap();
        wait_for_subscribers(&hub, 0).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_closes_sessions() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let shutdown = state.shutdown.clone();
        let tasks = state.tasks.clone();
        let hub = state.hub.clone();
        let addr = spawn_server(state).await;

        let mut client = connect(addr).await;
        wait_for_subscribers(&hub, 1).await;

        shutdown.cancel();
        tasks.close();
        tokio::time::timeout(Duration::from_secs(5), tasks.wait())
            .await
            .expect("session did not stop");

        // The peer sees a close frame or the end of the stream.
        let end = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("client never saw the close");
        assert!(matches!(end, None | Some(Ok(WsMessage::Close(_))) | Some(Err(_))));
    }

    #[tokio::test]
    async fn test_recent_messages_endpoint() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        state.hub.publish(Message::new("alice", "one")).await.unwrap();
        state.hub.publish(Message::new("bob", "two")).await.unwrap();

        let (status, body) = get(build_router(state), "/api/messages").await;
        assert_eq!(status, StatusCode::OK);
        let records: Vec<MessageRecord> = serde_json::from_str(&body).unwrap();
        let texts: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, ["one", "two"]);
    }

    #[tokio::test]
    async fn test_health_reports_subscribers() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let _sub = state.hub.subscribe().await.unwrap();

        let (status, body) = get(build_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["subscribers"], 1);
    }

    #[tokio::test]
    async fn test_log_endpoints() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        state.logger.append(&Message::new("alice", "hello there")).await.unwrap();
        state.logger.append(&Message::new("bob", "a: b")).await.unwrap();
        let app = build_router(state);

        let (status, body) = get(app.clone(), "/api/logs").await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<String> = serde_json::from_str(&body).unwrap();
        assert_eq!(names.len(), 1);
        let name = &names[0];
        assert!(name.starts_with("chat-") && name.ends_with(".log"));

        let (status, raw) = get(app.clone(), &format!("/api/logs/{name}")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(raw.contains("] alice: hello there\n"));

        let (status, body) = get(app.clone(), &format!("/api/logs/{name}/entries")).await;
        assert_eq!(status, StatusCode::OK);
        let entries: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["author"], "bob");
        assert_eq!(entries[1]["text"], "a: b");
    }

    #[tokio::test]
    async fn test_log_endpoint_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir).await;
        let app = build_router(state);

        let (status, body) = get(app.clone(), "/api/logs/..%2F..%2Fetc%2Fpasswd").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("error"));

        let (status, _) = get(app.clone(), "/api/logs/notes.txt").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get(app, "/api/logs/chat-2001-01-01.log").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
