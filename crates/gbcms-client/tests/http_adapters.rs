use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use gbcms_client::{
    Api, ConnectionManager, ConnectionState, FetchCoordinator, HttpApi, Store, WsTransport,
};
use gbcms_core::{ClientConfig, ClientError, ErrorKind, NewProject, ResourceStatus};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

async fn list_projects(headers: HeaderMap) -> impl IntoResponse {
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some("Bearer secret");
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": "Invalid or expired token."})),
        );
    }
    (
        StatusCode::OK,
        Json(json!([{"id": "1", "name": "Alpha", "description": "demo"}])),
    )
}

async fn create_project(Json(body): Json<Value>) -> impl IntoResponse {
    let name = body.get("name").and_then(Value::as_str).unwrap_or_default();
    if name == "taken" {
        return (
            StatusCode::CONFLICT,
            Json(json!({"message": "project name already exists"})),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "project_id": 2,
            "name": name,
            "description": body.get("description").cloned().unwrap_or(Value::Null),
            "created_at": "2026-02-07T21:00:00Z",
            "updated_at": "2026-02-07T21:00:00Z"
        })),
    )
}

async fn broken_logs() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "<html>boom</html>")
}

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(echo_socket)
}

/// Answers every `{"message": ...}` frame with an agent reply.
async fn echo_socket(mut socket: WebSocket) {
    let mut counter = 0;
    while let Some(Ok(frame)) = socket.recv().await {
        if let AxumMessage::Text(text) = frame {
            let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let content = parsed.get("message").and_then(Value::as_str).unwrap_or("?");
            counter += 1;
            let reply = json!({
                "id": format!("r{counter}"),
                "content": format!("echo: {content}"),
                "sender": "agent",
            });
            if socket.send(AxumMessage::Text(reply.to_string())).await.is_err() {
                break;
            }
        }
    }
}

async fn spawn_server() -> SocketAddr {
    let app = Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/logs", get(broken_logs))
        .route("/ws", get(ws_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(&format!("http://{addr}"), &format!("ws://{addr}/ws")).expect("config")
}

#[tokio::test]
async fn http_api_reads_projects_and_normalizes_errors() {
    let addr = spawn_server().await;
    let config = config(addr);

    let anonymous = HttpApi::new(&config).expect("client");
    let err = anonymous.list_projects().await.expect_err("unauthorized");
    assert_eq!(
        err,
        ClientError::RequestFailed {
            status: Some(401),
            message: "Invalid or expired token.".to_string(),
        }
    );

    let api = HttpApi::new(&config)
        .expect("client")
        .with_bearer_token(Some("secret".to_string()));
    let projects = api.list_projects().await.expect("projects");
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].name, "Alpha");

    let created = api
        .create_project(NewProject {
            name: "Beta".to_string(),
            description: "second".to_string(),
        })
        .await
        .expect("created");
    assert_eq!(created.id, "2");
    assert_eq!(created.description, "second");

    let conflict = api
        .create_project(NewProject {
            name: "taken".to_string(),
            description: String::new(),
        })
        .await
        .expect_err("conflict");
    assert_eq!(conflict.user_message(), "project name already exists");
}

#[tokio::test]
async fn coordinator_surfaces_server_errors_as_failed_state() {
    let addr = spawn_server().await;
    let config = config(addr);
    let api = Arc::new(HttpApi::new(&config).expect("client"));
    let coordinator = FetchCoordinator::new(api, Store::new(), config.request_timeout);

    let logs = coordinator.fetch_logs().await;
    assert_eq!(logs.status, ResourceStatus::Failed);
    let error = logs.error.expect("error recorded");
    assert_eq!(error.kind, ErrorKind::RequestFailed);
    assert_eq!(error.message, "Internal Server Error");
}

#[tokio::test]
async fn websocket_transport_round_trips_chat() {
    let addr = spawn_server().await;
    let store = Store::new();
    let manager = ConnectionManager::new(config(addr), Arc::new(WsTransport::new()), store.clone());

    manager.connect();
    let mut states = manager.watch_state();
    while *states.borrow_and_update() != ConnectionState::Connected {
        states.changed().await.expect("state channel open");
    }

    manager.send_chat("ping").await.expect("send");
    let mut changes = store.subscribe();
    while store.messages().len() < 2 {
        changes.changed().await.expect("store alive");
    }
    let contents: Vec<String> = store.messages().into_iter().map(|m| m.content).collect();
    assert_eq!(contents, vec!["ping", "echo: ping"]);

    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}
