//! End-to-end tests against a real server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use herald_core::ids::{ConversationId, UserId};
use herald_core::EventType;
use herald_server::auth::TrustedTokenAuthenticator;
use herald_server::{start, ServerConfig, ServerDeps, ServerHandle};
use herald_store::{Database, EventLog, SqliteDirectory};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    handle: ServerHandle,
    directory: SqliteDirectory,
    log: EventLog,
}

impl TestServer {
    fn http(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.handle.port())
    }

    async fn connect(&self, token: &str) -> WsStream {
        let url = format!("ws://127.0.0.1:{}/ws?token={token}", self.handle.port());
        let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
        // Registration completes before the first frame is read; a round trip
        // through the registry guarantees it is visible.
        let user = UserId::from_raw(token);
        for _ in 0..50 {
            if self.handle.registry().connection_for(&user).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        ws
    }

    async fn catch_up(&self, token: &str, query: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(self.http(&format!("/api/events{query}")))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }
}

async fn boot() -> TestServer {
    let config = ServerConfig {
        port: 0,
        catchup_deadline_secs: 1,
        catchup_poll_interval_ms: 50,
        ..Default::default()
    };
    boot_with(config).await
}

async fn boot_with(config: ServerConfig) -> TestServer {
    let db = Database::in_memory().unwrap();
    let directory = SqliteDirectory::new(db.clone());
    let log = EventLog::new(db);
    let handle = start(
        &config,
        ServerDeps {
            log: log.clone(),
            conversations: Arc::new(directory.clone()),
            messages: Arc::new(directory.clone()),
            authenticator: Arc::new(TrustedTokenAuthenticator),
        },
    )
    .await
    .unwrap();
    TestServer {
        handle,
        directory,
        log,
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next text frame as JSON, skipping keep-alives.
async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// True when the server closes the socket (Close frame, error, or end).
async fn closed_by_server(ws: &mut WsStream) -> bool {
    loop {
        match timeout(TIMEOUT, ws.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

fn user(id: &str) -> UserId {
    UserId::from_raw(id)
}

#[tokio::test]
async fn websocket_requires_token() {
    let server = boot().await;
    let url = format!("ws://127.0.0.1:{}/ws", server.handle.port());
    assert!(connect_async(url).await.is_err());
}

#[tokio::test]
async fn message_fans_out_live_and_durably() {
    let server = boot().await;
    let conv = ConversationId::from_raw("conv_1");
    server.directory.create_user(&user("alice"), "alice", None).unwrap();
    for id in ["alice", "bob", "carol"] {
        server.directory.add_participant(&conv, &user(id)).unwrap();
    }

    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    send_json(
        &mut alice,
        json!({"type": "send_message", "payload": {"conversation_id": "conv_1", "content": "hi all"}}),
    )
    .await;

    for ws in [&mut alice, &mut bob] {
        let frame = recv_json(ws).await;
        assert_eq!(frame["type"], "new_message");
        assert_eq!(frame["payload"]["content"], "hi all");
        assert_eq!(frame["payload"]["sender"]["username"], "alice");
    }

    // Carol was offline; she gets the same message through catch-up.
    let resp = server.catch_up("carol", "").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("cache-control").unwrap().to_str().unwrap(),
        "no-cache"
    );
    let events: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "new_message");
    assert_eq!(events[0]["payload"]["content"], "hi all");

    for id in ["alice", "bob", "carol"] {
        assert_eq!(server.log.count(&user(id)).unwrap(), 1);
    }
}

#[tokio::test]
async fn game_invite_reaches_named_player() {
    let server = boot().await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    send_json(
        &mut alice,
        json!({"type": "game_invite", "payload": {"player2_id": "bob", "game_id": "g1"}}),
    )
    .await;

    let frame = recv_json(&mut bob).await;
    assert_eq!(frame["type"], "game_invite");
    assert_eq!(frame["payload"]["game_id"], "g1");
    assert_eq!(server.log.count(&user("alice")).unwrap(), 0);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing() {
    let server = boot().await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    alice.send(Message::Text("not json".into())).await.unwrap();
    send_json(&mut alice, json!({"type": "teleport", "payload": {}})).await;
    send_json(&mut alice, json!({"type": "game_invite", "payload": {}})).await;
    send_json(
        &mut alice,
        json!({"type": "friend_request", "payload": {"recipient_id": "bob", "id": "r1"}}),
    )
    .await;

    let frame = recv_json(&mut bob).await;
    assert_eq!(frame["type"], "friend_request");
    assert_eq!(frame["payload"]["id"], "r1");
    assert_eq!(server.log.count(&user("bob")).unwrap(), 1);
    assert_eq!(server.log.count(&user("alice")).unwrap(), 0);
}

#[tokio::test]
async fn second_connection_replaces_first() {
    let server = boot().await;
    let mut first = server.connect("alice").await;
    let before = server
        .handle
        .registry()
        .connection_for(&user("alice"))
        .await
        .unwrap();

    let mut second = timeout(
        TIMEOUT,
        connect_async(format!(
            "ws://127.0.0.1:{}/ws?token=alice",
            server.handle.port()
        )),
    )
    .await
    .unwrap()
    .unwrap()
    .0;

    assert!(closed_by_server(&mut first).await);

    let after = server
        .handle
        .registry()
        .connection_for(&user("alice"))
        .await
        .unwrap();
    assert!(after.is_some());
    assert_ne!(before, after);
    assert_eq!(server.handle.registry().connected_count().await.unwrap(), 1);

    server
        .handle
        .registry()
        .publish(vec![user("alice")], EventType::GameUpdate, json!({"turn": 2}))
        .await
        .unwrap();
    assert_eq!(recv_json(&mut second).await["payload"]["turn"], 2);
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let config = ServerConfig {
        port: 0,
        max_frame_bytes: 256,
        ..Default::default()
    };
    let server = boot_with(config).await;
    let mut alice = server.connect("alice").await;

    let content = "x".repeat(1024);
    let _ = alice
        .send(Message::Text(
            json!({"type": "game_update", "payload": {"blob": content}})
                .to_string()
                .into(),
        ))
        .await;

    assert!(closed_by_server(&mut alice).await);
    assert_eq!(server.log.count(&user("alice")).unwrap(), 0);
}

#[tokio::test]
async fn catch_up_answers_when_event_arrives() {
    let server = boot_with(ServerConfig {
        port: 0,
        catchup_deadline_secs: 10,
        catchup_poll_interval_ms: 50,
        ..Default::default()
    })
    .await;
    let first = server
        .log
        .append(&user("dave"), EventType::GroupJoined, json!({"group_id": "g"}))
        .unwrap();

    let registry = server.handle.registry().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        registry
            .publish(vec![user("dave")], EventType::GroupLeft, json!({"group_id": "g"}))
            .await
            .unwrap();
    });

    let started = std::time::Instant::now();
    let resp = server
        .catch_up("dave", &format!("?since={}", first.id))
        .await;
    assert_eq!(resp.status(), 200);
    let events: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "group_left");
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn idle_catch_up_returns_empty_array() {
    let server = boot().await;
    let cursor = server
        .log
        .append(&user("erin"), EventType::GameUpdate, json!({}))
        .unwrap();

    let started = std::time::Instant::now();
    let resp = server
        .catch_up("erin", &format!("?since={}&limit=10", cursor.id))
        .await;
    assert_eq!(resp.status(), 200);
    let events: Vec<Value> = resp.json().await.unwrap();
    assert!(events.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn catch_up_rejects_bad_requests() {
    let server = boot().await;

    let resp = server.catch_up("erin", "?since=evt_missing").await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("unknown cursor"));

    let resp = server.catch_up("erin", "?limit=lots").await;
    assert_eq!(resp.status(), 400);

    let resp = reqwest::get(server.http("/api/events")).await.unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn health_reports_connections() {
    let server = boot().await;
    let _alice = server.connect("alice").await;

    let body: Value = reqwest::get(server.http("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"status": "healthy", "connections": 1}));
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let server = boot().await;
    let mut alice = server.connect("alice").await;

    server.handle.shutdown(Duration::from_secs(5)).await;
    assert!(closed_by_server(&mut alice).await);
}

#[tokio::test]
async fn shutdown_answers_waiting_catch_up_with_empty_array() {
    let server = boot_with(ServerConfig {
        port: 0,
        catchup_deadline_secs: 30,
        catchup_poll_interval_ms: 50,
        ..Default::default()
    })
    .await;
    let url = server.http("/api/events");

    let waiting = tokio::spawn(async move {
        reqwest::Client::new()
            .get(url)
            .bearer_auth("waiter")
            .send()
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    server.handle.shutdown(Duration::from_secs(5)).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let resp = timeout(TIMEOUT, waiting).await.unwrap().unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("cache-control").unwrap().to_str().unwrap(),
        "no-cache"
    );
    let events: Vec<Value> = resp.json().await.unwrap();
    assert!(events.is_empty());
}
