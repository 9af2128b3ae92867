// Integration tests for the chat relay
// Each test runs its own server on an ephemeral port and talks to it over real sockets

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

use rusty_chat::config::ServerConfig;
use rusty_chat::core::{Hub, HubHandle};
use rusty_chat::handlers::routes;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    hub: HubHandle,
}

fn start_server(config: ServerConfig) -> TestServer {
    let config = Arc::new(config);
    let (hub, _hub_task) = Hub::spawn(&config);
    let (addr, server) = warp::serve(routes(hub.clone(), config)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    TestServer { addr, hub }
}

async fn connect(server: &TestServer) -> Client {
    let url = format!("ws://{}/ws", server.addr);
    let (client, _) = connect_async(url).await.expect("Failed to connect");
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .expect("Failed to send frame");
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = timeout(FRAME_TIMEOUT, client.next())
            .await
            .expect("Timed out waiting for a frame")
            .expect("Connection closed")
            .expect("WebSocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("Invalid JSON from server"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected frame: {:?}", other),
        }
    }
}

// Skip frames until the presence list reaches `count` names
async fn wait_for_presence(client: &mut Client, count: usize) -> Value {
    loop {
        let message = next_json(client).await;
        if message["type"] == "user_list" && message["users"].as_array().map(Vec::len) == Some(count) {
            return message;
        }
    }
}

async fn join(client: &mut Client, name: &str, expected_users: usize) {
    send_json(client, json!({ "type": "join", "content": name })).await;
    wait_for_presence(client, expected_users).await;
}

async fn assert_silent(client: &mut Client, wait: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(wait, client.next()).await {
        panic!("Unexpected frame: {}", text);
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn test_join_and_chat() {
    let server = start_server(ServerConfig::default());
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;

    send_json(&mut alice, json!({ "type": "join", "content": "Alice" })).await;
    let joined = next_json(&mut alice).await;
    assert_eq!(joined["type"], "system");
    assert_eq!(joined["content"], "Alice has joined the chat");
    let presence = next_json(&mut alice).await;
    assert_eq!(presence["users"], json!(["Alice"]));

    join(&mut bob, "Bob", 2).await;
    let joined = next_json(&mut alice).await;
    assert_eq!(joined["content"], "Bob has joined the chat");
    let presence = next_json(&mut alice).await;
    assert_eq!(presence["users"], json!(["Alice", "Bob"]));

    send_json(
        &mut bob,
        json!({ "type": "chat", "from": "Someone", "content": "Hello <b>all</b>" }),
    )
    .await;

    for client in [&mut alice, &mut bob] {
        let chat = next_json(client).await;
        assert_eq!(chat["type"], "chat");
        assert_eq!(chat["from"], "Bob");
        assert_eq!(chat["content"], "Hello &lt;b&gt;all&lt;/b&gt;");
        assert!(chat["timestamp"].is_string());
    }
}

#[tokio::test]
async fn test_private_messaging() {
    let server = start_server(ServerConfig::default());
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    let mut charlie = connect(&server).await;

    join(&mut alice, "Alice", 1).await;
    join(&mut bob, "Bob", 2).await;
    join(&mut charlie, "Charlie", 3).await;
    wait_for_presence(&mut alice, 3).await;
    wait_for_presence(&mut bob, 3).await;

    send_json(
        &mut alice,
        json!({ "type": "private", "from": "Alice", "to": "Bob", "content": "psst" }),
    )
    .await;

    let received = next_json(&mut bob).await;
    assert_eq!(received["type"], "private");
    assert_eq!(received["from"], "Alice");
    assert_eq!(received["to"], "Bob");
    assert_eq!(received["content"], "psst");

    let echo = next_json(&mut alice).await;
    assert_eq!(echo, received);

    assert_silent(&mut charlie, Duration::from_millis(300)).await;
    assert_silent(&mut bob, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_private_to_unknown_user() {
    let server = start_server(ServerConfig::default());
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;

    join(&mut alice, "Alice", 1).await;
    join(&mut bob, "Bob", 2).await;
    wait_for_presence(&mut alice, 2).await;

    send_json(
        &mut alice,
        json!({ "type": "private", "from": "Alice", "to": "NoSuchUser", "content": "hello?" }),
    )
    .await;

    let error = next_json(&mut alice).await;
    assert_eq!(error["type"], "error");
    assert!(error["error"].as_str().unwrap().contains("not found"));

    assert_silent(&mut alice, Duration::from_millis(300)).await;
    assert_silent(&mut bob, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_private_to_self_is_refused() {
    let server = start_server(ServerConfig::default());
    let mut alice = connect(&server).await;
    join(&mut alice, "Alice", 1).await;

    send_json(
        &mut alice,
        json!({ "type": "private", "from": "Someone", "to": "Alice", "content": "me?" }),
    )
    .await;

    let error = next_json(&mut alice).await;
    assert_eq!(error["error"], "Cannot send private message to yourself");
}

#[tokio::test]
async fn test_presence_tracks_joins_and_leaves() {
    let server = start_server(ServerConfig::default());
    let mut clients = Vec::new();

    for i in 0..5 {
        let mut client = connect(&server).await;
        join(&mut client, &format!("user{}", i), i + 1).await;
        clients.push(client);
    }

    assert_eq!(server.hub.client_count(), 5);
    assert_eq!(server.hub.connected_users().len(), 5);

    for mut client in clients {
        client.close(None).await.expect("Failed to close client");
    }

    let hub = server.hub.clone();
    assert!(
        wait_until(
            || hub.client_count() == 0 && hub.connected_users().is_empty(),
            Duration::from_secs(2)
        )
        .await
    );
}

#[tokio::test]
async fn test_leave_is_announced() {
    let server = start_server(ServerConfig::default());
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;

    join(&mut alice, "Alice", 1).await;
    join(&mut bob, "Bob", 2).await;
    wait_for_presence(&mut alice, 2).await;

    bob.close(None).await.expect("Failed to close client");

    let left = next_json(&mut alice).await;
    assert_eq!(left["type"], "system");
    assert_eq!(left["content"], "Bob has left the chat");
    let presence = next_json(&mut alice).await;
    assert_eq!(presence["users"], json!(["Alice"]));
}

#[tokio::test]
async fn test_rate_limit() {
    let server = start_server(ServerConfig {
        rate_limit_messages: 30,
        rate_limit_window: Duration::from_secs(2),
        ..ServerConfig::default()
    });
    let mut alice = connect(&server).await;
    join(&mut alice, "Alice", 1).await;

    for i in 0..31 {
        send_json(&mut alice, json!({ "type": "chat", "from": "Alice", "content": format!("message {}", i) })).await;
    }

    // The refusal is queued by the connection itself, so it may overtake broadcasts
    let mut chats = 0;
    let mut errors = Vec::new();
    for _ in 0..31 {
        let message = next_json(&mut alice).await;
        match message["type"].as_str() {
            Some("chat") => chats += 1,
            Some("error") => errors.push(message),
            other => panic!("Unexpected message type: {:?}", other),
        }
    }
    assert_eq!(chats, 30);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0]["error"],
        "Rate limit exceeded. Please slow down your messages."
    );

    sleep(Duration::from_millis(2100)).await;

    send_json(&mut alice, json!({ "type": "chat", "from": "Alice", "content": "back again" })).await;
    let chat = next_json(&mut alice).await;
    assert_eq!(chat["type"], "chat");
    assert_eq!(chat["content"], "back again");
}

#[tokio::test]
async fn test_protocol_errors_keep_connection_open() {
    let server = start_server(ServerConfig::default());
    let mut client = connect(&server).await;

    client
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    let error = next_json(&mut client).await;
    assert!(error["error"].as_str().unwrap().starts_with("Invalid message format"));

    send_json(&mut client, json!({ "type": "shout", "content": "hi" })).await;
    let error = next_json(&mut client).await;
    assert!(error["error"].as_str().unwrap().starts_with("Invalid message format"));

    send_json(&mut client, json!({ "type": "system", "content": "I am the server" })).await;
    let error = next_json(&mut client).await;
    assert_eq!(error["error"], "Unknown message type: system");

    send_json(&mut client, json!({ "type": "chat", "from": "Ghost", "content": "hi" })).await;
    let error = next_json(&mut client).await;
    assert_eq!(error["error"], "Must join chat before sending messages");

    send_json(&mut client, json!({ "type": "chat", "content": "no sender" })).await;
    let error = next_json(&mut client).await;
    assert!(error["error"].as_str().unwrap().starts_with("Message validation failed"));

    send_json(&mut client, json!({ "type": "join", "content": "<b>bold</b>" })).await;
    let error = next_json(&mut client).await;
    assert_eq!(error["error"], "Display name error: content cannot contain HTML tags");

    client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let error = next_json(&mut client).await;
    assert_eq!(error["error"], "Binary frames are not supported");

    join(&mut client, "Survivor", 1).await;
    assert_eq!(server.hub.connected_users(), vec!["Survivor"]);
}

#[tokio::test]
async fn test_duplicate_name_and_rename() {
    let server = start_server(ServerConfig::default());
    let mut alice = connect(&server).await;
    let mut imposter = connect(&server).await;

    join(&mut alice, "Alice", 1).await;

    send_json(&mut imposter, json!({ "type": "join", "content": "Alice" })).await;
    let error = next_json(&mut imposter).await;
    assert_eq!(error["error"], "Display name error: 'Alice' is already taken");
    assert_eq!(server.hub.client_count(), 1);

    send_json(&mut alice, json!({ "type": "join", "content": "Alicia" })).await;
    let renamed = next_json(&mut alice).await;
    assert_eq!(renamed["content"], "Alice is now known as Alicia");
    let presence = next_json(&mut alice).await;
    assert_eq!(presence["users"], json!(["Alicia"]));

    // The old name is free again
    join(&mut imposter, "Alice", 2).await;
}

#[tokio::test]
async fn test_oversize_frame_closes_connection() {
    let server = start_server(ServerConfig::default());
    let mut client = connect(&server).await;
    join(&mut client, "Alice", 1).await;

    let huge = json!({ "type": "chat", "from": "Alice", "content": "x".repeat(2000) });
    // The server may already be gone by the time the send completes
    let _ = client.send(Message::Text(huge.to_string())).await;

    loop {
        match timeout(FRAME_TIMEOUT, client.next()).await {
            Err(_) => panic!("Connection was not closed"),
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Text(text)))) => panic!("Unexpected frame: {}", text),
            Ok(Some(Ok(_))) => continue,
        }
    }

    let hub = server.hub.clone();
    assert!(wait_until(|| hub.client_count() == 0, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_server_at_capacity() {
    let server = start_server(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    });
    let mut alice = connect(&server).await;
    join(&mut alice, "Alice", 1).await;

    let mut rejected = connect(&server).await;
    let frame = timeout(FRAME_TIMEOUT, rejected.next())
        .await
        .expect("Timed out waiting for close")
        .expect("Connection closed without a close frame")
        .expect("WebSocket error");

    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(u16::from(close.code), 1013);
            assert_eq!(close.reason, "Server at capacity");
        }
        other => panic!("Expected a close frame, got {:?}", other),
    }
    assert_eq!(server.hub.client_count(), 1);
}

#[tokio::test]
async fn test_ceiling_applies_to_sockets_admitted_before_joining() {
    let server = start_server(ServerConfig {
        max_connections: 1,
        ..ServerConfig::default()
    });

    // Nobody has joined yet, so both sockets are let in
    let mut first = connect(&server).await;
    let mut second = connect(&server).await;

    join(&mut first, "First", 1).await;

    send_json(&mut second, json!({ "type": "join", "content": "Second" })).await;
    let error = next_json(&mut second).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["error"], "Server at capacity");

    assert_eq!(server.hub.client_count(), 1);
    assert_eq!(server.hub.connected_users(), vec!["First"]);
}

// Wait for the server to end the connection, skipping any frames still in flight
async fn expect_closed_by_server(client: &mut Client) -> bool {
    loop {
        match timeout(FRAME_TIMEOUT, client.next()).await {
            Err(_) => panic!("Connection was not closed"),
            Ok(Some(Ok(Message::Close(_)))) => return true,
            Ok(None) | Ok(Some(Err(_))) => return false,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

#[tokio::test]
async fn test_silent_peer_is_dropped_after_read_deadline() {
    let server = start_server(ServerConfig {
        pong_wait: Duration::from_millis(600),
        ping_interval: Duration::from_millis(300),
        ..ServerConfig::default()
    });
    let mut client = connect(&server).await;
    join(&mut client, "Sleepy", 1).await;

    // Not polling the client means pings go unanswered
    let hub = server.hub.clone();
    assert!(wait_until(|| hub.client_count() == 0, Duration::from_secs(3)).await);
    assert!(hub.connected_users().is_empty());

    expect_closed_by_server(&mut client).await;
}

#[tokio::test]
async fn test_idle_eviction_closes_socket() {
    let server = start_server(ServerConfig {
        cleanup_interval: Duration::from_millis(200),
        idle_timeout: Duration::from_millis(500),
        ..ServerConfig::default()
    });
    let mut client = connect(&server).await;
    join(&mut client, "Idle", 1).await;

    assert!(expect_closed_by_server(&mut client).await);

    let hub = server.hub.clone();
    assert!(wait_until(|| hub.client_count() == 0, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_health_and_stats_routes() {
    let server = start_server(ServerConfig::default());
    let mut alice = connect(&server).await;
    join(&mut alice, "Alice", 1).await;

    let health = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .expect("Health request failed");
    assert!(health.status().is_success());
    assert_eq!(health.text().await.unwrap(), "OK");

    let stats: Value = reqwest::get(format!("http://{}/stats", server.addr))
        .await
        .expect("Stats request failed")
        .json()
        .await
        .expect("Stats is not JSON");

    assert_eq!(stats["total"], 1);
    assert_eq!(stats["active"], 1);
    assert_eq!(stats["idle"], 0);
    assert_eq!(stats["named_users"], 1);
    assert_eq!(stats["ceiling"], 1000);
}
