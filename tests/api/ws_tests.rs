//! WebSocket ingress tests
//!
//! Rejections go through the router in memory. Sessions run against a
//! real listener on an ephemeral port and talk to it with a client socket.

use std::sync::Arc;
use std::time::Duration;

use chat_relay::application::hub::{NoticeCode, ServerEvent};
use chat_relay::config::{MessageMode, Settings};
use chat_relay::infrastructure::bus::MemoryBus;
use chat_relay::infrastructure::cache::{KeyValueCache, MemoryCache};
use chat_relay::startup::Application;
use futures::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::common::{memory_backends, test_settings, wait_for_presence, TestApp};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[tokio::test]
async fn test_plain_get_is_rejected() {
    let app = TestApp::new(MessageMode::Channel);

    let response = app.get("/ws?client_id=U1").await;

    assert!(response.status().is_client_error());
    assert_eq!(app.core.state.hub.connection_count(), 0);
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let app = TestApp::new(MessageMode::Channel);

    let response = app.get("/gateway").await;

    assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
}

/// Started channel-mode application on 127.0.0.1:0.
async fn spawn_app() -> Application {
    spawn_app_with(test_settings(MessageMode::Channel, "ws"), Arc::new(MemoryCache::new()), None).await
}

async fn spawn_app_with(settings: Settings, cache: Arc<MemoryCache>, bus: Option<Arc<MemoryBus>>) -> Application {
    let app = Application::build_with(settings, memory_backends(cache, bus))
        .await
        .expect("application builds");
    app.lifecycle().start().await.expect("application starts");
    app
}

async fn wait_until_released(app: &Application) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    while app.state().hub.connection_count() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "connection never released");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Connect as `user_id` and wait until the hub has registered the session.
async fn connect(app: &Application, user_id: &str) -> Client {
    let url = format!("ws://{}/ws?client_id={}", app.local_addr(), user_id);
    let (client, _) = connect_async(url).await.expect("upgrade succeeds");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !app.state().hub.is_online(user_id) {
        assert!(tokio::time::Instant::now() < deadline, "{} never registered", user_id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    client
}

async fn send_text(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string()))
        .await
        .expect("frame sent");
}

/// Next server event, skipping control frames.
async fn read_event(client: &mut Client) -> ServerEvent {
    let read = async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str::<ServerEvent>(&text).expect("server event json")
                }
                Some(Ok(Message::Close(_))) | None => panic!("socket closed before an event arrived"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("socket error: {}", e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), read)
        .await
        .expect("event arrives in time")
}

fn notice_of(event: ServerEvent) -> (NoticeCode, Option<String>) {
    match event {
        ServerEvent::Notice(notice) => (notice.code, notice.target),
        other => panic!("expected a notice, got {:?}", other),
    }
}

#[tokio::test]
async fn test_direct_message_reaches_other_socket() {
    let app = spawn_app().await;
    let mut alice = connect(&app, "U1").await;
    let mut bob = connect(&app, "U2").await;

    send_text(&mut alice, r#"{"receive_id":"U2","content":"hello bob"}"#).await;

    match read_event(&mut bob).await {
        ServerEvent::Message(message) => {
            assert_eq!(message.sender_id, "U1");
            assert_eq!(message.body, "hello bob");
        }
        other => panic!("expected a message, got {:?}", other),
    }
    app.lifecycle().stop().await;
}

#[tokio::test]
async fn test_group_message_skips_sender() {
    let app = spawn_app().await;
    let mut alice = connect(&app, "U1").await;
    let mut bob = connect(&app, "U2").await;

    send_text(&mut alice, r#"{"receive_id":"G1","content":"hi all"}"#).await;
    send_text(&mut alice, r#"{"receive_id":"U2","content":"after"}"#).await;

    // U3 is offline; group sends raise no notice for it
    let ServerEvent::Message(first) = read_event(&mut bob).await else {
        panic!("expected the group message");
    };
    assert_eq!(first.body, "hi all");
    let ServerEvent::Message(second) = read_event(&mut bob).await else {
        panic!("expected the direct message");
    };
    assert_eq!(second.body, "after");

    // Nothing was queued for alice by the group send
    send_text(&mut alice, r#"{"receive_id":"U404","content":"anyone?"}"#).await;
    assert_eq!(
        notice_of(read_event(&mut alice).await),
        (NoticeCode::UserOffline, Some("U404".to_string()))
    );
    app.lifecycle().stop().await;
}

#[tokio::test]
async fn test_offline_direct_target_is_reported() {
    let app = spawn_app().await;
    let mut alice = connect(&app, "U1").await;

    send_text(&mut alice, r#"{"receive_id":"U404","content":"are you there"}"#).await;

    assert_eq!(
        notice_of(read_event(&mut alice).await),
        (NoticeCode::UserOffline, Some("U404".to_string()))
    );
    app.lifecycle().stop().await;
}

#[tokio::test]
async fn test_unknown_group_is_reported() {
    let app = spawn_app().await;
    let mut alice = connect(&app, "U1").await;

    send_text(&mut alice, r#"{"receive_id":"G404","content":"hello"}"#).await;

    assert_eq!(
        notice_of(read_event(&mut alice).await),
        (NoticeCode::UnknownGroup, Some("G404".to_string()))
    );
    app.lifecycle().stop().await;
}

#[tokio::test]
async fn test_bad_frames_are_reported_and_session_survives() {
    let app = spawn_app().await;
    let mut alice = connect(&app, "U1").await;
    let mut bob = connect(&app, "U2").await;

    send_text(&mut alice, "not json").await;
    assert_eq!(notice_of(read_event(&mut alice).await).0, NoticeCode::InvalidFrame);

    send_text(&mut alice, r#"{"receive_id":"   ","content":"nobody"}"#).await;
    assert_eq!(notice_of(read_event(&mut alice).await).0, NoticeCode::InvalidFrame);

    alice
        .send(Message::Binary(vec![1, 2, 3]))
        .await
        .expect("frame sent");
    assert_eq!(notice_of(read_event(&mut alice).await).0, NoticeCode::InvalidFrame);

    send_text(&mut alice, r#"{"receive_id":"U2","content":"still here"}"#).await;
    let ServerEvent::Message(message) = read_event(&mut bob).await else {
        panic!("expected a message");
    };
    assert_eq!(message.body, "still here");
    app.lifecycle().stop().await;
}

#[tokio::test]
async fn test_client_close_releases_connection_and_presence() {
    let app = spawn_app().await;
    let mut alice = connect(&app, "U1").await;
    let presence = app.state().presence.clone();
    wait_for_presence(&presence, "U1", |entry| entry.is_some()).await;

    alice.close(None).await.expect("close sent");

    wait_until_released(&app).await;
    wait_for_presence(&presence, "U1", |entry| entry.is_none()).await;
    app.lifecycle().stop().await;
}

#[tokio::test]
async fn test_stop_sends_shutdown_notice_then_close() {
    let app = spawn_app().await;
    let mut alice = connect(&app, "U1").await;

    let read = async {
        let notice = notice_of(read_event(&mut alice).await);
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match alice.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        (notice, closed.is_ok())
    };
    let (_, (notice, closed)) = tokio::join!(app.lifecycle().stop(), read);

    assert_eq!(notice, (NoticeCode::ServerShutdown, None));
    assert!(closed);
    assert!(app.state().hub.is_closed());
}

#[tokio::test]
async fn test_upgrade_refused_after_stop() {
    let app = spawn_app().await;
    app.lifecycle().stop().await;

    let url = format!("ws://{}/ws?client_id=U1", app.local_addr());
    assert!(connect_async(url).await.is_err());
    assert_eq!(app.state().hub.connection_count(), 0);
}

#[tokio::test]
async fn test_bus_failure_is_reported_to_sender() {
    let app = spawn_app_with(
        test_settings(MessageMode::Bus, "ws"),
        Arc::new(MemoryCache::new()),
        Some(Arc::new(MemoryBus::new())),
    )
    .await;
    let mut alice = connect(&app, "U1").await;

    let bus = app.state().bus.clone().expect("bus mode has a client");
    bus.close(Duration::from_secs(1)).await.expect("bus closes");
    send_text(&mut alice, r#"{"receive_id":"U2","content":"into the void"}"#).await;

    assert_eq!(notice_of(read_event(&mut alice).await).0, NoticeCode::DeliveryFailed);
    app.lifecycle().stop().await;
}

#[tokio::test]
async fn test_silent_client_hits_idle_timeout() {
    let mut settings = test_settings(MessageMode::Channel, "ws");
    settings.hub.ping_interval_secs = 1;
    settings.hub.idle_timeout_secs = 1;
    let app = spawn_app_with(settings, Arc::new(MemoryCache::new()), None).await;

    // Never polled, so pings go unanswered
    let _alice = connect(&app, "U1").await;

    wait_until_released(&app).await;
    assert!(!app.state().hub.is_online("U1"));
    app.lifecycle().stop().await;
}

#[tokio::test]
async fn test_heartbeat_refreshes_presence() {
    let mut settings = test_settings(MessageMode::Channel, "ws");
    settings.hub.ping_interval_secs = 1;
    settings.hub.idle_timeout_secs = 30;
    let cache = Arc::new(MemoryCache::new());
    let app = spawn_app_with(settings, cache.clone(), None).await;
    let _alice = connect(&app, "U1").await;
    let presence = app.state().presence.clone();
    let written = wait_for_presence(&presence, "U1", |entry| entry.is_some()).await;

    cache.delete("presence:U1").await.unwrap();

    let refreshed = wait_for_presence(&presence, "U1", |entry| entry.is_some()).await;
    assert_eq!(refreshed, written);
    app.lifecycle().stop().await;
}
