//! Common Test Utilities
//!
//! Settings fixtures and a test application wired on in-memory backends.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, http::Request, Router};
use chat_relay::application::hub::ServerEvent;
use chat_relay::application::presence::{PresenceEntry, PresenceStore};
use chat_relay::config::{
    BusSettings, HubSettings, MessageMode, MessagingSettings, PresenceSettings, RedisSettings,
    ServerSettings, Settings, ShutdownSettings, StartFrom,
};
use chat_relay::infrastructure::bus::{BusBackend, MemoryBus};
use chat_relay::infrastructure::cache::MemoryCache;
use chat_relay::presentation::http::routes;
use chat_relay::startup::{Backends, Core};
use tokio::sync::mpsc;
use tower::ServiceExt;

/// Settings for one in-process instance.
pub fn test_settings(mode: MessageMode, instance_id: &str) -> Settings {
    let mut groups = HashMap::new();
    groups.insert(
        "G1".to_string(),
        vec!["U1".to_string(), "U2".to_string(), "U3".to_string()],
    );

    Settings {
        server: ServerSettings {
            host: "127.0.0.1".into(),
            port: 0,
        },
        redis: RedisSettings {
            url: "redis://127.0.0.1:6379".into(),
            connect_attempts: 1,
            connect_backoff_ms: 1,
            dial_timeout_ms: 100,
        },
        presence: PresenceSettings {
            key_prefix: "presence:".into(),
            ttl_secs: 60,
        },
        messaging: MessagingSettings { mode },
        bus: BusSettings {
            url: "memory://".into(),
            login_topic: "login".into(),
            logout_topic: "logout".into(),
            chat_topic: "chat".into(),
            partitions: 4,
            timeout_ms: 500,
            consumer_group: "chat-relay".into(),
            instance_id: instance_id.into(),
            start_from: StartFrom::Earliest,
            replay_window_secs: 0,
            remove_group_on_close: false,
            publish_attempts: 3,
            retry_backoff_ms: 1,
            publish_buffer: 64,
            read_batch: 16,
            poll_interval_ms: 5,
            max_len: 1_000,
            connect_attempts: 2,
            connect_backoff_ms: 1,
            dial_timeout_ms: 100,
        },
        hub: HubSettings {
            queue_capacity: 32,
            ping_interval_secs: 30,
            idle_timeout_secs: 90,
            max_message_size: 64 * 1024,
        },
        shutdown: ShutdownSettings { timeout_secs: 2 },
        groups,
        environment: "test".into(),
    }
}

/// In-memory backends; `bus` is shared between instances of one test.
pub fn memory_backends(cache: Arc<MemoryCache>, bus: Option<Arc<MemoryBus>>) -> Backends {
    Backends {
        cache,
        bus: bus.map(|bus| bus as Arc<dyn BusBackend>),
    }
}

/// Routing core on in-memory backends.
pub fn build_core(mode: MessageMode, instance_id: &str, bus: Option<Arc<MemoryBus>>) -> Core {
    build_core_with(test_settings(mode, instance_id), Arc::new(MemoryCache::new()), bus)
}

/// Routing core on the given settings and shared in-memory backends.
pub fn build_core_with(settings: Settings, cache: Arc<MemoryCache>, bus: Option<Arc<MemoryBus>>) -> Core {
    Core::build(settings, memory_backends(cache, bus)).expect("core builds")
}

/// Poll the presence store until `accept` holds, failing after two seconds.
pub async fn wait_for_presence<F>(store: &PresenceStore, user_id: &str, accept: F) -> Option<PresenceEntry>
where
    F: Fn(&Option<PresenceEntry>) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let entry = store.lookup(user_id).await.unwrap();
        if accept(&entry) {
            return entry;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "presence for {} never settled, last: {:?}",
            user_id,
            entry
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Test application builder
pub struct TestApp {
    pub router: Router,
    pub core: Core,
}

impl TestApp {
    pub fn new(mode: MessageMode) -> Self {
        let bus = match mode {
            MessageMode::Bus => Some(Arc::new(MemoryBus::new())),
            MessageMode::Channel => None,
        };
        let core = build_core(mode, "test", bus);
        Self {
            router: routes::create_router(core.state.clone()),
            core,
        }
    }

    /// Make a GET request to the application
    pub async fn get(&self, uri: &str) -> axum::response::Response {
        self.router
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }
}

/// Read a response body as JSON.
pub async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Next event on a connection queue, failing the test after two seconds.
pub async fn next_event(receiver: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), receiver.recv())
        .await
        .expect("event arrives in time")
        .expect("queue still open")
}
