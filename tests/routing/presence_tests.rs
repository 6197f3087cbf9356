//! Presence stays in step with live connections across instances.

use std::sync::Arc;

use chat_relay::config::MessageMode;
use chat_relay::infrastructure::cache::MemoryCache;
use pretty_assertions::assert_eq;

use crate::common::{build_core_with, test_settings, wait_for_presence};

#[tokio::test]
async fn test_stale_release_keeps_entry_of_new_instance() {
    let cache = Arc::new(MemoryCache::new());
    let x = build_core_with(test_settings(MessageMode::Channel, "x"), cache.clone(), None);
    let y = build_core_with(test_settings(MessageMode::Channel, "y"), cache.clone(), None);
    let (x_state, y_state) = (x.state.clone(), y.state.clone());
    let x_lifecycle = x.into_lifecycle(None);
    let y_lifecycle = y.into_lifecycle(None);
    x_lifecycle.start().await.unwrap();
    y_lifecycle.start().await.unwrap();

    let old = x_state.hub.register("U1").unwrap();
    wait_for_presence(&x_state.presence, "U1", |e| {
        e.as_ref().is_some_and(|e| e.connection_id == old.connection_id)
    })
    .await;

    // U1 reconnects through Y, then X notices its socket closed
    let new = y_state.hub.register("U1").unwrap();
    wait_for_presence(&y_state.presence, "U1", |e| {
        e.as_ref().is_some_and(|e| e.connection_id == new.connection_id)
    })
    .await;
    assert!(x_state.hub.release("U1", old.connection_id));

    // X applies its requests in order, so once U9 shows up the clear is done
    let _marker = x_state.hub.register("U9").unwrap();
    wait_for_presence(&x_state.presence, "U9", |e| e.is_some()).await;

    let entry = y_state.presence.lookup("U1").await.unwrap().unwrap();
    assert_eq!(entry.connection_id, new.connection_id);
    assert_eq!(entry.instance_id, "y");
    assert!(y_state.hub.is_online("U1"));

    // Y's own release does clear it
    assert!(y_state.hub.release("U1", new.connection_id));
    wait_for_presence(&y_state.presence, "U1", |e| e.is_none()).await;
}
