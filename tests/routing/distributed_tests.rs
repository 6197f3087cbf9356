//! Bus mode: two instances share one in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use chat_relay::application::hub::ServerEvent;
use chat_relay::application::router::DispatchOutcome;
use chat_relay::config::MessageMode;
use chat_relay::domain::{ChatMessage, MessageKind, Target};
use chat_relay::infrastructure::bus::MemoryBus;
use chat_relay::lifecycle::LifecycleState;
use pretty_assertions::assert_eq;

use crate::common::{build_core, next_event};

#[tokio::test]
async fn test_offline_recipient_receives_backlog_on_other_instance() {
    let bus = Arc::new(MemoryBus::new());

    // Instance X: U1 connected, U2 nowhere
    let x = build_core(MessageMode::Bus, "x", Some(bus.clone()));
    let x_state = x.state.clone();
    let x_lifecycle = x.into_lifecycle(None);
    x_lifecycle.start().await.unwrap();
    let _u1 = x_state.hub.register("U1").unwrap();

    let sent = ChatMessage::chat("U1", "U2", "see you on the other side");
    let outcome = x_state.router.dispatch(sent.clone()).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Published { ref topic, .. } if topic == "chat"));

    // Instance Y comes up with U2 connected before its consumer catches up
    let y = build_core(MessageMode::Bus, "y", Some(bus.clone()));
    let y_state = y.state.clone();
    let mut u2 = y_state.hub.register("U2").unwrap();
    let y_lifecycle = y.into_lifecycle(None);
    y_lifecycle.start().await.unwrap();

    match next_event(&mut u2.receiver).await {
        ServerEvent::Message(received) => {
            assert_eq!(received, sent);
            assert_eq!(received.kind, MessageKind::Chat);
        }
        other => panic!("unexpected event: {:?}", other),
    }

    x_lifecycle.stop().await;
    y_lifecycle.stop().await;
    assert_eq!(x_lifecycle.state(), LifecycleState::Stopped);
    assert_eq!(y_lifecycle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn test_group_message_reaches_members_on_both_instances() {
    let bus = Arc::new(MemoryBus::new());
    let x = build_core(MessageMode::Bus, "x", Some(bus.clone()));
    let y = build_core(MessageMode::Bus, "y", Some(bus.clone()));
    let (x_state, y_state) = (x.state.clone(), y.state.clone());

    let mut u1 = x_state.hub.register("U1").unwrap();
    let mut u2 = x_state.hub.register("U2").unwrap();
    let mut u3 = y_state.hub.register("U3").unwrap();

    let x_lifecycle = x.into_lifecycle(None);
    let y_lifecycle = y.into_lifecycle(None);
    x_lifecycle.start().await.unwrap();
    y_lifecycle.start().await.unwrap();

    let message = ChatMessage::new("U1", Target::Group("G1".into()), MessageKind::Chat, "all hands");
    x_state.router.dispatch(message).await.unwrap();

    assert!(matches!(next_event(&mut u2.receiver).await, ServerEvent::Message(m) if m.body == "all hands"));
    assert!(matches!(next_event(&mut u3.receiver).await, ServerEvent::Message(m) if m.body == "all hands"));

    // Senders never receive their own group message
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(u1.receiver.try_recv().is_err());

    x_lifecycle.stop().await;
    y_lifecycle.stop().await;
}

#[tokio::test]
async fn test_login_notice_uses_login_topic() {
    let bus = Arc::new(MemoryBus::new());
    let x = build_core(MessageMode::Bus, "x", Some(bus.clone()));
    let state = x.state.clone();
    let lifecycle = x.into_lifecycle(None);
    lifecycle.start().await.unwrap();

    let message = ChatMessage::new("U1", Target::User("U2".into()), MessageKind::Login, "");
    let outcome = state.router.dispatch(message).await.unwrap();

    assert!(matches!(outcome, DispatchOutcome::Published { ref topic, .. } if topic == "login"));
    lifecycle.stop().await;
}

#[tokio::test]
async fn test_dispatch_after_stop_fails() {
    let bus = Arc::new(MemoryBus::new());
    let x = build_core(MessageMode::Bus, "x", Some(bus));
    let state = x.state.clone();
    let lifecycle = x.into_lifecycle(None);
    lifecycle.start().await.unwrap();
    lifecycle.stop().await;

    let result = state.router.dispatch(ChatMessage::chat("U1", "U2", "late")).await;
    assert!(result.is_err());
    assert!(!state.gate.is_open());
}
