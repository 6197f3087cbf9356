//! Channel mode: messages go straight through this process's hub.

use chat_relay::application::hub::{NoticeCode, SendOutcome, ServerEvent};
use chat_relay::application::router::{DispatchOutcome, RouterError};
use chat_relay::config::MessageMode;
use chat_relay::domain::{ChatMessage, MessageKind, Target};
use pretty_assertions::assert_eq;

use crate::common::{build_core, next_event};

#[tokio::test]
async fn test_messages_arrive_in_send_order() {
    let core = build_core(MessageMode::Channel, "a", None);
    let state = &core.state;
    let _sender = state.hub.register("U1").unwrap();
    let mut recipient = state.hub.register("U2").unwrap();

    for i in 0..20 {
        let outcome = state
            .router
            .dispatch(ChatMessage::chat("U1", "U2", format!("msg-{}", i)))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Delivered(_)));
    }

    for i in 0..20 {
        match next_event(&mut recipient.receiver).await {
            ServerEvent::Message(message) => assert_eq!(message.body, format!("msg-{}", i)),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_offline_recipient_reported() {
    let core = build_core(MessageMode::Channel, "a", None);

    let outcome = core
        .state
        .router
        .dispatch(ChatMessage::chat("U1", "U9", "anyone there?"))
        .await
        .unwrap();

    match outcome {
        DispatchOutcome::Delivered(deliveries) => {
            assert_eq!(deliveries.len(), 1);
            assert_eq!(deliveries[0].outcome, SendOutcome::UserOffline);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_group_fan_out_skips_sender() {
    let core = build_core(MessageMode::Channel, "a", None);
    let state = &core.state;
    let mut u1 = state.hub.register("U1").unwrap();
    let mut u2 = state.hub.register("U2").unwrap();

    let message = ChatMessage::new("U1", Target::Group("G1".into()), MessageKind::Chat, "hi all");
    let outcome = state.router.dispatch(message).await.unwrap();

    let DispatchOutcome::Delivered(deliveries) = outcome else {
        panic!("group messages deliver locally in channel mode");
    };
    let mut recipients: Vec<_> = deliveries.iter().map(|d| d.user_id.as_str()).collect();
    recipients.sort();
    assert_eq!(recipients, vec!["U2", "U3"]);

    assert!(matches!(next_event(&mut u2.receiver).await, ServerEvent::Message(m) if m.body == "hi all"));
    assert!(u1.receiver.try_recv().is_err());
}

#[tokio::test]
async fn test_unknown_group_rejected() {
    let core = build_core(MessageMode::Channel, "a", None);

    let message = ChatMessage::new("U1", Target::Group("G404".into()), MessageKind::Chat, "hello?");
    let err = core.state.router.dispatch(message).await.unwrap_err();

    assert!(matches!(err, RouterError::UnknownGroup(ref id) if id == "G404"));
}

#[tokio::test]
async fn test_reconnect_replaces_session() {
    let core = build_core(MessageMode::Channel, "a", None);
    let hub = &core.state.hub;
    let mut first = hub.register("U1").unwrap();
    let mut second = hub.register("U1").unwrap();

    match next_event(&mut first.receiver).await {
        ServerEvent::Notice(notice) => assert_eq!(notice.code, NoticeCode::SessionReplaced),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(first.receiver.recv().await.is_none());

    // The stale connection cannot release the new one
    assert!(!hub.release("U1", first.connection_id));
    assert!(hub.is_online("U1"));

    core.state
        .router
        .dispatch(ChatMessage::chat("U2", "U1", "still here"))
        .await
        .unwrap();
    assert!(matches!(next_event(&mut second.receiver).await, ServerEvent::Message(m) if m.body == "still here"));
}
