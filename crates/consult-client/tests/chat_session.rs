//! Chat session lifecycle against scripted channels: join/history
//! startup, consultation switching, stale-frame discard, and the
//! degraded send paths.

use std::sync::Arc;
use std::time::Duration;

use time::macros::datetime;
use url::Url;

use consult_client::proto::{ChatMessage, Frame, SenderRole};
use consult_client::testing::{FailingHistory, MockChannelFactory, StaticHistory};
use consult_client::{ChannelState, ChatSession, ClientConfig, Identity};

fn config() -> ClientConfig {
    ClientConfig::new(
        Url::parse("ws://relay.test").unwrap(),
        Url::parse("http://api.test").unwrap(),
    )
}

fn identity() -> Identity {
    Identity::new("user-1", SenderRole::User)
}

fn history_message(id: &str, consultation_id: i64) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        message: format!("history {id}"),
        created_at: datetime!(2024-05-01 09:00:00 UTC),
        sender: SenderRole::Doctor,
        sender_id: "doctor-9".to_string(),
        consultation_id,
    }
}

fn live_message(id: &str, consultation_id: i64, text: &str) -> Frame {
    Frame::Message {
        id: Some(id.to_string()),
        message: text.to_string(),
        consultation_id,
        sender_id: "doctor-9".to_string(),
        sender_type: SenderRole::Doctor,
        created_at: datetime!(2024-05-01 10:00:00 UTC),
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test(flavor = "multi_thread")]
async fn selecting_a_consultation_joins_and_seeds_history() {
    let factory = Arc::new(MockChannelFactory::new());
    let (channel, _inject) = factory.push_channel("chat-42");
    let history = Arc::new(StaticHistory::new(vec![history_message("h1", 42)]));

    let session = ChatSession::new(identity(), config(), factory.clone(), history);
    session.select_consultation(42, "doctor-9").await.unwrap();

    wait_for(|| !session.is_loading()).await;

    let sent = channel.sent();
    assert!(matches!(
        &sent[0],
        Frame::Join {
            sender_id,
            consultation_id: 42,
            ..
        } if sender_id == "user-1"
    ));

    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "h1");
}

#[tokio::test(flavor = "multi_thread")]
async fn switching_tears_down_before_reconnecting() {
    let factory = Arc::new(MockChannelFactory::new());
    let (_ch42, _inject42) = factory.push_channel("chat-42");
    let (_ch43, inject43) = factory.push_channel("chat-43");
    let history = Arc::new(StaticHistory::new(vec![]));

    let session = ChatSession::new(identity(), config(), factory.clone(), history);
    session.select_consultation(42, "doctor-9").await.unwrap();
    session.select_consultation(43, "doctor-9").await.unwrap();

    assert_eq!(
        factory.events(),
        vec![
            "open /consultations/ws/chat/42".to_string(),
            "close chat-42".to_string(),
            "open /consultations/ws/chat/43".to_string(),
        ]
    );

    // A late frame from the closed consultation must not surface.
    inject43.send(live_message("stale-1", 42, "late")).unwrap();
    inject43.send(live_message("fresh-1", 43, "current")).unwrap();
    wait_for(|| !session.messages().is_empty()).await;

    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "fresh-1");
}

#[tokio::test(flavor = "multi_thread")]
async fn switching_mid_connect_discards_the_straggler_socket() {
    let factory = Arc::new(MockChannelFactory::new());
    let (ch42, _inject42) = factory.push_channel_delayed("chat-42", Duration::from_millis(100));
    let (ch43, _inject43) = factory.push_channel("chat-43");
    let history = Arc::new(StaticHistory::new(vec![]));

    let session = Arc::new(ChatSession::new(identity(), config(), factory.clone(), history));

    // Start selecting 42 and switch to 43 while its connect is still in
    // flight. The late socket must be closed, never installed.
    let racing = Arc::clone(&session);
    let first = tokio::spawn(async move { racing.select_consultation(42, "doctor-9").await });
    wait_for(|| session.active_consultation() == Some(42)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    session.select_consultation(43, "doctor-9").await.unwrap();

    first.await.unwrap().unwrap();

    assert_eq!(ch42.close_count(), 1, "stale socket must be closed");
    assert!(ch42.sent().is_empty(), "stale socket must not receive a join");
    assert_eq!(session.active_consultation(), Some(43));

    session.send_message("hello");
    let sent = ch43.sent();
    assert!(ch42.sent().is_empty());
    assert!(matches!(
        &sent[1],
        Frame::Message {
            consultation_id: 43,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn reselecting_the_active_consultation_is_a_noop() {
    let factory = Arc::new(MockChannelFactory::new());
    let (_channel, _inject) = factory.push_channel("chat-42");
    let history = Arc::new(StaticHistory::new(vec![]));

    let session = ChatSession::new(identity(), config(), factory.clone(), history);
    session.select_consultation(42, "doctor-9").await.unwrap();
    session.select_consultation(42, "doctor-9").await.unwrap();

    assert_eq!(factory.events().len(), 1, "only one open expected");
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_deliveries_surface_once() {
    let factory = Arc::new(MockChannelFactory::new());
    let (_channel, inject) = factory.push_channel("chat-42");
    let history = Arc::new(StaticHistory::new(vec![]));

    let session = ChatSession::new(identity(), config(), factory, history);
    session.select_consultation(42, "doctor-9").await.unwrap();

    inject.send(live_message("m1", 42, "hello")).unwrap();
    inject.send(live_message("m1", 42, "hello")).unwrap();
    wait_for(|| !session.messages().is_empty()).await;
    // Give the second delivery time to be folded away.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session.messages().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn live_frames_survive_a_slow_history_fetch() {
    let factory = Arc::new(MockChannelFactory::new());
    let (_channel, inject) = factory.push_channel("chat-42");
    let history = Arc::new(
        StaticHistory::new(vec![history_message("h1", 42)])
            .with_delay(Duration::from_millis(100)),
    );

    let session = ChatSession::new(identity(), config(), factory, history);
    session.select_consultation(42, "doctor-9").await.unwrap();

    inject.send(live_message("live-1", 42, "raced in")).unwrap();
    wait_for(|| !session.is_loading()).await;

    let ids: Vec<String> = session.messages().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["h1".to_string(), "live-1".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn degraded_sends_are_silent_noops() {
    let factory = Arc::new(MockChannelFactory::new());
    let (channel, _inject) = factory.push_channel("chat-42");
    let history = Arc::new(StaticHistory::new(vec![]));

    let session = ChatSession::new(identity(), config(), factory, history);
    session.select_consultation(42, "doctor-9").await.unwrap();

    session.send_message("   ");
    assert_eq!(channel.sent().len(), 1, "blank message must not hit the wire");

    channel.set_state(ChannelState::Closed);
    session.send_message("hello");
    session.send_typing(true);
    assert_eq!(channel.sent().len(), 1, "sends on a closed socket are dropped");
}

#[tokio::test(flavor = "multi_thread")]
async fn sent_messages_carry_a_client_id() {
    let factory = Arc::new(MockChannelFactory::new());
    let (channel, _inject) = factory.push_channel("chat-42");
    let history = Arc::new(StaticHistory::new(vec![]));

    let session = ChatSession::new(identity(), config(), factory, history);
    session.select_consultation(42, "doctor-9").await.unwrap();

    session.send_message("hello doctor");
    let sent = channel.sent();
    let Frame::Message { id, message, consultation_id, .. } = &sent[1] else {
        panic!("expected a message frame, got {:?}", sent[1]);
    };
    assert!(id.is_some());
    assert_eq!(message, "hello doctor");
    assert_eq!(*consultation_id, 42);
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_failure_clears_the_selection_for_retry() {
    let factory = Arc::new(MockChannelFactory::new());
    let history = Arc::new(StaticHistory::new(vec![]));

    let session = ChatSession::new(identity(), config(), factory.clone(), history);
    // Nothing scripted, so the open fails.
    assert!(session.select_consultation(42, "doctor-9").await.is_err());
    assert_eq!(session.active_consultation(), None);
    assert!(!session.is_loading());

    // Selecting the same consultation again retries instead of no-opping.
    let (_channel, _inject) = factory.push_channel("chat-42");
    session.select_consultation(42, "doctor-9").await.unwrap();
    assert_eq!(session.active_consultation(), Some(42));
}

#[tokio::test(flavor = "multi_thread")]
async fn history_failure_still_leaves_the_session_usable() {
    let factory = Arc::new(MockChannelFactory::new());
    let (_channel, inject) = factory.push_channel("chat-42");

    let session = ChatSession::new(identity(), config(), factory, Arc::new(FailingHistory));
    session.select_consultation(42, "doctor-9").await.unwrap();
    wait_for(|| !session.is_loading()).await;

    assert_eq!(session.active_consultation(), Some(42));
    inject.send(live_message("m1", 42, "hello")).unwrap();
    wait_for(|| !session.messages().is_empty()).await;
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn typing_and_presence_frames_fold_into_state() {
    let factory = Arc::new(MockChannelFactory::new());
    let (_channel, inject) = factory.push_channel("chat-42");
    let history = Arc::new(StaticHistory::new(vec![]));

    let session = ChatSession::new(identity(), config(), factory, history);
    session.select_consultation(42, "doctor-9").await.unwrap();

    inject
        .send(Frame::Typing {
            sender_id: "doctor-9".to_string(),
            consultation_id: 42,
            is_typing: true,
        })
        .unwrap();
    wait_for(|| session.counterpart_typing()).await;

    inject
        .send(Frame::Status {
            user_id: "doctor-9".to_string(),
            status: consult_client::proto::PresenceStatus::Online,
        })
        .unwrap();
    wait_for(|| session.is_online("doctor-9")).await;

    // Typing for some other consultation is ignored.
    inject
        .send(Frame::Typing {
            sender_id: "doctor-9".to_string(),
            consultation_id: 41,
            is_typing: false,
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.counterpart_typing());
}
