//! Session correlation: registry lifecycle, dispatch and teardown.

mod common;

use common::{connect, settle, soon};
use remote_pubsub::{
    CancellationToken, GetOptions, Handler, InboundMessage, LinkConfig, MemoryConnector,
    OperationId, OutboundMessage, PutOptions, Received, Reply, Sample, Session, SessionError,
};
use rmpv::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

fn frame(fields: Vec<(&str, Value)>) -> Vec<u8> {
    let map = fields
        .into_iter()
        .map(|(k, v)| (Value::from(k), v))
        .collect();
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &Value::Map(map)).unwrap();
    bytes
}

#[tokio::test]
async fn test_put_and_delete_are_fire_and_forget() {
    let (session, mut broker) = connect().await;

    session
        .put("demo/a", "hello", PutOptions::default())
        .await
        .unwrap();
    session.delete("demo/a", PutOptions::default()).await.unwrap();

    match broker.expect().await {
        OutboundMessage::Put { key_expr, payload, .. } => {
            assert_eq!(key_expr, "demo/a");
            assert_eq!(payload, b"hello".to_vec());
        }
        other => panic!("expected put, got {:?}", other),
    }
    assert!(matches!(broker.expect().await, OutboundMessage::Delete { .. }));
    assert_eq!(session.pending_operations(), 0);
}

#[tokio::test]
async fn test_ids_are_unique_and_increasing() {
    let (session, mut broker) = connect().await;

    let a = session.declare_subscriber("a", Handler::default()).await.unwrap();
    let b = session.declare_subscriber("b", Handler::default()).await.unwrap();
    let c = session
        .declare_publisher("c", Default::default())
        .await
        .unwrap();

    assert!(a.id() < b.id() && b.id() < c.id());
    assert_eq!(session.pending_operations(), 3);

    assert_eq!(
        broker.expect().await,
        OutboundMessage::DeclareSubscriber {
            id: a.id(),
            key_expr: "a".into()
        }
    );
}

#[tokio::test]
async fn test_undeclare_twice_and_unknown_ids_are_noops() {
    let (session, mut broker) = connect().await;

    let subscriber = session
        .declare_subscriber("demo/**", Handler::default())
        .await
        .unwrap();
    broker.expect().await;

    subscriber.undeclare().await.unwrap();
    subscriber.undeclare().await.unwrap();
    session.undeclare(OperationId(9999)).await.unwrap();
    session.undeclare(subscriber.id()).await.unwrap();

    assert_eq!(
        broker.expect().await,
        OutboundMessage::UndeclareSubscriber { id: subscriber.id() }
    );
    broker.expect_silence().await;

    assert_eq!(subscriber.recv().await, Received::Disconnected);
    assert_eq!(session.pending_operations(), 0);
}

#[tokio::test]
async fn test_samples_reach_the_right_subscriber() {
    let (session, mut broker) = connect().await;

    let a = session.declare_subscriber("a/*", Handler::default()).await.unwrap();
    let b = session.declare_subscriber("b/*", Handler::default()).await.unwrap();

    broker.sample(b.id(), Sample::put("b/1", "for b")).await;
    broker.sample(a.id(), Sample::put("a/1", "for a")).await;

    let sample = soon(a.recv()).await.value().unwrap();
    assert_eq!(sample.key_expr, "a/1");
    let sample = soon(b.recv()).await.value().unwrap();
    assert_eq!(sample.payload_str(), "for b");
}

#[tokio::test]
async fn test_stale_ids_are_ignored() {
    let (session, mut broker) = connect().await;

    let subscriber = session
        .declare_subscriber("demo/**", Handler::default())
        .await
        .unwrap();

    broker.sample(OperationId(4242), Sample::put("demo/x", "lost")).await;
    broker.reply_final(OperationId(4243)).await;
    broker.sample(subscriber.id(), Sample::put("demo/y", "kept")).await;

    let sample = soon(subscriber.recv()).await.value().unwrap();
    assert_eq!(sample.key_expr, "demo/y");
    settle().await;
    assert_eq!(subscriber.receiver().unwrap().try_receive(), Received::NotYetAvailable);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_get_streams_replies_until_final() {
    let (session, mut broker) = connect().await;

    let replies = session
        .get("demo/*", GetOptions::with_parameters("x=1"), Handler::default())
        .await
        .unwrap()
        .unwrap();

    let id = match broker.expect().await {
        OutboundMessage::Get { id, key_expr, request } => {
            assert_eq!(key_expr, "demo/*");
            assert_eq!(request.parameters, "x=1");
            id
        }
        other => panic!("expected get, got {:?}", other),
    };
    assert_eq!(session.pending_operations(), 1);

    broker.reply(id, Sample::put("demo/1", "one")).await;
    broker.reply(id, Sample::put("demo/2", "two")).await;
    broker.reply_final(id).await;

    let first = soon(replies.receive()).await.value().unwrap();
    assert_eq!(first, Reply::Ok(Sample::put("demo/1", "one")));
    let second = soon(replies.receive()).await.value().unwrap();
    assert!(second.is_ok());
    assert_eq!(soon(replies.receive()).await, Received::Disconnected);
    assert_eq!(session.pending_operations(), 0);
}

#[tokio::test]
async fn test_precancelled_get_never_reaches_the_link() {
    let (session, mut broker) = connect().await;

    let token = CancellationToken::new();
    token.cancel();

    let replies = session
        .get("demo/*", GetOptions::default().cancellation(token), Handler::default())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(replies.try_receive(), Received::Disconnected);
    assert_eq!(session.pending_operations(), 0);
    broker.expect_silence().await;
}

#[tokio::test]
async fn test_cancel_mid_query_stops_delivery() {
    let (session, mut broker) = connect().await;

    let token = CancellationToken::new();
    let replies = session
        .get("demo/*", GetOptions::default().cancellation(token.clone()), Handler::default())
        .await
        .unwrap()
        .unwrap();
    let OutboundMessage::Get { id, .. } = broker.expect().await else {
        panic!("expected get");
    };

    broker.reply(id, Sample::put("demo/1", "before")).await;
    assert!(soon(replies.receive()).await.value().is_some());

    token.cancel();
    assert_eq!(session.pending_operations(), 0);

    // Late replies for the cancelled request go nowhere
    broker.reply(id, Sample::put("demo/2", "after")).await;
    settle().await;
    assert_eq!(replies.try_receive(), Received::Disconnected);

    // Cancellation is local only
    broker.expect_silence().await;
}

#[tokio::test]
async fn test_cancel_after_final_reply_changes_nothing() {
    let (session, mut broker) = connect().await;

    let subscriber = session
        .declare_subscriber("demo/**", Handler::default())
        .await
        .unwrap();
    broker.expect().await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    let token = CancellationToken::new();
    session
        .get(
            "demo/*",
            GetOptions::default().cancellation(token.clone()),
            Handler::callback(move |item: Received<Reply>| {
                seen.lock().unwrap().push(item.is_disconnected())
            }),
        )
        .await
        .unwrap();
    let OutboundMessage::Get { id, .. } = broker.expect().await else {
        panic!("expected get");
    };

    broker.reply(id, Sample::put("demo/1", "one")).await;
    broker.reply_final(id).await;
    settle().await;
    assert_eq!(*events.lock().unwrap(), vec![false, true]);
    assert_eq!(token.pending_actions(), 0);

    token.cancel();
    settle().await;

    assert_eq!(*events.lock().unwrap(), vec![false, true]);
    assert_eq!(session.pending_operations(), 1);
    broker.expect_silence().await;

    broker
        .sample(subscriber.id(), Sample::put("demo/a", "still here"))
        .await;
    assert!(soon(subscriber.recv()).await.value().is_some());
}

#[tokio::test]
async fn test_final_reply_after_cancel_is_stale() {
    let (session, mut broker) = connect().await;

    let disconnects = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&disconnects);
    let token = CancellationToken::new();
    session
        .get(
            "demo/*",
            GetOptions::default().cancellation(token.clone()),
            Handler::callback(move |item: Received<Reply>| {
                if item.is_disconnected() {
                    *counter.lock().unwrap() += 1;
                }
            }),
        )
        .await
        .unwrap();
    let OutboundMessage::Get { id, .. } = broker.expect().await else {
        panic!("expected get");
    };

    token.cancel();
    assert_eq!(*disconnects.lock().unwrap(), 1);

    broker.reply_final(id).await;
    settle().await;

    assert_eq!(*disconnects.lock().unwrap(), 1);
    assert_eq!(session.pending_operations(), 0);
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_shared_token_releases_finished_requests() {
    let (session, mut broker) = connect().await;
    let token = CancellationToken::new();

    for _ in 0..50 {
        session
            .get(
                "demo/*",
                GetOptions::default().cancellation(token.clone()),
                Handler::default(),
            )
            .await
            .unwrap();
        let OutboundMessage::Get { id, .. } = broker.expect().await else {
            panic!("expected get");
        };
        broker.reply_final(id).await;
    }
    settle().await;

    assert_eq!(session.pending_operations(), 0);
    assert_eq!(token.pending_actions(), 0);

    // Link loss releases the ones still running
    for _ in 0..3 {
        session
            .get(
                "demo/*",
                GetOptions::default().cancellation(token.clone()),
                Handler::default(),
            )
            .await
            .unwrap();
    }
    assert_eq!(token.pending_actions(), 3);
    broker.disconnect();
    settle().await;

    assert!(session.is_closed());
    assert_eq!(token.pending_actions(), 0);
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn test_malformed_envelope_is_delivered_in_band() {
    let (session, mut broker) = connect().await;

    let subscriber = session
        .declare_subscriber("demo/**", Handler::default())
        .await
        .unwrap();

    broker
        .push_raw(frame(vec![
            ("type", Value::from("sample")),
            ("subscriber_id", Value::from(subscriber.id().0)),
            ("sample", Value::from("not a map")),
        ]))
        .await;
    // Unreadable frames are dropped without harm
    broker.push_raw(vec![0xc1, 0x00]).await;
    broker.sample(subscriber.id(), Sample::put("demo/a", "fine")).await;

    match soon(subscriber.recv()).await {
        Received::Malformed(reason) => assert!(reason.contains("sample")),
        other => panic!("expected malformed marker, got {:?}", other),
    }
    assert!(soon(subscriber.recv()).await.value().is_some());
    assert_eq!(session.pending_operations(), 1);
}

#[tokio::test]
async fn test_broker_error_ends_a_query_with_an_error_reply() {
    let (session, mut broker) = connect().await;

    let replies = session
        .get("demo/*", GetOptions::default(), Handler::default())
        .await
        .unwrap()
        .unwrap();
    let OutboundMessage::Get { id, .. } = broker.expect().await else {
        panic!("expected get");
    };

    broker
        .push(InboundMessage::Error {
            id: Some(id),
            message: "no route".into(),
        })
        .await;

    match soon(replies.receive()).await {
        Received::Value(Reply::Err(err)) => assert_eq!(err.payload, b"no route".to_vec()),
        other => panic!("expected error reply, got {:?}", other),
    }
    assert_eq!(soon(replies.receive()).await, Received::Disconnected);
    assert_eq!(session.pending_operations(), 0);
}

#[tokio::test]
async fn test_broker_undeclare_ends_subscription() {
    let (session, mut broker) = connect().await;

    let subscriber = session
        .declare_subscriber("demo/**", Handler::default())
        .await
        .unwrap();
    broker.expect().await;

    broker.sample(subscriber.id(), Sample::put("demo/a", "last")).await;
    broker.push(InboundMessage::Undeclared { id: subscriber.id() }).await;

    assert!(soon(subscriber.recv()).await.value().is_some());
    assert_eq!(soon(subscriber.recv()).await, Received::Disconnected);

    // Already gone: undeclaring sends nothing
    subscriber.undeclare().await.unwrap();
    broker.expect_silence().await;
}

#[tokio::test]
async fn test_closing_the_receiver_withdraws_the_subscription() {
    let (session, mut broker) = connect().await;

    let subscriber = session
        .declare_subscriber("demo/**", Handler::default())
        .await
        .unwrap();
    broker.expect().await;

    subscriber.receiver().unwrap().close();
    broker.sample(subscriber.id(), Sample::put("demo/a", "unwanted")).await;

    assert_eq!(
        broker.expect().await,
        OutboundMessage::UndeclareSubscriber { id: subscriber.id() }
    );
    assert_eq!(session.pending_operations(), 0);
}

#[tokio::test]
async fn test_link_loss_disconnects_every_pending_operation() {
    let (session, mut broker) = connect().await;

    let subscriber = session
        .declare_subscriber("demo/**", Handler::default())
        .await
        .unwrap();
    let replies = session
        .get("demo/*", GetOptions::default(), Handler::default())
        .await
        .unwrap()
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    let cleaned = Arc::new(AtomicBool::new(false));
    let cleanup = Arc::clone(&cleaned);
    let _callback_subscriber = session
        .declare_subscriber(
            "other/**",
            Handler::callback_with_drop(
                move |item: Received<Sample>| seen.lock().unwrap().push(item.is_disconnected()),
                move || cleanup.store(true, Ordering::SeqCst),
            ),
        )
        .await
        .unwrap();

    broker.disconnect();

    assert_eq!(soon(subscriber.recv()).await, Received::Disconnected);
    assert_eq!(soon(replies.receive()).await, Received::Disconnected);
    assert_eq!(*events.lock().unwrap(), vec![true]);
    assert!(cleaned.load(Ordering::SeqCst));
    assert!(session.is_closed());
    assert_eq!(session.pending_operations(), 0);

    let result = session.declare_subscriber("late", Handler::default()).await;
    assert!(matches!(result, Err(SessionError::Closed)));
    assert!(matches!(
        session.put("late", "x", PutOptions::default()).await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test]
async fn test_close_disconnects_and_is_idempotent() {
    let (session, _broker) = connect().await;

    let subscriber = session
        .declare_subscriber("demo/**", Handler::Ring(4))
        .await
        .unwrap();

    session.close();
    session.close();

    assert!(session.is_closed());
    assert_eq!(subscriber.recv().await, Received::Disconnected);
    subscriber.undeclare().await.unwrap();
}

#[tokio::test]
async fn test_declare_with_callback_on_closed_session_runs_cleanup() {
    let (session, _broker) = connect().await;
    session.close();

    let cleaned = Arc::new(AtomicBool::new(false));
    let cleanup = Arc::clone(&cleaned);
    let result = session
        .declare_subscriber(
            "demo/**",
            Handler::callback_with_drop(|_: Received<Sample>| {}, move || {
                cleanup.store(true, Ordering::SeqCst)
            }),
        )
        .await;

    assert!(matches!(result, Err(SessionError::Closed)));
    assert!(cleaned.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_open_rejects_unknown_scheme() {
    let (connector, _peer) = MemoryConnector::new();
    let result = Session::open_with("tcp/broker:1", &connector, LinkConfig::default()).await;
    assert!(matches!(result, Err(SessionError::InvalidEndpoint(_))));
}
