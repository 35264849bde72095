//! Shared helpers: a session wired to a scripted in-memory broker.

#![allow(dead_code)]

use remote_pubsub::protocol::QueryData;
use remote_pubsub::{
    InboundMessage, LinkConfig, MemoryConnector, MemoryPeer, OperationId, OutboundMessage, Reply,
    Sample, Session,
};
use std::time::Duration;

/// The broker end of a test session.
pub struct Broker {
    peer: MemoryPeer,
}

pub async fn connect() -> (Session, Broker) {
    let (connector, peer) = MemoryConnector::new();
    let session = Session::open_with("ws/broker.test:10000", &connector, LinkConfig::default())
        .await
        .expect("memory session should open");
    (session, Broker { peer })
}

impl Broker {
    /// Next envelope the client sent.
    pub async fn expect(&mut self) -> OutboundMessage {
        let frame = tokio::time::timeout(Duration::from_secs(1), self.peer.recv())
            .await
            .expect("client should have sent an envelope")
            .expect("client connection closed");
        OutboundMessage::decode(&frame).expect("client envelope should decode")
    }

    /// Assert nothing more was sent.
    pub async fn expect_silence(&mut self) {
        settle().await;
        if let Some(frame) = self.peer.try_recv() {
            panic!("unexpected envelope: {:?}", OutboundMessage::decode(&frame));
        }
    }

    pub async fn push(&mut self, message: InboundMessage) {
        self.push_raw(message.encode().unwrap()).await;
    }

    pub async fn push_raw(&mut self, frame: Vec<u8>) {
        self.peer.send(frame).await.unwrap();
    }

    pub async fn sample(&mut self, subscriber_id: OperationId, sample: Sample) {
        self.push(InboundMessage::Sample {
            subscriber_id,
            sample,
        })
        .await;
    }

    pub async fn reply(&mut self, request_id: OperationId, sample: Sample) {
        self.push(InboundMessage::Reply {
            request_id,
            reply: Reply::Ok(sample),
        })
        .await;
    }

    pub async fn reply_final(&mut self, request_id: OperationId) {
        self.push(InboundMessage::ReplyFinal { request_id }).await;
    }

    pub async fn query(&mut self, queryable_id: OperationId, query_id: u32, key_expr: &str) {
        self.push(InboundMessage::Query {
            queryable_id,
            query: QueryData {
                query_id: OperationId(query_id),
                key_expr: key_expr.to_string(),
                ..Default::default()
            },
        })
        .await;
    }

    pub fn disconnect(&mut self) {
        self.peer.disconnect();
    }
}

/// Let the link tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Await a future that should already be resolvable.
pub async fn soon<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(1), future)
        .await
        .expect("timed out")
}
