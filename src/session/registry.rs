//! Pending-operation registry
//!
//! Maps correlation ids to the record of the live operation. Removal is the
//! single terminal transition of a record: whichever path removes it first
//! (terminal envelope, undeclare, cancellation, link loss) owns the teardown,
//! and every later path finds nothing and does nothing.

use std::collections::HashMap;

use super::handler::Sink;
use crate::cancel::{ActionKey, CancellationToken};
use crate::channel::Received;
use crate::handles::Query;
use crate::protocol::{OperationId, OutboundMessage};
use crate::sample::{MatchingStatus, Reply, Sample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind {
    Publisher,
    Subscriber,
    Queryable,
    Querier,
    LivelinessToken,
    LivelinessSubscriber,
    MatchingListener,
    Get,
    QuerierGet,
    LivelinessGet,
}

impl OperationKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Publisher => "publisher",
            OperationKind::Subscriber => "subscriber",
            OperationKind::Queryable => "queryable",
            OperationKind::Querier => "querier",
            OperationKind::LivelinessToken => "liveliness_token",
            OperationKind::LivelinessSubscriber => "liveliness_subscriber",
            OperationKind::MatchingListener => "matching_listener",
            OperationKind::Get => "get",
            OperationKind::QuerierGet => "querier_get",
            OperationKind::LivelinessGet => "liveliness_get",
        }
    }

    /// The envelope that withdraws a declaration. Requests have none.
    pub(crate) fn undeclare_message(&self, id: OperationId) -> Option<OutboundMessage> {
        match self {
            OperationKind::Publisher => Some(OutboundMessage::UndeclarePublisher { id }),
            OperationKind::Subscriber => Some(OutboundMessage::UndeclareSubscriber { id }),
            OperationKind::Queryable => Some(OutboundMessage::UndeclareQueryable { id }),
            OperationKind::Querier => Some(OutboundMessage::UndeclareQuerier { id }),
            OperationKind::LivelinessToken => {
                Some(OutboundMessage::UndeclareLivelinessToken { id })
            }
            OperationKind::LivelinessSubscriber => {
                Some(OutboundMessage::UndeclareLivelinessSubscriber { id })
            }
            OperationKind::MatchingListener => {
                Some(OutboundMessage::UndeclareMatchingListener { id })
            }
            OperationKind::Get | OperationKind::QuerierGet | OperationKind::LivelinessGet => None,
        }
    }
}

/// Result sink of a record, typed by what the operation produces.
pub(crate) enum RecordSink {
    Samples(Sink<Sample>),
    Queries(Sink<Query>),
    Replies(Sink<Reply>),
    Matching(Sink<MatchingStatus>),
    /// Declarations that produce nothing (publishers, tokens, queriers).
    Bare,
}

impl RecordSink {
    pub(crate) fn malformed(&mut self, reason: String) {
        match self {
            RecordSink::Samples(sink) => sink.deliver(Received::Malformed(reason)),
            RecordSink::Queries(sink) => sink.deliver(Received::Malformed(reason)),
            RecordSink::Replies(sink) => sink.deliver(Received::Malformed(reason)),
            RecordSink::Matching(sink) => sink.deliver(Received::Malformed(reason)),
            RecordSink::Bare => {}
        }
    }

    pub(crate) fn is_detached(&self) -> bool {
        match self {
            RecordSink::Samples(sink) => sink.is_detached(),
            RecordSink::Queries(sink) => sink.is_detached(),
            RecordSink::Replies(sink) => sink.is_detached(),
            RecordSink::Matching(sink) => sink.is_detached(),
            RecordSink::Bare => false,
        }
    }

    pub(crate) fn close(self) {
        match self {
            RecordSink::Samples(sink) => sink.close(),
            RecordSink::Queries(sink) => sink.close(),
            RecordSink::Replies(sink) => sink.close(),
            RecordSink::Matching(sink) => sink.close(),
            RecordSink::Bare => {}
        }
    }
}

pub(crate) struct PendingRecord {
    pub(crate) kind: OperationKind,
    /// `None` while the dispatcher is delivering to it.
    pub(crate) sink: Option<RecordSink>,
    /// Action that discards this record when the request's token fires
    cancellation: Option<(CancellationToken, ActionKey)>,
}

impl PendingRecord {
    pub(crate) fn new(kind: OperationKind, sink: RecordSink) -> Self {
        Self {
            kind,
            sink: Some(sink),
            cancellation: None,
        }
    }

    /// Tear down the record's sink, if it is not out for delivery, and
    /// withdraw its cancellation action.
    ///
    /// A sink that is out for delivery is closed by the dispatcher when it
    /// finds the record gone.
    pub(crate) fn close(self) {
        if let Some((token, key)) = self.cancellation {
            token.unregister(key);
        }
        if let Some(sink) = self.sink {
            sink.close();
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    records: HashMap<OperationId, PendingRecord>,
}

impl Registry {
    pub(crate) fn insert(&mut self, id: OperationId, record: PendingRecord) {
        self.records.insert(id, record);
    }

    pub(crate) fn contains(&self, id: OperationId) -> bool {
        self.records.contains_key(&id)
    }

    pub(crate) fn remove(&mut self, id: OperationId) -> Option<PendingRecord> {
        self.records.remove(&id)
    }

    /// Link a cancellation action to a record. Returns false if the record
    /// is already gone, in which case the caller withdraws the action.
    pub(crate) fn attach_cancellation(
        &mut self,
        id: OperationId,
        token: CancellationToken,
        key: ActionKey,
    ) -> bool {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.cancellation = Some((token, key));
                true
            }
            None => false,
        }
    }

    /// Borrow a record's sink for delivery outside the lock.
    pub(crate) fn take_sink(&mut self, id: OperationId) -> Option<RecordSink> {
        self.records.get_mut(&id).and_then(|record| record.sink.take())
    }

    /// Return a borrowed sink. Hands it back if the record was removed meanwhile.
    pub(crate) fn restore(&mut self, id: OperationId, sink: RecordSink) -> Result<(), RecordSink> {
        match self.records.get_mut(&id) {
            Some(record) => {
                record.sink = Some(sink);
                Ok(())
            }
            None => Err(sink),
        }
    }

    /// Remove every record, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<(OperationId, PendingRecord)> {
        let mut records: Vec<_> = self.records.drain().collect();
        records.sort_by_key(|(id, _)| *id);
        records
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}
