//! Broker Session
//!
//! Single responsibility: correlate everything sent over one [`Link`] with
//! everything that comes back.
//!
//! # The Key Abstraction
//!
//! A `Session` can only be created by [`Session::open`] or
//! [`Session::open_with`], which return once the link is up. If you have a
//! `Session`, you can declare things and send requests.
//!
//! # Correlation
//!
//! Every declaration and request gets an [`OperationId`] from one counter and
//! a pending record in the registry. Inbound envelopes carry the id back:
//!
//! ```text
//!   declare_subscriber(id=7) ─────────►
//!                             ◄───────── sample(subscriber_id=7)   streaming
//!                             ◄───────── sample(subscriber_id=7)   streaming
//!   get(id=8) ────────────────────────►
//!                             ◄───────── reply(request_id=8)       streaming
//!                             ◄───────── reply_final(request_id=8) terminal
//! ```
//!
//! Envelopes for ids with no record (already undeclared, cancelled, or never
//! issued) are dropped.
//!
//! # Lifecycle
//!
//! Sessions do not reconnect. When the link drops, every pending operation
//! sees `Disconnected` and the session reports `is_closed()`.

mod handler;
pub(crate) mod registry;

pub use handler::{Handler, DEFAULT_CHANNEL_CAPACITY};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};

use self::registry::{OperationKind, PendingRecord, RecordSink, Registry};
use crate::cancel::CancellationToken;
use crate::channel::{BoundedChannel, Received};
use crate::config::{LinkConfig, SessionConfig};
use crate::error::SessionError;
use crate::handles::{
    Liveliness, OperationHandle, Publisher, Querier, Query, Queryable, Subscriber,
};
use crate::link::{Connector, Link, LinkEvent, WebSocketConnector};
use crate::options::{GetOptions, PublisherOptions, PutOptions, QuerierOptions};
use crate::protocol::{DecodeError, InboundMessage, OperationId, OutboundMessage, QueryRequest};
use crate::sample::{MatchingStatus, Reply, ReplyError, Sample};

/// A live session with the broker.
///
/// Cloning yields another handle to the same session. The link closes when
/// [`Session::close`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    link: Link,
    registry: Mutex<Registry>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl Session {
    /// Open a session over WebSocket, as configured.
    pub async fn open(config: &SessionConfig) -> Result<Self, SessionError> {
        Self::open_with(&config.endpoint, &WebSocketConnector, config.link.clone()).await
    }

    /// Open a session over any connector.
    ///
    /// # Errors
    /// - `InvalidEndpoint` if the endpoint cannot be normalized
    /// - `Connection` once every connection attempt has failed
    pub async fn open_with(
        endpoint: &str,
        connector: &dyn Connector,
        link_config: LinkConfig,
    ) -> Result<Self, SessionError> {
        let link = Link::open(endpoint, connector, link_config).await?;
        info!(url = %link.url(), "Session established");

        let inner = Arc::new(SessionInner {
            link,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.link.on_message(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_link_event(event);
            }
        });

        Ok(Self { inner })
    }

    /// Publish a value.
    pub async fn put(
        &self,
        key_expr: &str,
        payload: impl Into<Vec<u8>>,
        options: PutOptions,
    ) -> Result<(), SessionError> {
        self.inner
            .send(&OutboundMessage::Put {
                key_expr: key_expr.to_string(),
                payload: payload.into(),
                options,
            })
            .await
    }

    /// Publish a deletion.
    pub async fn delete(&self, key_expr: &str, options: PutOptions) -> Result<(), SessionError> {
        self.inner
            .send(&OutboundMessage::Delete {
                key_expr: key_expr.to_string(),
                options,
            })
            .await
    }

    /// Query the broker.
    ///
    /// Replies stream into `handler` until the final marker arrives, the
    /// cancellation token in `options` fires, or the session closes. Returns
    /// the reply channel for channel handlers.
    ///
    /// A token that is already cancelled creates and tears down the request
    /// locally: nothing is sent and the channel is already disconnected.
    pub async fn get(
        &self,
        key_expr: &str,
        options: GetOptions,
        handler: Handler<Reply>,
    ) -> Result<Option<BoundedChannel<Reply>>, SessionError> {
        let (sink, channel) = handler.into_sink();
        let cancellation = options.cancellation.clone();
        let key_expr = key_expr.to_string();
        self.inner
            .register(
                OperationKind::Get,
                RecordSink::Replies(sink),
                cancellation.as_ref(),
                move |id| OutboundMessage::Get {
                    id,
                    key_expr,
                    request: query_request(options),
                },
            )
            .await?;
        Ok(channel)
    }

    pub async fn declare_publisher(
        &self,
        key_expr: &str,
        options: PublisherOptions,
    ) -> Result<Publisher, SessionError> {
        let message_options = options.clone();
        let key = key_expr.to_string();
        let id = self
            .inner
            .register(OperationKind::Publisher, RecordSink::Bare, None, move |id| {
                OutboundMessage::DeclarePublisher {
                    id,
                    key_expr: key,
                    options: message_options,
                }
            })
            .await?;
        Ok(Publisher::new(self.handle(id), key_expr, options))
    }

    pub async fn declare_subscriber(
        &self,
        key_expr: &str,
        handler: Handler<Sample>,
    ) -> Result<Subscriber, SessionError> {
        let (sink, channel) = handler.into_sink();
        let key = key_expr.to_string();
        let id = self
            .inner
            .register(
                OperationKind::Subscriber,
                RecordSink::Samples(sink),
                None,
                move |id| OutboundMessage::DeclareSubscriber { id, key_expr: key },
            )
            .await?;
        Ok(Subscriber::new(self.handle(id), key_expr, channel))
    }

    /// Declare a queryable. `complete` tells the broker this queryable
    /// answers for the whole key expression.
    pub async fn declare_queryable(
        &self,
        key_expr: &str,
        complete: bool,
        handler: Handler<Query>,
    ) -> Result<Queryable, SessionError> {
        let (sink, channel) = handler.into_sink();
        let key = key_expr.to_string();
        let id = self
            .inner
            .register(
                OperationKind::Queryable,
                RecordSink::Queries(sink),
                None,
                move |id| OutboundMessage::DeclareQueryable {
                    id,
                    key_expr: key,
                    complete,
                },
            )
            .await?;
        Ok(Queryable::new(self.handle(id), key_expr, channel))
    }

    pub async fn declare_querier(
        &self,
        key_expr: &str,
        options: QuerierOptions,
    ) -> Result<Querier, SessionError> {
        let message_options = options.clone();
        let key = key_expr.to_string();
        let id = self
            .inner
            .register(OperationKind::Querier, RecordSink::Bare, None, move |id| {
                OutboundMessage::DeclareQuerier {
                    id,
                    key_expr: key,
                    options: message_options,
                }
            })
            .await?;
        Ok(Querier::new(self.handle(id), key_expr, options))
    }

    /// Liveliness tokens, subscribers and queries.
    pub fn liveliness(&self) -> Liveliness<'_> {
        Liveliness::new(self)
    }

    /// Withdraw an operation by id.
    ///
    /// Unknown or already-removed ids are a no-op.
    pub async fn undeclare(&self, id: OperationId) -> Result<(), SessionError> {
        self.inner.undeclare(id).await
    }

    /// Close the session and its link. Idempotent.
    ///
    /// Every pending operation sees `Disconnected`.
    pub fn close(&self) {
        self.inner.shutdown("closed by application");
        self.inner.link.close();
    }

    /// True once closed, locally or because the link dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of operations with a live record.
    pub fn pending_operations(&self) -> usize {
        self.inner.registry().len()
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    fn handle(&self, id: OperationId) -> OperationHandle {
        OperationHandle::new(id, &self.inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.inner.link.url())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_operations())
            .finish()
    }
}

pub(crate) fn query_request(options: GetOptions) -> QueryRequest {
    QueryRequest {
        parameters: options.parameters,
        payload: options.payload,
        encoding: options.encoding,
        attachment: options.attachment,
        target: options.target,
        consolidation: options.consolidation,
        timeout_ms: options.timeout.map(|t| t.as_millis() as u64),
    }
}

impl SessionInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> OperationId {
        OperationId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || !self.link.is_open()
    }

    /// True while the operation still has a record.
    pub(crate) fn is_live(&self, id: OperationId) -> bool {
        self.registry().contains(id)
    }

    /// Encode and send, waiting on link backpressure.
    pub(crate) async fn send(&self, message: &OutboundMessage) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let frame = message.encode()?;
        trace!(kind = message.kind(), bytes = frame.len(), "Sending envelope");
        self.link.send(frame).await
    }

    /// Encode and queue without waiting. For teardown paths.
    pub(crate) fn try_send(&self, message: &OutboundMessage) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.link.try_send(message.encode()?)
    }

    /// Create a pending record, then send the envelope that starts it.
    ///
    /// The record exists before the envelope leaves, so no result can race
    /// past it. A cancelled `cancellation` removes the record; if that has
    /// already happened by the time the envelope is built, nothing is sent.
    /// Whichever way the record ends, its action leaves the token.
    pub(crate) async fn register(
        self: &Arc<Self>,
        kind: OperationKind,
        sink: RecordSink,
        cancellation: Option<&CancellationToken>,
        build: impl FnOnce(OperationId) -> OutboundMessage,
    ) -> Result<OperationId, SessionError> {
        if self.is_closed() {
            sink.close();
            return Err(SessionError::Closed);
        }

        let id = self.allocate_id();
        self.registry().insert(id, PendingRecord::new(kind, sink));

        if let Some(token) = cancellation {
            let weak = Arc::downgrade(self);
            let key = token.register(move || {
                if let Some(inner) = weak.upgrade() {
                    if inner.discard(id) {
                        debug!(id = %id, "Operation cancelled");
                    }
                }
            });
            let attached = self.registry().attach_cancellation(id, token.clone(), key);
            if !attached {
                token.unregister(key);
            }
        }

        if !self.is_live(id) {
            debug!(id = %id, kind = kind.as_str(), "Cancelled before sending");
            return Ok(id);
        }

        let message = build(id);
        if let Err(e) = self.send(&message).await {
            warn!(id = %id, kind = kind.as_str(), error = %e, "Failed to send envelope");
            self.discard(id);
            return Err(e);
        }

        debug!(id = %id, kind = kind.as_str(), "Operation registered");
        Ok(id)
    }

    /// Remove a record locally and close its sink. Returns false if it was
    /// already gone.
    pub(crate) fn discard(&self, id: OperationId) -> bool {
        let removed = self.registry().remove(id);
        match removed {
            Some(record) => {
                record.close();
                true
            }
            None => false,
        }
    }

    /// Remove a record and tell the broker, waiting on backpressure.
    pub(crate) async fn undeclare(&self, id: OperationId) -> Result<(), SessionError> {
        let removed = self.registry().remove(id);
        let Some(record) = removed else {
            debug!(id = %id, "Undeclare of unknown operation ignored");
            return Ok(());
        };

        let message = record.kind.undeclare_message(id);
        debug!(id = %id, kind = record.kind.as_str(), "Undeclaring");
        record.close();

        match message {
            Some(message) => match self.send(&message).await {
                Err(SessionError::Closed) => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }

    /// Like [`undeclare`](Self::undeclare), without suspending. Used on drop.
    pub(crate) fn undeclare_detached(&self, id: OperationId) {
        let removed = self.registry().remove(id);
        let Some(record) = removed else {
            return;
        };

        let message = record.kind.undeclare_message(id);
        debug!(id = %id, kind = record.kind.as_str(), "Undeclaring on drop");
        record.close();

        if let Some(message) = message {
            if let Err(e) = self.try_send(&message) {
                debug!(id = %id, error = %e, "Undeclare not sent");
            }
        }
    }

    fn on_link_event(self: &Arc<Self>, event: LinkEvent) {
        match event {
            LinkEvent::Frame(frame) => self.dispatch(&frame),
            LinkEvent::Closed => self.shutdown("link closed"),
        }
    }

    fn dispatch(self: &Arc<Self>, frame: &[u8]) {
        let message = match InboundMessage::decode(frame) {
            Ok(message) => message,
            Err(DecodeError {
                correlation: Some(id),
                reason,
            }) => {
                warn!(id = %id, reason = %reason, "Malformed envelope");
                let delivered = self.with_sink(id, |sink| sink.malformed(reason));
                if !delivered {
                    debug!(id = %id, "Malformed envelope for unknown operation dropped");
                }
                return;
            }
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let Some(id) = message.correlation() else {
            if let InboundMessage::Error { message, .. } = &message {
                warn!(message = %message, "Broker error");
            }
            return;
        };

        trace!(id = %id, kind = message.kind(), "Dispatching envelope");
        let terminal = message.is_terminal() || matches!(message, InboundMessage::Error { .. });

        let delivered = match message {
            InboundMessage::ReplyFinal { .. } | InboundMessage::Undeclared { .. } => {
                self.is_live(id)
            }
            message => self.with_sink(id, |sink| self.deliver(sink, message)),
        };

        if !delivered {
            debug!(id = %id, "Envelope for unknown operation dropped");
            return;
        }

        if terminal && self.discard(id) {
            debug!(id = %id, "Operation finished");
        }
    }

    /// Run `f` on a record's sink outside the registry lock.
    ///
    /// Returns false for unknown ids. If the record is removed while `f`
    /// runs, the sink is closed here instead of going back. If the
    /// application has closed its receiving channel, the operation is
    /// withdrawn.
    fn with_sink(&self, id: OperationId, f: impl FnOnce(&mut RecordSink)) -> bool {
        let taken = self.registry().take_sink(id);
        let Some(mut sink) = taken else {
            return false;
        };

        f(&mut sink);
        let detached = sink.is_detached();

        let restored = self.registry().restore(id, sink);
        match restored {
            Err(orphan) => orphan.close(),
            Ok(()) if detached => {
                debug!(id = %id, "Receiver closed by application");
                self.undeclare_detached(id);
            }
            Ok(()) => {}
        }
        true
    }

    fn deliver(self: &Arc<Self>, sink: &mut RecordSink, message: InboundMessage) {
        match (sink, message) {
            (RecordSink::Samples(sink), InboundMessage::Sample { sample, .. }) => {
                sink.deliver(Received::Value(sample))
            }
            (RecordSink::Queries(sink), InboundMessage::Query { query, .. }) => {
                sink.deliver(Received::Value(Query::new(query, Arc::downgrade(self))))
            }
            (RecordSink::Replies(sink), InboundMessage::Reply { reply, .. }) => {
                sink.deliver(Received::Value(reply))
            }
            (RecordSink::Replies(sink), InboundMessage::Error { message, .. }) => {
                sink.deliver(Received::Value(Reply::Err(ReplyError {
                    payload: message.into_bytes(),
                    encoding: Some("text/plain".to_string()),
                })))
            }
            (RecordSink::Matching(sink), InboundMessage::MatchingStatus { matching, .. }) => {
                sink.deliver(Received::Value(MatchingStatus { matching }))
            }
            (_, InboundMessage::Error { id, message }) => {
                warn!(id = ?id, message = %message, "Broker rejected operation");
            }
            (sink, message) => {
                sink.malformed(format!("Unexpected {} envelope", message.kind()));
            }
        }
    }

    /// Mark closed and disconnect every pending operation.
    fn shutdown(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(url = %self.link.url(), reason = reason, "Session closed");
        }

        let records = self.registry().drain();
        for (id, record) in records {
            debug!(id = %id, kind = record.kind.as_str(), "Disconnecting pending operation");
            record.close();
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let records = self.registry().drain();
        for (_, record) in records {
            record.close();
        }
    }
}
